//! Model processing: one handler per format plus the dispatcher.
//!
//! - [`torch`]: int8 weight quantization of `torch.save` archives
//! - [`onnx`]: graph optimization passes over `ModelProto`
//! - [`tflite`]: flatbuffer validation and re-save

mod optimizer;
pub mod onnx;
pub mod tflite;
pub mod torch;

pub use optimizer::{optimize_model, ModelOptimizer};
