pub mod error;
pub mod validation;
pub mod formats;
pub mod fs;
pub mod logging;

pub use error::{OptimizerError, OptimizerResult, PathError, ValidationError};
pub use validation::{validate_task, validate_input_path, validate_output_dir, validate_settings};
pub use formats::{ModelFormat, OUTPUT_STEM};
pub use fs::{
    get_file_size,
    create_dir_all,
    read_model,
    write_atomic,
    extract_filename,
};
pub use logging::{init_logging, log_success};
