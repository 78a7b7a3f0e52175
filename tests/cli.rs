//! End-to-end tests that drive the `limos` binary.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output};

use limos_lib::processing::onnx::proto::{GraphProto, ModelProto, NodeProto, ValueInfoProto};
use prost::Message;

fn limos(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_limos"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn path(p: &Path) -> &str {
    p.to_str().unwrap()
}

fn onnx_model() -> Vec<u8> {
    let node = |op: &str, i: &str, o: &str| NodeProto {
        op_type: op.to_string(),
        input: vec![i.to_string()],
        output: vec![o.to_string()],
        ..Default::default()
    };
    ModelProto {
        ir_version: 8,
        graph: Some(GraphProto {
            name: "g".to_string(),
            node: vec![node("Identity", "x", "a"), node("Relu", "a", "y")],
            input: vec![ValueInfoProto { name: "x".to_string(), ..Default::default() }],
            output: vec![ValueInfoProto { name: "y".to_string(), ..Default::default() }],
            ..Default::default()
        }),
        ..Default::default()
    }
    .encode_to_vec()
}

/// A TFLite `Model` root carrying only its schema version.
fn tflite_model() -> Vec<u8> {
    let mut fbb = flatbuffers::FlatBufferBuilder::new();
    let start = fbb.start_table();
    fbb.push_slot::<u32>(4, 3, 0); // Model.version
    let root = fbb.end_table(start);
    fbb.finish(root, Some("TFL3"));
    fbb.finished_data().to_vec()
}

/// A `torch.save` archive holding an empty state dict.
fn torch_model() -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, data) in [
        ("archive/data.pkl", &b"\x80\x02}q\x00."[..]),
        ("archive/byteorder", &b"little"[..]),
        ("archive/version", &b"3\n"[..]),
    ] {
        zip.start_file(name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

#[test]
fn missing_model_exits_one_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let result = limos(&[
        "--model", path(&dir.path().join("absent.onnx")),
        "--format", "onnx",
        "--output", path(&out),
    ]);

    assert_eq!(result.status.code(), Some(1));
    assert!(!out.exists());
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("Starting LIMOS Optimization Pipeline"));
    assert!(stderr.contains("File not found"));
}

#[test]
fn each_format_writes_its_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let cases = [
        ("torch", "model.pt", torch_model(), "optimized_model.pt"),
        ("onnx", "model.onnx", onnx_model(), "optimized_model.onnx"),
        ("tflite", "model.tflite", tflite_model(), "optimized_model.tflite"),
    ];

    for (format, input, bytes, expected) in cases {
        let model = dir.path().join(input);
        std::fs::write(&model, &bytes).unwrap();
        let out = dir.path().join(format);

        let result = limos(&["--model", path(&model), "--format", format, "--output", path(&out)]);
        assert!(result.status.success(), "{}: {}", format, String::from_utf8_lossy(&result.stderr));
        assert!(out.join(expected).is_file(), "{} missing", expected);

        let names: Vec<_> = std::fs::read_dir(&out).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names.len(), 1, "{}: stray files {:?}", format, names);
        assert!(String::from_utf8_lossy(&result.stderr).contains("SUCCESS: Optimization completed successfully."));
    }
}

#[test]
fn tflite_is_copied_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("m.tflite");
    std::fs::write(&model, tflite_model()).unwrap();

    let result = limos(&["--model", path(&model), "--format", "tflite", "--output", path(dir.path())]);
    assert!(result.status.success());
    let written = std::fs::read(dir.path().join("optimized_model.tflite")).unwrap();
    assert_eq!(written, tflite_model());
}

#[test]
fn onnx_identity_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("m.onnx");
    std::fs::write(&model, onnx_model()).unwrap();

    let result = limos(&["--model", path(&model), "--format", "onnx", "--output", path(dir.path())]);
    assert!(result.status.success());

    let written = std::fs::read(dir.path().join("optimized_model.onnx")).unwrap();
    let graph = ModelProto::decode(written.as_slice()).unwrap().graph.unwrap();
    assert_eq!(graph.node.len(), 1);
    assert_eq!(graph.node[0].op_type, "Relu");
    assert_eq!(graph.node[0].input, vec!["x".to_string()]);
}

#[test]
fn unknown_format_is_rejected_before_running() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("m.h5");
    std::fs::write(&model, b"keras").unwrap();
    let out = dir.path().join("out");

    let result = limos(&["--model", path(&model), "--format", "keras", "--output", path(&out)]);
    assert!(!result.status.success());
    assert!(!out.exists());
}

#[test]
fn handler_failure_exits_nonzero_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("broken.onnx");
    std::fs::write(&model, [0xffu8, 0xff, 0xff, 0xff, 0x0f]).unwrap();
    let out = dir.path().join("out");

    let result = limos(&["--model", path(&model), "--format", "onnx", "--output", path(&out)]);
    assert_eq!(result.status.code(), Some(1));
    assert!(!out.join("optimized_model.onnx").exists());
    assert!(!String::from_utf8_lossy(&result.stderr).contains("SUCCESS"));
}

#[test]
fn json_report_goes_to_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("m.onnx");
    std::fs::write(&model, onnx_model()).unwrap();

    let result = limos(&[
        "--model", path(&model),
        "--format", "onnx",
        "--output", path(dir.path()),
        "--json",
    ]);
    assert!(result.status.success());

    let report: serde_json::Value = serde_json::from_slice(&result.stdout).unwrap();
    assert_eq!(report["modelFormat"], "onnx");
    assert_eq!(report["details"]["format"], "onnx");
    assert_eq!(report["details"]["nodesBefore"], 2);
    assert_eq!(report["details"]["nodesAfter"], 1);
}

#[test]
fn config_file_selects_passes() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("m.onnx");
    std::fs::write(&model, onnx_model()).unwrap();
    let config = dir.path().join("settings.json");
    std::fs::write(&config, r#"{ "onnx": { "passes": [] } }"#).unwrap();

    let result = limos(&[
        "--model", path(&model),
        "--format", "onnx",
        "--output", path(dir.path()),
        "--config", path(&config),
    ]);
    assert!(result.status.success());

    let written = std::fs::read(dir.path().join("optimized_model.onnx")).unwrap();
    assert_eq!(ModelProto::decode(written.as_slice()).unwrap().graph.unwrap().node.len(), 2);
}

#[test]
fn version_flag_prints_version() {
    let result = limos(&["--version"]);
    assert!(result.status.success());
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains(concat!("v", env!("CARGO_PKG_VERSION"))));
}
