use std::fs;
use std::path::{Path, PathBuf};
use crate::utils::{OptimizerError, OptimizerResult};

/// Get file size in bytes
pub fn get_file_size(path: impl AsRef<Path>) -> OptimizerResult<u64> {
    fs::metadata(path.as_ref())
        .map(|m| m.len())
        .map_err(|e| OptimizerError::io(format!("Failed to get file size: {}", e)))
}

/// Create a directory and all its parents
pub fn create_dir_all(path: impl AsRef<Path>) -> OptimizerResult<()> {
    fs::create_dir_all(path.as_ref()).map_err(|e| {
        OptimizerError::io(format!(
            "Cannot create output directory {}: {}",
            path.as_ref().display(),
            e
        ))
    })
}

/// Read a whole model file into memory
pub fn read_model(path: impl AsRef<Path>) -> OptimizerResult<Vec<u8>> {
    fs::read(path.as_ref()).map_err(|e| {
        OptimizerError::io(format!("Cannot read {}: {}", path.as_ref().display(), e))
    })
}

/// Writes `bytes` to a hidden sibling of `path` and renames it into place,
/// so a failed write never leaves a truncated model behind.
pub fn write_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> OptimizerResult<()> {
    let path = path.as_ref();
    let tmp = staging_path(path);

    if let Err(e) = fs::write(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(OptimizerError::io(format!("Cannot write {}: {}", tmp.display(), e)));
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        OptimizerError::io(format!("Cannot move output into {}: {}", path.display(), e))
    })
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    path.with_file_name(format!(".{name}.partial"))
}

/// Last path component, or the full string when there is none
pub fn extract_filename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("optimized_model.onnx");
        fs::write(&target, b"old").unwrap();

        write_atomic(&target, b"new contents").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new contents");
        assert!(!staging_path(&target).exists());
    }

    #[test]
    fn write_atomic_fails_without_parent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("optimized_model.pt");
        assert!(write_atomic(&target, b"x").is_err());
        assert!(!target.exists());
    }

    #[test]
    fn extracts_file_name() {
        assert_eq!(extract_filename("/models/resnet.onnx"), "resnet.onnx");
        assert_eq!(extract_filename("plain"), "plain");
    }
}
