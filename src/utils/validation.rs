use std::path::Path;
use tracing::warn;
use crate::core::{ModelSettings, ModelTask};
use crate::utils::{OptimizerResult, ValidationError};

/// Validates a model optimization task
pub fn validate_task(task: &ModelTask) -> OptimizerResult<()> {
    validate_input_path(&task.input_path)?;
    validate_output_dir(&task.output_dir)?;
    validate_settings(&task.settings)?;

    if let Some(ext) = task.input_path.extension().and_then(|e| e.to_str()) {
        if !task.format.matches_extension(ext) {
            warn!(
                "Input extension '.{}' is unusual for {} models; continuing",
                ext, task.format
            );
        }
    }
    Ok(())
}

/// Validates that the input model exists and is a regular file
pub fn validate_input_path(path: &Path) -> OptimizerResult<()> {
    if !path.exists() {
        return Err(ValidationError::path_not_found(path).into());
    }

    if !path.is_file() {
        return Err(ValidationError::not_a_file(path).into());
    }

    Ok(())
}

/// Validates the output directory.
///
/// A missing directory is fine (it is created before writing); an existing
/// path that is not a directory is not.
pub fn validate_output_dir(path: &Path) -> OptimizerResult<()> {
    if path.exists() && !path.is_dir() {
        return Err(ValidationError::not_a_directory(path).into());
    }
    Ok(())
}

/// Validates model optimization settings
pub fn validate_settings(settings: &ModelSettings) -> OptimizerResult<()> {
    if settings.torch.min_rank == 0 {
        return Err(ValidationError::settings("torch.min_rank must be at least 1").into());
    }

    let passes = &settings.onnx.passes;
    for (i, pass) in passes.iter().enumerate() {
        if passes[..i].contains(pass) {
            return Err(ValidationError::settings(format!(
                "onnx pass listed twice: {}", pass
            ))
            .into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::onnx::OnnxPass;

    #[test]
    fn missing_input_is_not_found() {
        let err = validate_input_path(Path::new("/definitely/not/here.pt")).unwrap_err();
        assert!(err.is_missing_input());
    }

    #[test]
    fn directory_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_input_path(dir.path()).unwrap_err();
        assert!(!err.is_missing_input());
        assert!(err.to_string().contains("Not a file"));
    }

    #[test]
    fn output_dir_may_be_missing_but_not_a_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_output_dir(&dir.path().join("fresh")).is_ok());

        let file = dir.path().join("occupied");
        std::fs::write(&file, b"").unwrap();
        assert!(validate_output_dir(&file).is_err());
    }

    #[test]
    fn settings_reject_zero_rank_and_duplicate_passes() {
        let mut settings = ModelSettings::default();
        assert!(validate_settings(&settings).is_ok());

        settings.torch.min_rank = 0;
        assert!(validate_settings(&settings).is_err());

        let mut settings = ModelSettings::default();
        settings.onnx.passes = vec![OnnxPass::EliminateIdentity, OnnxPass::EliminateIdentity];
        assert!(validate_settings(&settings).is_err());
    }
}
