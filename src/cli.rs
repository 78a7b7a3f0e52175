//! Command-line arguments.

use std::path::PathBuf;
use clap::Parser;

use crate::utils::ModelFormat;

/// LIMOS: Low Impact Model Optimization System
#[derive(Debug, Parser)]
#[command(name = "LIMOS", bin_name = "limos", version = concat!("v", env!("CARGO_PKG_VERSION")))]
pub struct Cli {
    /// Path to the input model file
    #[arg(long)]
    pub model: PathBuf,

    /// Format of the input model
    #[arg(long, value_enum, ignore_case = true)]
    pub format: ModelFormat,

    /// Directory to save the optimized model
    #[arg(long, default_value = "outputs/")]
    pub output: PathBuf,

    /// JSON file with per-format optimization settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the optimization report as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn output_defaults_to_outputs_dir() {
        let cli = Cli::try_parse_from(["limos", "--model", "m.onnx", "--format", "onnx"]).unwrap();
        assert_eq!(cli.output, PathBuf::from("outputs/"));
        assert_eq!(cli.format, ModelFormat::Onnx);
        assert!(!cli.json);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn format_is_case_insensitive() {
        let cli = Cli::try_parse_from(["limos", "--model", "m.pt", "--format", "TORCH", "-vv"]).unwrap();
        assert_eq!(cli.format, ModelFormat::Torch);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(Cli::try_parse_from(["limos", "--model", "m.h5", "--format", "keras"]).is_err());
    }

    #[test]
    fn model_and_format_are_required() {
        assert!(Cli::try_parse_from(["limos", "--format", "onnx"]).is_err());
        assert!(Cli::try_parse_from(["limos", "--model", "m.onnx"]).is_err());
    }
}
