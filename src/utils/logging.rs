//! Leveled text logging for the CLI.

use std::io::IsTerminal;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Maps the number of `-v` flags to a maximum level.
pub fn level_for_verbosity(verbose: u8) -> Level {
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Installs the global subscriber.
///
/// Logs go to stderr so `--json` output on stdout stays parseable.
/// `RUST_LOG` takes precedence over the verbosity flag. Calling this twice is
/// harmless; the second install is ignored.
pub fn init_logging(verbose: u8) {
    let default_level = level_for_verbosity(verbose);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_lowercase()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

/// Info-level line prefixed with `SUCCESS:`.
pub fn log_success(message: &str) {
    info!("SUCCESS: {}", message);
}
