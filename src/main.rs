use std::process::ExitCode;
use anyhow::Context;
use clap::Parser;
use tracing::error;

use limos_lib::cli::Cli;
use limos_lib::commands::optimize_model;
use limos_lib::utils::init_logging;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let result = optimize_model(cli)?;
    if cli.json {
        let report = serde_json::to_string_pretty(&result).context("Failed to serialize report")?;
        println!("{}", report);
    }
    Ok(())
}
