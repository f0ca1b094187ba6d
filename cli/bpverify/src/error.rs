//! Error handling and display for the CLI.

use bpverify_harness::error::PlatformError;
use bpverify_harness::HarnessError;
use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{failed} of {total} scenarios failed")]
    ScenariosFailed { failed: usize, total: usize },

    #[error("No scenarios match the given filter")]
    NothingSelected,

    #[error(transparent)]
    Harness(#[from] HarnessError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::ScenariosFailed { .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: Rerun a single scenario with `bpverify run --filter NAME` and RUST_LOG=debug."
                        .yellow()
                );
            }
            CliError::NothingSelected => {
                eprintln!("\n{}", "Hint: Run `bpverify list` to see scenario names.".yellow());
            }
            CliError::Harness(HarnessError::Platform(PlatformError::Spawn { program, .. })) => {
                eprintln!(
                    "\n{}",
                    format!("Hint: Is `{program}` installed? Set BPV_CF_BIN or --cf-bin.").yellow()
                );
            }
            CliError::Harness(HarnessError::Platform(PlatformError::CommandFailed { .. })) => {
                eprintln!(
                    "\n{}",
                    "Hint: Check that the platform CLI is logged in and targeting a space.".yellow()
                );
            }
            _ => {}
        }
    }
}
