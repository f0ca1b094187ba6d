//! Show the platform's capability descriptor.

use anyhow::Result;
use bpverify_harness::platform::{Capabilities, Platform};
use bpverify_harness::HarnessError;
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{display_option, print_json, print_output, OutputFormat};

use super::CommandContext;

/// Probe the platform.
#[derive(Debug, Args)]
pub struct ProbeCommand {}

#[derive(Debug, Serialize, Tabled)]
struct CapabilityRow {
    #[tabled(rename = "API version", display = "display_option")]
    api_version: Option<String>,

    #[tabled(rename = "Tasks")]
    tasks: bool,

    #[tabled(rename = "Symlinks")]
    symlinks: bool,
}

impl From<Capabilities> for CapabilityRow {
    fn from(caps: Capabilities) -> Self {
        Self {
            api_version: caps.api_version.map(|v| v.to_string()),
            tasks: caps.tasks,
            symlinks: caps.symlinks,
        }
    }
}

impl ProbeCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let capabilities = ctx
            .platform()
            .capabilities()
            .await
            .map_err(|e| CliError::from(HarnessError::from(e)))?;

        match ctx.format {
            OutputFormat::Json => print_json(&capabilities),
            OutputFormat::Table => print_output(&[CapabilityRow::from(capabilities)], ctx.format),
        }
        Ok(())
    }
}
