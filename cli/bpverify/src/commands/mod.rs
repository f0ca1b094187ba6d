//! CLI commands.

mod list;
mod probe;
mod run;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bpverify_harness::platform::CfCli;
use bpverify_harness::{CapabilityArea, HarnessConfig, PollConfig, RunMode};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::output::OutputFormat;

/// bpverify - Verify a buildpack by deploying fixture apps to a platform.
#[derive(Debug, Parser)]
#[command(name = "bpverify")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Log format for diagnostics on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "BPV_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(flatten)]
    harness: HarnessArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scenario catalog against the platform.
    Run(run::RunCommand),

    /// List catalog scenarios.
    List(list::ListCommand),

    /// Show the platform capabilities the harness would use.
    Probe(probe::ProbeCommand),

    /// Show CLI version.
    Version,
}

/// Harness settings shared by every command.
#[derive(Debug, Args)]
struct HarnessArgs {
    /// Platform CLI binary.
    #[arg(long, global = true, env = "BPV_CF_BIN", default_value = "cf")]
    cf_bin: String,

    /// Buildpack to stage fixtures with.
    #[arg(long, global = true, env = "BPV_BUILDPACK", default_value = "nodejs_buildpack")]
    buildpack: String,

    /// Directory containing one subdirectory per fixture.
    #[arg(long, global = true, env = "BPV_FIXTURES_DIR", default_value = "fixtures")]
    fixtures_dir: PathBuf,

    /// Per-assertion poll timeout in milliseconds.
    #[arg(long, global = true, env = "BPV_POLL_TIMEOUT_MS", default_value_t = 10_000)]
    poll_timeout_ms: u64,

    /// Poll interval in milliseconds.
    #[arg(long, global = true, env = "BPV_POLL_INTERVAL_MS", default_value_t = 100)]
    poll_interval_ms: u64,

    /// Whole-scenario timeout in seconds.
    #[arg(long, global = true, env = "BPV_SCENARIO_TIMEOUT_SECS", default_value_t = 900)]
    scenario_timeout_secs: u64,

    /// Packet-capture command used for network isolation checks.
    #[arg(long, global = true, env = "BPV_CAPTURE_COMMAND")]
    capture_command: Option<String>,

    /// Proxy access log used for proxy checks.
    #[arg(long, global = true, env = "BPV_PROXY_LOG")]
    proxy_log: Option<PathBuf>,
}

impl HarnessArgs {
    fn config(&self) -> HarnessConfig {
        HarnessConfig {
            cf_bin: self.cf_bin.clone(),
            buildpack: self.buildpack.clone(),
            fixtures_dir: self.fixtures_dir.clone(),
            poll: PollConfig::new(
                Duration::from_millis(self.poll_timeout_ms),
                Duration::from_millis(self.poll_interval_ms),
            ),
            scenario_timeout: Duration::from_secs(self.scenario_timeout_secs),
            capture_command: self.capture_command.clone(),
            proxy_log: self.proxy_log.clone(),
            ..HarnessConfig::default()
        }
    }
}

impl Cli {
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            config: self.harness.config(),
            format: self.format,
        };

        match self.command {
            Commands::Run(cmd) => cmd.run(ctx).await,
            Commands::List(cmd) => cmd.run(ctx),
            Commands::Probe(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("bpverify {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: HarnessConfig,
    pub format: OutputFormat,
}

impl CommandContext {
    /// The platform described by the configuration.
    pub fn platform(&self) -> Arc<CfCli> {
        Arc::new(CfCli::new(&self.config.cf_bin, &self.config.buildpack))
    }
}

fn parse_area(s: &str) -> Result<CapabilityArea, String> {
    s.parse().map_err(|e: bpverify_harness::HarnessError| e.to_string())
}

fn mode_label(mode: Option<RunMode>) -> String {
    mode.map_or_else(|| "any".to_string(), |m| m.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "bpverify",
            "run",
            "--area",
            "vendoring",
            "--dry-run",
            "--format",
            "json",
            "--poll-timeout-ms",
            "500",
        ])
        .unwrap();

        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Run(_)));
        assert_eq!(cli.harness.config().poll.timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_unknown_area_rejected() {
        assert!(Cli::try_parse_from(["bpverify", "list", "--area", "nope"]).is_err());
    }

    #[test]
    fn test_mode_label() {
        assert_eq!(mode_label(None), "any");
        assert_eq!(mode_label(Some(RunMode::Cached)), "cached");
    }
}
