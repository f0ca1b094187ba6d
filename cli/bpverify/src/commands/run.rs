//! Run the scenario catalog.

use anyhow::Result;
use bpverify_harness::platform::Platform;
use bpverify_harness::{
    catalog, CapabilityArea, ExecutionController, HarnessError, Outcome, PlannedScenario,
    RunMode, SuiteReport,
};
use clap::Args;
use serde::Serialize;
use tabled::Tabled;
use tracing::info;

use crate::error::CliError;
use crate::output::{print_info, print_json, print_output, print_success, status_label, OutputFormat};

use super::{parse_area, CommandContext};

/// Run scenarios.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// The buildpack under test is the cached (offline) variant.
    #[arg(long, env = "BPV_CACHED")]
    cached: bool,

    /// Only run scenarios whose name contains this text.
    #[arg(long)]
    filter: Option<String>,

    /// Only run scenarios in this capability area.
    #[arg(long, value_parser = parse_area)]
    area: Option<CapabilityArea>,

    /// Scenarios to run concurrently.
    #[arg(long, env = "BPV_PARALLELISM", default_value_t = 1)]
    parallelism: usize,

    /// Buildpack version every deployment must have been staged with.
    #[arg(long, env = "BPV_BUILDPACK_VERSION")]
    buildpack_version: Option<String>,

    /// Probe the platform and print what would run, without deploying.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct ResultRow {
    #[tabled(rename = "Scenario")]
    name: String,

    #[tabled(rename = "Area")]
    area: String,

    #[tabled(rename = "Status")]
    status: String,

    #[tabled(rename = "Time")]
    duration: String,

    #[tabled(rename = "Detail")]
    detail: String,
}

#[derive(Debug, Serialize, Tabled)]
struct PlanRow {
    #[tabled(rename = "Scenario")]
    name: String,

    #[tabled(rename = "Action")]
    action: String,

    #[tabled(rename = "Reason")]
    reason: String,
}

impl RunCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let mut config = ctx.config.clone();
        config.mode = RunMode::from_cached_flag(self.cached);
        config.parallelism = self.parallelism;
        config.buildpack_version = self.buildpack_version.clone();
        config.validate().map_err(CliError::from)?;

        let catalog = catalog::nodejs()
            .map_err(CliError::from)?
            .filter(self.filter.as_deref(), self.area);
        if catalog.is_empty() {
            return Err(CliError::NothingSelected.into());
        }

        let platform = ctx.platform();
        let capabilities = platform
            .capabilities()
            .await
            .map_err(|e| CliError::from(HarnessError::from(e)))?;
        info!(
            api_version = ?capabilities.api_version,
            tasks = capabilities.tasks,
            symlinks = capabilities.symlinks,
            mode = %config.mode,
            "platform capabilities resolved"
        );

        let controller = ExecutionController::new(platform, config.settings(capabilities))
            .with_observer(config.observer());

        if self.dry_run {
            print_plan(&controller.plan(catalog.scenarios()), ctx.format);
            return Ok(());
        }

        let report = controller.run(catalog.scenarios()).await;
        print_report(&report, ctx.format);

        if !report.is_success() {
            return Err(CliError::ScenariosFailed {
                failed: report.failed(),
                total: report.results.len(),
            }
            .into());
        }
        Ok(())
    }
}

fn print_plan(plan: &[PlannedScenario], format: OutputFormat) {
    let rows: Vec<PlanRow> = plan
        .iter()
        .map(|p| PlanRow {
            name: p.name.clone(),
            action: if p.skip_reason.is_some() { "skip" } else { "run" }.to_string(),
            reason: p.skip_reason.clone().unwrap_or_default(),
        })
        .collect();

    match format {
        OutputFormat::Json => print_json(&rows),
        OutputFormat::Table => {
            let rows: Vec<PlanRow> = rows
                .into_iter()
                .map(|r| PlanRow {
                    action: status_label(&r.action),
                    ..r
                })
                .collect();
            print_output(&rows, format);
        }
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().to_string()
}

fn print_report(report: &SuiteReport, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json(report);
        return;
    }

    let rows: Vec<ResultRow> = report
        .results
        .iter()
        .map(|r| ResultRow {
            name: r.name.clone(),
            area: r.area.to_string(),
            status: status_label(r.outcome.label()),
            duration: format!("{:.1}s", r.duration.as_secs_f64()),
            detail: match &r.outcome {
                Outcome::Passed { notes } if notes.is_empty() => String::new(),
                Outcome::Passed { notes } => format!("{} check(s) not applicable", notes.len()),
                Outcome::Failed { diagnostic } => first_line(diagnostic),
                Outcome::Skipped { reason } => reason.clone(),
            },
        })
        .collect();
    print_output(&rows, format);

    for failure in report.failures() {
        if let Outcome::Failed { diagnostic } = &failure.outcome {
            println!();
            print_info(&format!("{} ({})", failure.name, failure.fixture));
            println!("{diagnostic}");
        }
    }

    println!();
    let summary = format!(
        "run {} ({} mode): {} passed, {} failed, {} skipped",
        report.run_id,
        report.mode,
        report.passed(),
        report.failed(),
        report.skipped()
    );
    if report.is_success() {
        print_success(&summary);
    } else {
        print_info(&summary);
    }
}
