//! List catalog scenarios.

use anyhow::Result;
use bpverify_harness::scenario::Expectation;
use bpverify_harness::{catalog, CapabilityArea, Scenario};
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::print_output;

use super::{mode_label, parse_area, CommandContext};

/// List scenarios.
#[derive(Debug, Args)]
pub struct ListCommand {
    /// Only list scenarios in this capability area.
    #[arg(long, value_parser = parse_area)]
    area: Option<CapabilityArea>,
}

#[derive(Debug, Serialize, Tabled)]
struct ScenarioRow {
    #[tabled(rename = "Scenario")]
    name: String,

    #[tabled(rename = "Area")]
    area: String,

    #[tabled(rename = "Fixture")]
    fixture: String,

    #[tabled(rename = "Staging")]
    expect: String,

    #[tabled(rename = "Mode")]
    mode: String,

    #[tabled(rename = "Needs")]
    needs: String,

    #[tabled(rename = "Checks")]
    checks: usize,
}

impl From<&Scenario> for ScenarioRow {
    fn from(s: &Scenario) -> Self {
        let mut needs = Vec::new();
        if s.requires.tasks {
            needs.push("tasks");
        }
        if s.requires.symlinks {
            needs.push("symlinks");
        }
        if s.pending {
            needs.push("pending");
        }

        Self {
            name: s.name.clone(),
            area: s.area.to_string(),
            fixture: s.fixture.clone(),
            expect: match s.expect {
                Expectation::Success => "succeeds",
                Expectation::Failure => "fails",
            }
            .to_string(),
            mode: mode_label(s.requires.mode),
            needs: if needs.is_empty() {
                "-".to_string()
            } else {
                needs.join(", ")
            },
            checks: s.checks.len(),
        }
    }
}

impl ListCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let catalog = catalog::nodejs()
            .map_err(CliError::from)?
            .filter(None, self.area);
        let rows: Vec<ScenarioRow> = catalog.scenarios().iter().map(ScenarioRow::from).collect();
        print_output(&rows, ctx.format);
        Ok(())
    }
}
