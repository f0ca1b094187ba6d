//! Per-scenario and per-run results.

use std::time::Duration;

use bpverify_id::{DeploymentName, RunId};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::scenario::{CapabilityArea, RunMode};

/// How a scenario ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Every applicable check held. `notes` lists checks that did not apply.
    Passed { notes: Vec<String> },
    Failed { diagnostic: String },
    /// Not run; no deployment was created.
    Skipped { reason: String },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed { .. } => "passed",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub area: CapabilityArea,
    pub fixture: String,

    /// Set when a deployment was created for the scenario.
    pub deployment: Option<DeploymentName>,

    #[serde(flatten)]
    pub outcome: Outcome,

    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, Outcome::Passed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub run_id: RunId,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub results: Vec<ScenarioReport>,
}

impl SuiteReport {
    fn count(&self, label: &str) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome.label() == label)
            .count()
    }

    pub fn passed(&self) -> usize {
        self.count("passed")
    }

    pub fn failed(&self) -> usize {
        self.count("failed")
    }

    pub fn skipped(&self) -> usize {
        self.count("skipped")
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScenarioReport> {
        self.results.iter().filter(|r| r.outcome.is_failed())
    }

    /// True when nothing failed. Skips do not count against the run.
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, outcome: Outcome) -> ScenarioReport {
        ScenarioReport {
            name: name.to_string(),
            area: CapabilityArea::Vendoring,
            fixture: "simple_app".to_string(),
            deployment: None,
            outcome,
            duration: Duration::from_millis(1500),
        }
    }

    #[test]
    fn test_counts_and_success() {
        let mut suite = SuiteReport {
            run_id: RunId::new(),
            mode: RunMode::Uncached,
            started_at: Utc::now(),
            results: vec![
                report("a", Outcome::Passed { notes: vec![] }),
                report(
                    "b",
                    Outcome::Skipped {
                        reason: "pending".to_string(),
                    },
                ),
            ],
        };
        assert_eq!((suite.passed(), suite.failed(), suite.skipped()), (1, 0, 1));
        assert!(suite.is_success());

        suite.results.push(report(
            "c",
            Outcome::Failed {
                diagnostic: "boom".to_string(),
            },
        ));
        assert!(!suite.is_success());
        assert_eq!(suite.failures().map(|r| r.name.as_str()).collect::<Vec<_>>(), ["c"]);
    }

    #[test]
    fn test_json_shape() {
        let value = serde_json::to_value(report(
            "a",
            Outcome::Failed {
                diagnostic: "boom".to_string(),
            },
        ))
        .unwrap();

        assert_eq!(value["status"], "failed");
        assert_eq!(value["diagnostic"], "boom");
        assert_eq!(value["area"], "vendoring");
        assert_eq!(value["duration_ms"], 1500);
        assert!(value["deployment"].is_null());
    }
}
