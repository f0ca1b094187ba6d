//! Execution controller.
//!
//! Runs scenarios against the platform, one fresh deployment each. A
//! scenario's deployment is destroyed on every exit path: pass, failure,
//! timeout, and panic. Skipped scenarios never create one.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bpverify_id::{DeploymentName, RunId};
use chrono::Utc;
use futures_util::{FutureExt, StreamExt};
use tracing::{info, warn};

use crate::assertions::{self, AssertionFailure, Verdict};
use crate::driver::{Deployment, DeploymentDriver, Fixture};
use crate::error::StageError;
use crate::observer::{unobserved_window, ObserverScope, TrafficLog, TrafficObserver};
use crate::platform::{Capabilities, Platform};
use crate::poll::PollConfig;
use crate::report::{Outcome, ScenarioReport, SuiteReport};
use crate::scenario::{Check, Expectation, RunMode, Scenario};

/// Suite-wide settings, resolved once before any scenario runs.
#[derive(Debug, Clone)]
pub struct SuiteSettings {
    pub mode: RunMode,
    pub capabilities: Capabilities,
    pub buildpack_version: Option<String>,
    pub poll: PollConfig,
    pub scenario_timeout: Duration,
    pub parallelism: usize,
    pub fixtures_dir: PathBuf,
    pub proxy_configured: bool,
}

/// What a run would do with one scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedScenario {
    pub name: String,
    pub skip_reason: Option<String>,
}

pub struct ExecutionController {
    driver: DeploymentDriver,
    settings: SuiteSettings,
    observer: Option<Arc<dyn TrafficObserver>>,
}

impl ExecutionController {
    pub fn new(platform: Arc<dyn Platform>, settings: SuiteSettings) -> Self {
        Self {
            driver: DeploymentDriver::new(platform, settings.capabilities),
            settings,
            observer: None,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Option<Arc<dyn TrafficObserver>>) -> Self {
        self.observer = observer;
        self
    }

    pub fn settings(&self) -> &SuiteSettings {
        &self.settings
    }

    fn skip_reason(&self, scenario: &Scenario) -> Option<String> {
        let mode = self.settings.mode;
        scenario
            .skip_reason(mode, &self.settings.capabilities)
            .or_else(|| {
                if !scenario.needs_traffic(mode, self.settings.proxy_configured) {
                    return None;
                }
                match &self.observer {
                    None => Some("requires a traffic observer (none configured)".to_string()),
                    Some(observer)
                        if scenario.needs_direct_traffic(mode) && !observer.sees_direct() =>
                    {
                        Some("requires a packet-capture observer (BPV_CAPTURE_COMMAND)".to_string())
                    }
                    Some(_) => None,
                }
            })
    }

    /// Which scenarios would run and which would be skipped. Deploys nothing.
    pub fn plan(&self, scenarios: &[Scenario]) -> Vec<PlannedScenario> {
        scenarios
            .iter()
            .map(|s| PlannedScenario {
                name: s.name.clone(),
                skip_reason: self.skip_reason(s),
            })
            .collect()
    }

    /// Runs every scenario and collects the results in catalog order.
    pub async fn run(&self, scenarios: &[Scenario]) -> SuiteReport {
        let run_id = RunId::new();
        let started_at = Utc::now();
        info!(
            run_id = %run_id,
            mode = %self.settings.mode,
            scenarios = scenarios.len(),
            parallelism = self.settings.parallelism,
            "starting run"
        );

        let results: Vec<ScenarioReport> = futures_util::stream::iter(scenarios)
            .map(|scenario| self.run_scenario(scenario))
            .buffered(self.settings.parallelism.max(1))
            .collect()
            .await;

        let report = SuiteReport {
            run_id,
            mode: self.settings.mode,
            started_at,
            results,
        };
        info!(
            run_id = %report.run_id,
            passed = report.passed(),
            failed = report.failed(),
            skipped = report.skipped(),
            "run finished"
        );
        report
    }

    /// Runs one scenario under the scenario timeout. Always leaves the
    /// platform without the scenario's deployment.
    pub async fn run_scenario(&self, scenario: &Scenario) -> ScenarioReport {
        let started = Instant::now();
        let report = |deployment: Option<DeploymentName>, outcome: Outcome| ScenarioReport {
            name: scenario.name.clone(),
            area: scenario.area,
            fixture: scenario.fixture.clone(),
            deployment,
            outcome,
            duration: started.elapsed(),
        };

        if let Some(reason) = self.skip_reason(scenario) {
            info!(scenario = %scenario.name, reason = %reason, "scenario skipped");
            return report(None, Outcome::Skipped { reason });
        }

        let fixture = Fixture::new(&self.settings.fixtures_dir, &scenario.fixture);
        let mut deployment = self.driver.create(fixture, scenario.env.clone());
        let name = *deployment.name();
        info!(scenario = %scenario.name, deployment = %name, "scenario started");

        let timeout = self.settings.scenario_timeout;
        let exercised = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(self.exercise(scenario, &mut deployment)).catch_unwind(),
        )
        .await;

        let outcome = match exercised {
            Ok(Ok(Ok(notes))) => Outcome::Passed { notes },
            Ok(Ok(Err(failure))) => Outcome::Failed {
                diagnostic: failure.to_string(),
            },
            Ok(Err(panic)) => Outcome::Failed {
                diagnostic: format!("scenario panicked: {}", panic_message(panic.as_ref())),
            },
            Err(_) => Outcome::Failed {
                diagnostic: format!("scenario timed out after {timeout:?}"),
            },
        };

        if let Err(e) = self.driver.destroy(&mut deployment).await {
            warn!(scenario = %scenario.name, deployment = %name, error = %e, "failed to destroy deployment");
        }

        match &outcome {
            Outcome::Failed { diagnostic } => {
                warn!(scenario = %scenario.name, deployment = %name, diagnostic = %diagnostic, "scenario failed");
            }
            _ => info!(scenario = %scenario.name, deployment = %name, "scenario passed"),
        }
        report(Some(name), outcome)
    }

    async fn exercise(
        &self,
        scenario: &Scenario,
        deployment: &mut Deployment,
    ) -> Result<Vec<String>, AssertionFailure> {
        let observed = scenario.needs_traffic(self.settings.mode, self.settings.proxy_configured);
        let (scope, window) = match (&self.observer, observed) {
            (Some(observer), true) => {
                let scope = ObserverScope::install(observer.clone()).await.map_err(|e| {
                    AssertionFailure::new("traffic_observer", "observer to start", e.to_string())
                })?;
                (Some(scope), None)
            }
            _ => (None, Some(unobserved_window().await)),
        };

        let staged = self.driver.stage(deployment).await;
        drop(window);

        let traffic = match scope {
            Some(scope) => Some(scope.collect().await.map_err(|e| {
                AssertionFailure::new("traffic_observer", "observer to collect", e.to_string())
            })?),
            None => None,
        };

        check_staging(scenario.expect, staged, deployment)?;

        let mut notes = Vec::new();
        for check in scenario.checks_for(self.settings.mode) {
            if let Verdict::NotApplicable(reason) =
                self.evaluate(check, deployment, traffic.as_ref()).await?
            {
                info!(scenario = %scenario.name, check = %check.label(), reason = %reason, "check not applicable");
                notes.push(format!("{}: {reason}", check.label()));
            }
        }
        Ok(notes)
    }

    async fn evaluate(
        &self,
        check: &Check,
        deployment: &Deployment,
        traffic: Option<&TrafficLog>,
    ) -> Result<Verdict, AssertionFailure> {
        let poll = self.settings.poll;
        let within = |w: &Option<Duration>| w.map_or(poll, |t| poll.with_timeout(t));
        let logs = deployment.logs();
        let driver = &self.driver;

        match check {
            Check::VersionAppears { pattern } => {
                assertions::version_appears(logs, pattern, poll).await?;
            }
            Check::LogMatches { pattern, within: w } => {
                assertions::log_matches(logs, pattern, within(w)).await?;
            }
            Check::LogContains { needle, within: w } => {
                assertions::log_contains(logs, needle, within(w)).await?;
            }
            Check::BodyContains { path, needle } => {
                assertions::http_body_contains(driver, deployment, path, needle, poll).await?;
            }
            Check::BodyMatches { path, pattern } => {
                assertions::http_body_matches(driver, deployment, path, pattern, poll).await?;
            }
            Check::BodyEquals { path, expected } => {
                assertions::http_body_equals(driver, deployment, path, expected, poll).await?;
            }
            Check::NoOutboundNetwork => {
                assertions::no_outbound_network(traffic.ok_or_else(unobserved)?)?;
            }
            Check::UsedProxyIfConfigured => {
                let empty = TrafficLog::default();
                return assertions::used_proxy(
                    traffic.unwrap_or(&empty),
                    self.settings.proxy_configured,
                );
            }
            Check::BuildpackVersionConfirmed => match &self.settings.buildpack_version {
                Some(version) => {
                    assertions::buildpack_version_confirmed(driver, deployment, version).await?;
                }
                None => {
                    return Ok(Verdict::NotApplicable(
                        "no expected buildpack version configured".to_string(),
                    ))
                }
            },
            Check::FixturePath { relative, is_dir } => {
                assertions::fixture_path(deployment.fixture(), relative, *is_dir)?;
            }
            Check::TaskOutput {
                command,
                pattern,
                within: w,
            } => {
                return assertions::task_output_appears(
                    driver,
                    deployment,
                    command,
                    pattern,
                    within(w),
                )
                .await;
            }
            Check::ModeBranch { .. } => {
                // Resolved by `Scenario::checks_for` before evaluation.
            }
        }
        Ok(Verdict::Held)
    }
}

fn unobserved() -> AssertionFailure {
    AssertionFailure::new(
        "no_outbound_network_during_staging",
        "a recorded traffic log",
        "staging window was not observed",
    )
}

/// Compares the staging result with what the scenario expects.
fn check_staging(
    expect: Expectation,
    staged: Result<(), StageError>,
    deployment: &Deployment,
) -> Result<(), AssertionFailure> {
    match (expect, staged) {
        (Expectation::Success, Ok(())) => Ok(()),
        (Expectation::Failure, Err(StageError::ExitNonZero { .. })) => Ok(()),
        (Expectation::Success, Err(e)) => Err(AssertionFailure::new(
            "stage",
            "staging to succeed",
            format!("{e}\n{}", deployment.logs().plain_snapshot()),
        )),
        (Expectation::Failure, Ok(())) => Err(AssertionFailure::new(
            "stage",
            "staging to fail",
            deployment.logs().plain_snapshot(),
        )),
        (Expectation::Failure, Err(e)) => Err(AssertionFailure::new(
            "stage",
            "the platform to report a failed deployment",
            e.to_string(),
        )),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ScriptedApp, ScriptedPlatform};
    use crate::scenario::CapabilityArea;

    fn settings(mode: RunMode) -> SuiteSettings {
        SuiteSettings {
            mode,
            capabilities: Capabilities::default(),
            buildpack_version: None,
            poll: PollConfig::new(Duration::from_millis(200), Duration::from_millis(10)),
            scenario_timeout: Duration::from_secs(5),
            parallelism: 1,
            fixtures_dir: PathBuf::from("fixtures"),
            proxy_configured: false,
        }
    }

    #[tokio::test]
    async fn test_skipped_scenarios_create_nothing() {
        let platform = Arc::new(ScriptedPlatform::default());
        let controller = ExecutionController::new(platform.clone(), settings(RunMode::Uncached));

        let scenarios = [
            Scenario::new("cached_only", CapabilityArea::Environment, "logenv")
                .requires_mode(RunMode::Cached),
            Scenario::new("isolated", CapabilityArea::NetworkIsolation, "app")
                .check(Check::NoOutboundNetwork),
        ];
        let report = controller.run(&scenarios).await;

        assert_eq!(report.skipped(), 2);
        assert!(report.results.iter().all(|r| r.deployment.is_none()));
        assert!(platform.prepared().is_empty());
    }

    #[tokio::test]
    async fn test_plan_matches_run_decisions() {
        let controller = ExecutionController::new(
            Arc::new(ScriptedPlatform::default()),
            settings(RunMode::Cached),
        );
        let scenarios = [
            Scenario::new("a", CapabilityArea::Vendoring, "app"),
            Scenario::new("b", CapabilityArea::Vendoring, "app").requires_symlinks(),
        ];
        let plan = controller.plan(&scenarios);
        assert_eq!(plan[0].skip_reason, None);
        assert!(plan[1].skip_reason.as_deref().unwrap().contains("symlink"));
    }

    #[tokio::test]
    async fn test_unexpected_staging_success_fails() {
        let platform = Arc::new(
            ScriptedPlatform::default().script("app", ScriptedApp::staging(&["all good"])),
        );
        let controller = ExecutionController::new(platform.clone(), settings(RunMode::Uncached));
        let scenario =
            Scenario::new("neg", CapabilityArea::VersionResolution, "app")
                .expect_failure();

        let report = controller.run_scenario(&scenario).await;
        let Outcome::Failed { diagnostic } = &report.outcome else {
            panic!("expected failure, got {:?}", report.outcome);
        };
        assert!(diagnostic.contains("staging to fail"));
        assert_eq!(platform.deletes(&report.deployment.unwrap()), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
