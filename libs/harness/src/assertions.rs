//! Reusable scenario assertions.
//!
//! Every assertion either holds or yields an [`AssertionFailure`] carrying
//! what was expected and the last thing actually observed: a log tail, an
//! HTTP status and body, or a traffic listing. Assertions over eventual
//! output poll; assertions over recorded traffic are evaluated once after the
//! staging window closes.

use std::fmt;

use regex::Regex;
use serde::Serialize;

use crate::driver::{Deployment, DeploymentDriver, Fixture};
use crate::error::{HarnessError, PollError, TaskError};
use crate::logbuf::LogBuffer;
use crate::observer::TrafficLog;
use crate::poll::{poll, poll_fn, PollConfig};

/// Diagnostics keep the end of long observations, where the failure is.
const MAX_OBSERVED_BYTES: usize = 4096;

/// A compiled regular expression that remembers its source.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, HarnessError> {
        Regex::new(pattern)
            .map(Self)
            .map_err(|source| HarnessError::Pattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.0.as_str())
    }
}

/// A failed assertion with enough context to act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssertionFailure {
    pub assertion: &'static str,
    pub expected: String,
    pub observed: String,
}

impl AssertionFailure {
    pub fn new(
        assertion: &'static str,
        expected: impl Into<String>,
        observed: impl AsRef<str>,
    ) -> Self {
        Self {
            assertion,
            expected: expected.into(),
            observed: tail(observed.as_ref(), MAX_OBSERVED_BYTES),
        }
    }

    fn from_poll(assertion: &'static str, expected: String, err: PollError) -> Self {
        match err {
            PollError::Timeout {
                elapsed,
                last_observed,
                ..
            } => Self::new(
                assertion,
                format!("{expected} (waited {elapsed:?})"),
                last_observed,
            ),
            PollError::InvalidConfig { details } => {
                Self::new(assertion, expected, format!("invalid poll config: {details}"))
            }
        }
    }
}

impl fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}\n--- last observed ---\n{}",
            self.assertion, self.expected, self.observed
        )
    }
}

impl std::error::Error for AssertionFailure {}

/// Outcome of an assertion that may not apply to this platform or setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Held,
    NotApplicable(String),
}

/// Keeps the last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// The log stream eventually matches a version-shaped pattern such as
/// `NodeJS 6\.\d+\.\d+`.
pub async fn version_appears(
    stream: &LogBuffer,
    pattern: &Pattern,
    config: PollConfig,
) -> Result<(), AssertionFailure> {
    log_matches(stream, pattern, config)
        .await
        .map_err(|f| AssertionFailure { assertion: "version_appears", ..f })
}

/// The log stream eventually matches `pattern`.
pub async fn log_matches(
    stream: &LogBuffer,
    pattern: &Pattern,
    config: PollConfig,
) -> Result<(), AssertionFailure> {
    poll_fn(config, || {
        let snapshot = stream.plain_snapshot();
        if pattern.is_match(&snapshot) {
            Ok(())
        } else {
            Err(snapshot)
        }
    })
    .await
    .map(|_| ())
    .map_err(|e| AssertionFailure::from_poll("log_matches", format!("log to match {pattern}"), e))
}

/// The log stream eventually contains `needle`.
pub async fn log_contains(
    stream: &LogBuffer,
    needle: &str,
    config: PollConfig,
) -> Result<(), AssertionFailure> {
    poll_fn(config, || {
        let snapshot = stream.plain_snapshot();
        if snapshot.contains(needle) {
            Ok(())
        } else {
            Err(snapshot)
        }
    })
    .await
    .map(|_| ())
    .map_err(|e| {
        AssertionFailure::from_poll("log_contains", format!("log to contain {needle:?}"), e)
    })
}

async fn poll_body<F>(
    assertion: &'static str,
    expected: String,
    driver: &DeploymentDriver,
    deployment: &Deployment,
    path: &str,
    config: PollConfig,
    accept: F,
) -> Result<(), AssertionFailure>
where
    F: Fn(&str) -> bool,
{
    let accept = &accept;
    poll(config, move || async move {
        match driver.http_get(deployment, path).await {
            Ok(body) if accept(&body) => Ok(()),
            Ok(body) => Err(format!("GET {path} answered\n{body}")),
            Err(e) => Err(e.to_string()),
        }
    })
    .await
    .map(|_| ())
    .map_err(|e| AssertionFailure::from_poll(assertion, expected, e))
}

/// GET `path` eventually answers with a body containing `needle`.
pub async fn http_body_contains(
    driver: &DeploymentDriver,
    deployment: &Deployment,
    path: &str,
    needle: &str,
    config: PollConfig,
) -> Result<(), AssertionFailure> {
    poll_body(
        "http_body_contains",
        format!("GET {path} body to contain {needle:?}"),
        driver,
        deployment,
        path,
        config,
        |body| body.contains(needle),
    )
    .await
}

/// GET `path` eventually answers with a body matching `pattern`.
pub async fn http_body_matches(
    driver: &DeploymentDriver,
    deployment: &Deployment,
    path: &str,
    pattern: &Pattern,
    config: PollConfig,
) -> Result<(), AssertionFailure> {
    poll_body(
        "http_body_matches",
        format!("GET {path} body to match {pattern}"),
        driver,
        deployment,
        path,
        config,
        |body| pattern.is_match(body),
    )
    .await
}

/// GET `path` eventually answers with exactly `expected`.
pub async fn http_body_equals(
    driver: &DeploymentDriver,
    deployment: &Deployment,
    path: &str,
    expected: &str,
    config: PollConfig,
) -> Result<(), AssertionFailure> {
    poll_body(
        "http_body_equals",
        format!("GET {path} body to equal {expected:?}"),
        driver,
        deployment,
        path,
        config,
        |body| body == expected,
    )
    .await
}

/// Zero direct outbound connections were recorded during staging.
pub fn no_outbound_network(traffic: &TrafficLog) -> Result<(), AssertionFailure> {
    if traffic.is_empty() {
        Ok(())
    } else {
        Err(AssertionFailure::new(
            "no_outbound_network_during_staging",
            "zero outbound connections during staging",
            traffic.summary(),
        ))
    }
}

/// Every staging connection went through the configured proxy, and there
/// was at least one. Not applicable when no proxy is configured for the run.
pub fn used_proxy(
    traffic: &TrafficLog,
    proxy_configured: bool,
) -> Result<Verdict, AssertionFailure> {
    const EXPECTED: &str = "every staging connection through the proxy";

    if !proxy_configured {
        return Ok(Verdict::NotApplicable("no proxy configured".to_string()));
    }
    if traffic.is_empty() {
        return Err(AssertionFailure::new(
            "used_proxy_during_staging",
            EXPECTED,
            traffic.summary(),
        ));
    }

    let bypassed: Vec<&str> = traffic
        .connections
        .iter()
        .filter(|c| !c.via_proxy)
        .map(|c| c.destination.as_str())
        .collect();
    if bypassed.is_empty() {
        return Ok(Verdict::Held);
    }

    Err(AssertionFailure::new(
        "used_proxy_during_staging",
        EXPECTED,
        format!(
            "bypassed the proxy: {}\n{}",
            bypassed.join(", "),
            traffic.summary()
        ),
    ))
}

/// The deployment was staged by the buildpack version under test, as
/// reported by platform metadata or by the buildpack's staging banner.
pub async fn buildpack_version_confirmed(
    driver: &DeploymentDriver,
    deployment: &Deployment,
    expected_version: &str,
) -> Result<(), AssertionFailure> {
    let reported = match driver.metadata(deployment).await {
        Ok(meta) => meta.buildpack_version,
        Err(e) => {
            tracing::debug!(deployment = %deployment.name(), error = %e, "metadata unavailable");
            None
        }
    };

    if reported.as_deref() == Some(expected_version) {
        return Ok(());
    }

    let banner = format!("Buildpack version {expected_version}");
    let logs = deployment.logs().plain_snapshot();
    if logs.contains(&banner) {
        return Ok(());
    }

    Err(AssertionFailure::new(
        "buildpack_version_confirmed",
        format!("buildpack version {expected_version}"),
        format!(
            "metadata reported {}\n{logs}",
            reported.as_deref().unwrap_or("no version")
        ),
    ))
}

/// A path inside the fixture is (or is not) a directory. Fixtures are only
/// read.
pub fn fixture_path(fixture: &Fixture, relative: &str, is_dir: bool) -> Result<(), AssertionFailure> {
    let path = fixture.path().join(relative);
    let actual = path.is_dir();
    if actual == is_dir {
        return Ok(());
    }

    let want = if is_dir { "to be" } else { "not to be" };
    let got = if actual { "a directory" } else { "not a directory" };
    Err(AssertionFailure::new(
        "fixture_path",
        format!("{} {want} a directory", path.display()),
        got,
    ))
}

/// Runs a one-shot task, then waits for its output on the log stream. Not
/// applicable when the platform has no task support.
pub async fn task_output_appears(
    driver: &DeploymentDriver,
    deployment: &Deployment,
    command: &str,
    pattern: &Pattern,
    config: PollConfig,
) -> Result<Verdict, AssertionFailure> {
    match driver.run_task(deployment, command).await {
        Ok(_) => {}
        Err(TaskError::Unsupported) => {
            return Ok(Verdict::NotApplicable(
                "platform does not support tasks".to_string(),
            ))
        }
        Err(e) => {
            return Err(AssertionFailure::new(
                "task_output_appears",
                format!("task {command:?} to run"),
                e.to_string(),
            ))
        }
    }

    log_matches(deployment.logs(), pattern, config)
        .await
        .map(|()| Verdict::Held)
        .map_err(|f| AssertionFailure { assertion: "task_output_appears", ..f })
}
