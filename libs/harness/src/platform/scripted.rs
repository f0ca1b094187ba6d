//! In-process platform driven by per-fixture scripts.
//!
//! Used by the harness's own tests and the e2e crate: each fixture name maps
//! to a [`ScriptedApp`] describing what staging prints, how it exits, and
//! what the deployment answers afterwards.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bpverify_id::DeploymentName;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::{Capabilities, DeploymentMetadata, LogStream, Platform, PushRequest, TaskOutput};
use crate::error::PlatformError;
use crate::logbuf::LogBuffer;
use crate::observer::observer_installed;

/// Script for one fixture.
#[derive(Debug, Clone, Default)]
pub struct ScriptedApp {
    /// Only applies when every pair is present in the deployment's env.
    pub when_env: Vec<(String, String)>,

    /// Printed by `start` before it returns.
    pub staging_lines: Vec<String>,

    /// How long `start` takes.
    pub staging_time: Duration,

    /// Printed on the log stream `late_delay` after `start` returns.
    pub late_lines: Vec<String>,
    pub late_delay: Duration,

    pub exit_code: i32,

    /// Base URL returned by `route`.
    pub route: Option<String>,

    pub metadata: DeploymentMetadata,

    /// Lines a task appends to the log stream.
    pub task_lines: Vec<String>,
    pub task_exit_code: i32,
}

impl ScriptedApp {
    /// An app that stages successfully and prints `lines`.
    pub fn staging(lines: &[&str]) -> Self {
        Self {
            staging_lines: lines.iter().map(|l| l.to_string()).collect(),
            ..Self::default()
        }
    }

    /// An app whose staging fails with `exit_code` after printing `lines`.
    pub fn failing(exit_code: i32, lines: &[&str]) -> Self {
        Self {
            exit_code,
            ..Self::staging(lines)
        }
    }

    #[must_use]
    pub fn when_env(mut self, key: &str, value: &str) -> Self {
        self.when_env.push((key.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn staging_time(mut self, duration: Duration) -> Self {
        self.staging_time = duration;
        self
    }

    #[must_use]
    pub fn late(mut self, delay: Duration, lines: &[&str]) -> Self {
        self.late_delay = delay;
        self.late_lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    #[must_use]
    pub fn route(mut self, base_url: impl Into<String>) -> Self {
        self.route = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn buildpack_version(mut self, version: &str) -> Self {
        self.metadata.buildpack_version = Some(version.to_string());
        self
    }

    #[must_use]
    pub fn task(mut self, lines: &[&str]) -> Self {
        self.task_lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    fn applies_to(&self, env: &BTreeMap<String, String>) -> bool {
        self.when_env
            .iter()
            .all(|(k, v)| env.get(k).is_some_and(|actual| actual == v))
    }
}

#[derive(Debug)]
struct LiveApp {
    app: ScriptedApp,
    sink: Option<LogBuffer>,
    started: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
struct State {
    live: HashMap<DeploymentName, LiveApp>,
    deletes: HashMap<DeploymentName, usize>,
    prepared: Vec<PushRequest>,
    starts_while_observed: usize,
}

/// Scripted [`Platform`] implementation.
#[derive(Debug, Default)]
pub struct ScriptedPlatform {
    capabilities: Capabilities,
    scripts: Vec<(String, ScriptedApp)>,
    state: Mutex<State>,
}

impl ScriptedPlatform {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            ..Self::default()
        }
    }

    /// Registers a script for `fixture`. Later registrations win when more
    /// than one applies.
    #[must_use]
    pub fn script(mut self, fixture: &str, app: ScriptedApp) -> Self {
        self.scripts.push((fixture.to_string(), app));
        self
    }

    /// How many times `delete` was called for `name`.
    pub fn deletes(&self, name: &DeploymentName) -> usize {
        self.state.lock().deletes.get(name).copied().unwrap_or(0)
    }

    /// Push requests seen so far, in order.
    pub fn prepared(&self) -> Vec<PushRequest> {
        self.state.lock().prepared.clone()
    }

    /// `start` calls that overlapped an installed traffic observer.
    pub fn starts_while_observed(&self) -> usize {
        self.state.lock().starts_while_observed
    }

    /// Deployments prepared and not yet deleted.
    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    fn lookup(&self, request: &PushRequest) -> Result<ScriptedApp, PlatformError> {
        let fixture = request
            .fixture
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.scripts
            .iter()
            .rev()
            .find(|(name, app)| *name == fixture && app.applies_to(&request.env))
            .map(|(_, app)| app.clone())
            .ok_or_else(|| PlatformError::CommandFailed {
                command: format!("push {}", request.name),
                code: 1,
                stderr: format!("no script for fixture {fixture:?}"),
            })
    }

    fn with_live<T>(
        &self,
        name: &DeploymentName,
        f: impl FnOnce(&mut LiveApp) -> T,
    ) -> Result<T, PlatformError> {
        let mut state = self.state.lock();
        let live = state
            .live
            .get_mut(name)
            .ok_or_else(|| PlatformError::Unavailable(format!("app {name} not found")))?;
        Ok(f(live))
    }
}

#[async_trait]
impl Platform for ScriptedPlatform {
    async fn capabilities(&self) -> Result<Capabilities, PlatformError> {
        Ok(self.capabilities)
    }

    async fn prepare(&self, request: &PushRequest) -> Result<(), PlatformError> {
        let app = self.lookup(request)?;
        debug!(deployment = %request.name, fixture = %request.fixture.display(), "[SCRIPTED] prepare");

        let mut state = self.state.lock();
        state.prepared.push(request.clone());
        state.live.insert(
            request.name,
            LiveApp {
                app,
                sink: None,
                started: None,
            },
        );
        Ok(())
    }

    async fn open_log_stream(
        &self,
        name: &DeploymentName,
        sink: LogBuffer,
    ) -> Result<LogStream, PlatformError> {
        let (tx, rx) = oneshot::channel();
        let (late_lines, late_delay) = self.with_live(name, |live| {
            live.sink = Some(sink.clone());
            live.started = Some(tx);
            (live.app.late_lines.clone(), live.app.late_delay)
        })?;

        let task = tokio::spawn(async move {
            if rx.await.is_err() {
                return;
            }
            tokio::time::sleep(late_delay).await;
            for line in late_lines {
                sink.append(&line);
            }
        });

        Ok(LogStream::from_task(task))
    }

    async fn start(&self, name: &DeploymentName, sink: LogBuffer) -> Result<i32, PlatformError> {
        let (lines, exit_code, staging_time, started) = self.with_live(name, |live| {
            (
                live.app.staging_lines.clone(),
                live.app.exit_code,
                live.app.staging_time,
                live.started.take(),
            )
        })?;

        let observed = observer_installed();
        if !staging_time.is_zero() {
            tokio::time::sleep(staging_time).await;
        }
        if observed || observer_installed() {
            self.state.lock().starts_while_observed += 1;
        }

        for line in &lines {
            sink.append(line);
        }
        if let Some(started) = started {
            let _ = started.send(());
        }

        info!(deployment = %name, exit_code, "[SCRIPTED] start finished");
        Ok(exit_code)
    }

    async fn route(&self, name: &DeploymentName) -> Result<String, PlatformError> {
        self.with_live(name, |live| live.app.route.clone())?
            .ok_or_else(|| PlatformError::Unavailable(format!("{name} has no routes")))
    }

    async fn metadata(&self, name: &DeploymentName) -> Result<DeploymentMetadata, PlatformError> {
        self.with_live(name, |live| live.app.metadata.clone())
    }

    async fn run_task(
        &self,
        name: &DeploymentName,
        command: &str,
    ) -> Result<TaskOutput, PlatformError> {
        debug!(deployment = %name, command, "[SCRIPTED] run-task");
        let (lines, exit_code, sink) = self.with_live(name, |live| {
            (
                live.app.task_lines.clone(),
                live.app.task_exit_code,
                live.sink.clone(),
            )
        })?;

        if let Some(sink) = sink {
            for line in &lines {
                sink.append(line);
            }
        }

        Ok(TaskOutput {
            exit_code,
            output: String::new(),
        })
    }

    async fn delete(&self, name: &DeploymentName) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        state.live.remove(name);
        *state.deletes.entry(*name).or_default() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request(fixture: &str, env: &[(&str, &str)]) -> PushRequest {
        PushRequest {
            name: DeploymentName::new(),
            fixture: PathBuf::from("fixtures").join(fixture),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_env_specific_script_wins() {
        let platform = ScriptedPlatform::default()
            .script("simple_app", ScriptedApp::staging(&[]).route("http://plain"))
            .script(
                "simple_app",
                ScriptedApp::staging(&[])
                    .when_env("OPTIMIZE_MEMORY", "true")
                    .route("http://optimized"),
            );

        let plain = request("simple_app", &[]);
        platform.prepare(&plain).await.unwrap();
        assert_eq!(platform.route(&plain.name).await.unwrap(), "http://plain");

        let optimized = request("simple_app", &[("OPTIMIZE_MEMORY", "true")]);
        platform.prepare(&optimized).await.unwrap();
        assert_eq!(
            platform.route(&optimized.name).await.unwrap(),
            "http://optimized"
        );
    }

    #[tokio::test]
    async fn test_unknown_fixture_fails_prepare() {
        let platform = ScriptedPlatform::default();
        let err = platform.prepare(&request("nope", &[])).await.unwrap_err();
        assert!(matches!(err, PlatformError::CommandFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_lines_arrive_after_start() {
        let platform = ScriptedPlatform::default().script(
            "app",
            ScriptedApp::staging(&["staging"]).late(Duration::from_millis(500), &["late"]),
        );
        let req = request("app", &[]);
        let sink = LogBuffer::new();

        platform.prepare(&req).await.unwrap();
        let _stream = platform
            .open_log_stream(&req.name, sink.clone())
            .await
            .unwrap();
        assert_eq!(platform.start(&req.name, sink.clone()).await.unwrap(), 0);
        assert!(sink.contains("staging"));
        assert!(!sink.contains("late"));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(sink.contains("late"));
    }

    #[tokio::test]
    async fn test_delete_counts_and_tolerates_unknown() {
        let platform = ScriptedPlatform::default().script("app", ScriptedApp::staging(&[]));
        let req = request("app", &[]);
        platform.prepare(&req).await.unwrap();
        assert_eq!(platform.live_count(), 1);

        platform.delete(&req.name).await.unwrap();
        platform.delete(&req.name).await.unwrap();
        assert_eq!(platform.deletes(&req.name), 2);
        assert_eq!(platform.live_count(), 0);
    }
}
