//! Platform interface.
//!
//! The harness never talks to the platform directly; it goes through the
//! [`Platform`] trait so the same driver runs against the real CLI
//! ([`CfCli`]) and against an in-process script ([`ScriptedPlatform`]).
//!
//! The trait only promises what the harness relies on: exit codes, UTF-8 log
//! text, a routable URL, and best-effort metadata.

mod cf;
mod scripted;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use bpverify_id::DeploymentName;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::PlatformError;
use crate::logbuf::LogBuffer;

pub use cf::{parse_app_summary, AppSummary, CfCli};
pub use scripted::{ScriptedApp, ScriptedPlatform};

/// Everything the platform needs to upload an application.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub name: DeploymentName,
    pub fixture: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Platform API version, `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApiVersion(pub u32, pub u32, pub u32);

impl ApiVersion {
    /// First API version with one-shot tasks.
    pub const TASKS: Self = Self(2, 75, 0);

    /// First API version that preserves symlinks in uploaded app bits.
    pub const SYMLINKS: Self = Self(2, 103, 0);
}

impl FromStr for ApiVersion {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PlatformError::Unavailable(format!("unparseable API version: {s:?}"));
        let mut parts = s.trim().trim_start_matches('v').splitn(3, '.');
        let mut next = || -> Result<u32, PlatformError> {
            parts
                .next()
                .ok_or_else(bad)?
                .parse::<u32>()
                .map_err(|_| bad())
        };
        Ok(Self(next()?, next()?, next()?))
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Optional platform features, resolved once per suite run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub api_version: Option<ApiVersion>,

    /// One-shot task execution.
    pub tasks: bool,

    /// Symlinks survive upload.
    pub symlinks: bool,
}

impl Capabilities {
    pub fn from_api_version(version: ApiVersion) -> Self {
        Self {
            api_version: Some(version),
            tasks: version >= ApiVersion::TASKS,
            symlinks: version >= ApiVersion::SYMLINKS,
        }
    }

    /// Every optional feature available.
    pub fn full() -> Self {
        Self {
            api_version: None,
            tasks: true,
            symlinks: true,
        }
    }
}

/// What the platform reports about a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentMetadata {
    pub buildpack: Option<String>,
    pub buildpack_version: Option<String>,
}

/// Result of a one-shot task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutput {
    pub exit_code: i32,
    pub output: String,
}

/// Handle to a running log tail.
///
/// Dropping the handle aborts the reader task; a child process attached
/// with [`LogStream::with_child`] is spawned `kill_on_drop`, so nothing the
/// stream started outlives it.
#[derive(Debug, Default)]
pub struct LogStream {
    task: Option<JoinHandle<()>>,
    child: Option<Child>,
}

impl LogStream {
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self {
            task: Some(task),
            child: None,
        }
    }

    pub fn with_child(child: Child, task: JoinHandle<()>) -> Self {
        Self {
            task: Some(task),
            child: Some(child),
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the tail. Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "log tail already exited");
            }
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Operations the harness needs from the platform under test.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Probe optional features.
    async fn capabilities(&self) -> Result<Capabilities, PlatformError>;

    /// Upload the fixture without starting it and apply environment overrides.
    async fn prepare(&self, request: &PushRequest) -> Result<(), PlatformError>;

    /// Start tailing the deployment's logs into `sink`.
    async fn open_log_stream(
        &self,
        name: &DeploymentName,
        sink: LogBuffer,
    ) -> Result<LogStream, PlatformError>;

    /// Stage and start the deployment, appending command output to `sink`.
    /// Blocks until the platform reports a terminal exit code.
    async fn start(&self, name: &DeploymentName, sink: LogBuffer) -> Result<i32, PlatformError>;

    /// Base URL of the deployment's public route.
    async fn route(&self, name: &DeploymentName) -> Result<String, PlatformError>;

    async fn metadata(&self, name: &DeploymentName) -> Result<DeploymentMetadata, PlatformError>;

    async fn run_task(
        &self,
        name: &DeploymentName,
        command: &str,
    ) -> Result<TaskOutput, PlatformError>;

    /// Delete the deployment. Deleting an unknown deployment succeeds.
    async fn delete(&self, name: &DeploymentName) -> Result<(), PlatformError>;
}
