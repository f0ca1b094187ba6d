//! Deployment driver.
//!
//! Wraps one logical application instance on the platform: creation is local
//! bookkeeping only, staging uploads and starts the fixture while its logs
//! stream into the deployment's [`LogBuffer`], and destruction releases
//! everything the platform holds for it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bpverify_id::DeploymentName;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{HttpError, PlatformError, StageError, TaskError};
use crate::logbuf::LogBuffer;
use crate::platform::{
    Capabilities, DeploymentMetadata, LogStream, Platform, PushRequest, TaskOutput,
};

/// Per-request budget for a single GET. Retrying is the poller's job.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An application payload directory. The harness never writes to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixture {
    name: String,
    path: PathBuf,
}

impl Fixture {
    /// The fixture called `name` under `root`.
    pub fn new(root: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: root.join(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Lifecycle of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Created,
    Staging,
    Running,
    Failed,
    Destroyed,
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Staging => "staging",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// A fixture bound to a (possibly not yet existing) platform instance.
#[derive(Debug)]
pub struct Deployment {
    name: DeploymentName,
    fixture: Fixture,
    env: BTreeMap<String, String>,
    logs: LogBuffer,
    state: DeploymentState,
    stream: Option<LogStream>,
}

impl Deployment {
    pub fn name(&self) -> &DeploymentName {
        &self.name
    }

    pub fn fixture(&self) -> &Fixture {
        &self.fixture
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// The deployment's output: staging output plus the streamed app log.
    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Adds an environment override. Only takes effect before staging.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        if self.state != DeploymentState::Created {
            warn!(deployment = %self.name, state = %self.state, "env override after staging ignored");
            return self;
        }
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Creates, stages, probes, and destroys deployments on one platform.
#[derive(Clone)]
pub struct DeploymentDriver {
    platform: Arc<dyn Platform>,
    capabilities: Capabilities,
    http: reqwest::Client,
}

impl DeploymentDriver {
    pub fn new(platform: Arc<dyn Platform>, capabilities: Capabilities) -> Self {
        Self {
            platform,
            capabilities,
            http: reqwest::Client::new(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Allocates a uniquely named deployment. Touches nothing remote.
    pub fn create(&self, fixture: Fixture, env: BTreeMap<String, String>) -> Deployment {
        let name = DeploymentName::new();
        debug!(deployment = %name, fixture = fixture.name(), "deployment created");
        Deployment {
            name,
            fixture,
            env,
            logs: LogBuffer::new(),
            state: DeploymentState::Created,
            stream: None,
        }
    }

    /// Uploads and starts the deployment, blocking until the platform reports
    /// a terminal exit code. The log stream is opened before the start
    /// command runs and keeps filling the buffer after this returns.
    pub async fn stage(&self, deployment: &mut Deployment) -> Result<(), StageError> {
        if deployment.state != DeploymentState::Created {
            return Err(StageError::Platform(PlatformError::Unavailable(format!(
                "deployment {} is {}, not created",
                deployment.name, deployment.state
            ))));
        }

        deployment.state = DeploymentState::Staging;
        info!(
            deployment = %deployment.name,
            fixture = deployment.fixture.name(),
            "staging deployment"
        );

        let result = self.stage_inner(deployment).await;
        deployment.state = match &result {
            Ok(()) => DeploymentState::Running,
            Err(_) => DeploymentState::Failed,
        };

        match &result {
            Ok(()) => info!(deployment = %deployment.name, "deployment running"),
            Err(e) => info!(deployment = %deployment.name, error = %e, "staging failed"),
        }
        result
    }

    async fn stage_inner(&self, deployment: &mut Deployment) -> Result<(), StageError> {
        let request = PushRequest {
            name: deployment.name,
            fixture: deployment.fixture.path.clone(),
            env: deployment.env.clone(),
        };
        self.platform.prepare(&request).await?;

        let stream = self
            .platform
            .open_log_stream(&deployment.name, deployment.logs.clone())
            .await?;
        deployment.stream = Some(stream);

        let code = self
            .platform
            .start(&deployment.name, deployment.logs.clone())
            .await?;

        if code != 0 {
            return Err(StageError::ExitNonZero { code });
        }
        Ok(())
    }

    /// One GET against the deployment's public route. No retries.
    pub async fn http_get(&self, deployment: &Deployment, path: &str) -> Result<String, HttpError> {
        let base = self.platform.route(&deployment.name).await?;
        let url = format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        let response = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|source| HttpError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| HttpError::Transport {
                url: url.clone(),
                source,
            })?;

        if !status.is_success() {
            return Err(HttpError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    /// Runs a one-shot command in the deployment's runtime context. Not
    /// attempted when the platform has no task support.
    pub async fn run_task(
        &self,
        deployment: &Deployment,
        command: &str,
    ) -> Result<TaskOutput, TaskError> {
        if !self.capabilities.tasks {
            return Err(TaskError::Unsupported);
        }

        let output = self.platform.run_task(&deployment.name, command).await?;
        if output.exit_code != 0 {
            return Err(TaskError::Failed {
                code: output.exit_code,
                output: output.output,
            });
        }
        Ok(output)
    }

    pub async fn metadata(
        &self,
        deployment: &Deployment,
    ) -> Result<DeploymentMetadata, PlatformError> {
        self.platform.metadata(&deployment.name).await
    }

    /// Releases the deployment. Calling it again after success is a no-op;
    /// calling it mid-stage or after a failed stage is fine.
    pub async fn destroy(&self, deployment: &mut Deployment) -> Result<(), PlatformError> {
        match deployment.state {
            DeploymentState::Destroyed => return Ok(()),
            DeploymentState::Created => {
                deployment.state = DeploymentState::Destroyed;
                return Ok(());
            }
            _ => {}
        }

        if let Some(mut stream) = deployment.stream.take() {
            stream.stop().await;
        }

        self.platform.delete(&deployment.name).await?;
        deployment.state = DeploymentState::Destroyed;
        debug!(deployment = %deployment.name, "deployment destroyed");
        Ok(())
    }
}
