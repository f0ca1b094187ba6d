//! Platform implementation that shells out to the `cf` CLI.

use std::process::Stdio;

use async_trait::async_trait;
use bpverify_id::DeploymentName;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    ApiVersion, Capabilities, DeploymentMetadata, LogStream, Platform, PushRequest, TaskOutput,
};
use crate::error::PlatformError;
use crate::logbuf::LogBuffer;

/// Drives the platform through its command-line client.
#[derive(Debug, Clone)]
pub struct CfCli {
    program: String,
    buildpack: String,
}

impl CfCli {
    pub fn new(program: impl Into<String>, buildpack: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            buildpack: buildpack.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .env("CF_COLOR", "false")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.program, args.join(" "))
    }

    /// Runs a command to completion and returns its stdout.
    async fn output(&self, args: &[&str]) -> Result<String, PlatformError> {
        debug!(command = %self.describe(args), "running platform command");

        let output = self
            .command(args)
            .output()
            .await
            .map_err(|source| PlatformError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(PlatformError::CommandFailed {
                command: self.describe(args),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn app_summary(&self, name: &DeploymentName) -> Result<AppSummary, PlatformError> {
        let name = name.to_string();
        let text = self.output(&["app", &name]).await?;
        Ok(parse_app_summary(&text))
    }
}

/// Copies lines from `reader` into `sink` until EOF.
async fn pump_lines<R>(reader: R, sink: LogBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => sink.append(&line),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "log pipe read failed");
                break;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    api_version: String,
}

#[async_trait]
impl Platform for CfCli {
    async fn capabilities(&self) -> Result<Capabilities, PlatformError> {
        let body = self.output(&["curl", "/v2/info"]).await?;
        let info: InfoResponse = serde_json::from_str(&body)
            .map_err(|e| PlatformError::Unavailable(format!("bad /v2/info response: {e}")))?;
        let version: ApiVersion = info.api_version.parse()?;
        info!(api_version = %version, "probed platform API version");
        Ok(Capabilities::from_api_version(version))
    }

    async fn prepare(&self, request: &PushRequest) -> Result<(), PlatformError> {
        let name = request.name.to_string();
        let path = request.fixture.to_string_lossy().into_owned();

        self.output(&[
            "push",
            &name,
            "-p",
            &path,
            "-b",
            &self.buildpack,
            "--no-start",
        ])
        .await?;

        for (key, value) in &request.env {
            self.output(&["set-env", &name, key, value]).await?;
        }

        Ok(())
    }

    async fn open_log_stream(
        &self,
        name: &DeploymentName,
        sink: LogBuffer,
    ) -> Result<LogStream, PlatformError> {
        let name = name.to_string();
        let mut child = self
            .command(&["logs", &name])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| PlatformError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlatformError::Unavailable("log tail has no stdout".to_string()))?;
        let task = tokio::spawn(pump_lines(stdout, sink));

        Ok(LogStream::with_child(child, task))
    }

    async fn start(&self, name: &DeploymentName, sink: LogBuffer) -> Result<i32, PlatformError> {
        let name = name.to_string();
        let mut child = self
            .command(&["start", &name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PlatformError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_sink = sink.clone();

        let pump_out = async move {
            if let Some(stdout) = stdout {
                pump_lines(stdout, out_sink).await;
            }
        };
        let pump_err = async move {
            if let Some(stderr) = stderr {
                pump_lines(stderr, sink).await;
            }
        };

        let (status, (), ()) = tokio::join!(child.wait(), pump_out, pump_err);
        Ok(status?.code().unwrap_or(-1))
    }

    async fn route(&self, name: &DeploymentName) -> Result<String, PlatformError> {
        let summary = self.app_summary(name).await?;
        summary
            .routes
            .first()
            .map(|route| format!("http://{route}"))
            .ok_or_else(|| PlatformError::Unavailable(format!("{name} has no routes")))
    }

    async fn metadata(&self, name: &DeploymentName) -> Result<DeploymentMetadata, PlatformError> {
        let summary = self.app_summary(name).await?;
        Ok(DeploymentMetadata {
            buildpack: summary.buildpack,
            buildpack_version: summary.buildpack_version,
        })
    }

    async fn run_task(
        &self,
        name: &DeploymentName,
        command: &str,
    ) -> Result<TaskOutput, PlatformError> {
        let name = name.to_string();
        let args = ["run-task", name.as_str(), command];
        let output = self
            .command(&args)
            .output()
            .await
            .map_err(|source| PlatformError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        Ok(TaskOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    async fn delete(&self, name: &DeploymentName) -> Result<(), PlatformError> {
        let name = name.to_string();
        // `cf delete` exits 0 for apps that no longer exist.
        self.output(&["delete", &name, "-f", "-r"]).await?;
        Ok(())
    }
}

/// The parts of `cf app` output the harness uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppSummary {
    pub routes: Vec<String>,
    pub buildpack: Option<String>,
    pub buildpack_version: Option<String>,
}

/// Parses `cf app NAME` output.
///
/// Handles both the single-line form (`buildpack: nodejs_buildpack 1.6.20`,
/// `urls:`/`routes:`) and the tabular `buildpacks:` block where the values
/// sit on the row after a header.
pub fn parse_app_summary(text: &str) -> AppSummary {
    let mut summary = AppSummary::default();
    let mut lines = text.lines().map(str::trim).peekable();

    while let Some(line) = lines.next() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "routes" | "urls" => {
                summary.routes = value
                    .split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "buildpack" | "buildpacks" => {
                let row = if value.is_empty() {
                    // Tabular form: skip the header, take the first data row.
                    if lines.peek().is_some_and(|l| l.starts_with("name")) {
                        lines.next();
                    }
                    lines.next().unwrap_or_default()
                } else {
                    value
                };

                let mut tokens = row.split_whitespace();
                summary.buildpack = tokens.next().map(str::to_string);
                summary.buildpack_version = tokens
                    .find(|t| looks_like_version(t))
                    .map(|t| t.trim_start_matches('v').to_string());
            }
            _ => {}
        }
    }

    summary
}

fn looks_like_version(token: &str) -> bool {
    let mut parts = token.trim_start_matches('v').split('.');
    let numeric = |p: Option<&str>| {
        p.is_some_and(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
    };
    numeric(parts.next()) && numeric(parts.next()) && numeric(parts.next())
}
