//! Error types for the harness.
//!
//! Each layer has its own error so callers can tell an expected outcome
//! (a negative-path scenario whose staging fails) from a broken run.

use std::time::Duration;

use thiserror::Error;

/// Errors from the output poller.
#[derive(Debug, Error)]
pub enum PollError {
    /// Timeout or interval is zero, or the interval exceeds the timeout.
    #[error("invalid poll config: {details}")]
    InvalidConfig { details: String },

    /// The probe never succeeded within the budget.
    #[error("not satisfied after {elapsed:?} ({attempts} attempts); last observed: {last_observed}")]
    Timeout {
        elapsed: Duration,
        attempts: u32,
        last_observed: String,
    },
}

impl PollError {
    pub(crate) fn invalid(details: impl Into<String>) -> Self {
        Self::InvalidConfig {
            details: details.into(),
        }
    }
}

/// Errors talking to the platform under test.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The platform CLI could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A platform command exited unsuccessfully.
    #[error("`{command}` exited with {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// IO error while talking to a platform process.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The platform answered with something the harness cannot use.
    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

/// Errors from staging a deployment.
#[derive(Debug, Error)]
pub enum StageError {
    /// The platform reported a failed deployment.
    #[error("staging exited with code {code}")]
    ExitNonZero { code: i32 },

    /// Staging could not be attempted at all.
    #[error("staging could not run: {0}")]
    Platform(#[from] PlatformError),
}

/// Errors from a single HTTP GET against a deployment.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("could not resolve route: {0}")]
    Route(#[from] PlatformError),

    #[error("GET {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("GET {url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
}

/// Errors from one-shot task execution.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The suite's capability probe says the platform has no task support.
    #[error("platform does not support tasks")]
    Unsupported,

    #[error("task exited with {code}: {output}")]
    Failed { code: i32, output: String },

    #[error("task could not run: {0}")]
    Platform(#[from] PlatformError),
}

/// Errors from network traffic observers.
#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("failed to start traffic observer: {0}")]
    Start(String),

    #[error("failed to collect traffic log: {0}")]
    Collect(String),
}

/// Top-level harness errors (configuration and catalog construction).
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid configuration: {details}")]
    Config { details: String },

    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl HarnessError {
    pub(crate) fn config(details: impl Into<String>) -> Self {
        Self::Config {
            details: details.into(),
        }
    }
}

/// Shared `Result` alias for the harness.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
