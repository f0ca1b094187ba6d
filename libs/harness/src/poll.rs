//! Bounded poll-until-satisfied primitive.
//!
//! Deployment output and HTTP readiness lag behind the call that triggered
//! them, so every eventual-output check goes through [`poll`]: evaluate the
//! probe immediately, then once per interval, until it succeeds or the
//! timeout elapses.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::PollError;

/// Timing budget for a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Maximum wall-clock wait.
    pub timeout: Duration,

    /// Minimum spacing between re-evaluations.
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(100),
        }
    }
}

impl PollConfig {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Same interval, different timeout. The interval is clamped so the
    /// result stays valid when the new timeout is shorter.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout,
            interval: self.interval.min(timeout),
        }
    }

    pub fn validate(&self) -> Result<(), PollError> {
        if self.timeout.is_zero() {
            return Err(PollError::invalid("timeout must be positive"));
        }
        if self.interval.is_zero() {
            return Err(PollError::invalid("interval must be positive"));
        }
        if self.interval > self.timeout {
            return Err(PollError::invalid(format!(
                "interval {:?} exceeds timeout {:?}",
                self.interval, self.timeout
            )));
        }
        Ok(())
    }
}

/// A successful poll.
#[derive(Debug, Clone)]
pub struct Satisfied<T> {
    /// Whatever the probe returned on success.
    pub value: T,
    pub elapsed: Duration,
    pub attempts: u32,
}

/// Polls `probe` until it returns `Ok` or `config.timeout` elapses.
///
/// The probe's `Err` string is its description of what it observed; the last
/// one is carried in [`PollError::Timeout`]. The final wait is clipped to the
/// deadline and a probe still running at `timeout + interval` is abandoned,
/// so a timeout is reported no earlier than `timeout` and no later than
/// `timeout + interval`.
pub async fn poll<T, F, Fut>(config: PollConfig, mut probe: F) -> Result<Satisfied<T>, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    config.validate()?;

    let start = Instant::now();
    let hard_deadline = start + config.timeout + config.interval;
    let mut attempts = 0u32;
    let mut previous: Option<String> = None;

    loop {
        attempts += 1;
        let outcome = match tokio::time::timeout_at(hard_deadline, probe()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let last_observed = match previous {
                    Some(earlier) => format!("probe still pending; previously observed:\n{earlier}"),
                    None => "probe still pending".to_string(),
                };
                debug!(attempts, "poll abandoned a pending probe");
                return Err(PollError::Timeout {
                    elapsed: start.elapsed(),
                    attempts,
                    last_observed,
                });
            }
        };

        let last_observed = match outcome {
            Ok(value) => {
                let elapsed = start.elapsed();
                trace!(attempts, elapsed_ms = elapsed.as_millis() as u64, "poll satisfied");
                return Ok(Satisfied {
                    value,
                    elapsed,
                    attempts,
                });
            }
            Err(observed) => observed,
        };

        let elapsed = start.elapsed();
        if elapsed >= config.timeout {
            debug!(
                attempts,
                timeout_ms = config.timeout.as_millis() as u64,
                "poll timed out"
            );
            return Err(PollError::Timeout {
                elapsed,
                attempts,
                last_observed,
            });
        }

        previous = Some(last_observed);
        tokio::time::sleep(config.interval.min(config.timeout - elapsed)).await;
    }
}

/// [`poll`] for probes that do not need to await anything.
pub async fn poll_fn<T, F>(config: PollConfig, mut probe: F) -> Result<Satisfied<T>, PollError>
where
    F: FnMut() -> Result<T, String>,
{
    poll(config, || std::future::ready(probe())).await
}
