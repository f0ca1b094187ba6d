//! Harness configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::controller::SuiteSettings;
use crate::error::{HarnessError, Result};
use crate::observer::{CaptureObserver, ObserverSet, ProxyLogObserver, TrafficObserver};
use crate::platform::Capabilities;
use crate::poll::PollConfig;
use crate::scenario::RunMode;

/// Harness configuration, normally read from `BPV_*` environment variables.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Platform CLI binary.
    pub cf_bin: String,

    /// Buildpack name passed to the platform on push.
    pub buildpack: String,

    /// Expected buildpack version; confirmation checks are skipped when unset.
    pub buildpack_version: Option<String>,

    pub mode: RunMode,

    /// Directory holding one subdirectory per fixture.
    pub fixtures_dir: PathBuf,

    pub poll: PollConfig,

    pub scenario_timeout: Duration,

    /// Scenarios run concurrently. 1 runs them in order.
    pub parallelism: usize,

    /// Packet-capture command line for network isolation checks.
    pub capture_command: Option<String>,

    /// Forwarding proxy access log for proxy checks.
    pub proxy_log: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            cf_bin: "cf".to_string(),
            buildpack: "nodejs_buildpack".to_string(),
            buildpack_version: None,
            mode: RunMode::Uncached,
            fixtures_dir: PathBuf::from("fixtures"),
            poll: PollConfig::default(),
            scenario_timeout: Duration::from_secs(900),
            parallelism: 1,
            capture_command: None,
            proxy_log: None,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let poll = PollConfig::new(
            Duration::from_millis(parse_or(&var, "BPV_POLL_TIMEOUT_MS", 10_000)?),
            Duration::from_millis(parse_or(&var, "BPV_POLL_INTERVAL_MS", 100)?),
        );

        let config = Self {
            cf_bin: var("BPV_CF_BIN").unwrap_or(defaults.cf_bin),
            buildpack: var("BPV_BUILDPACK").unwrap_or(defaults.buildpack),
            buildpack_version: var("BPV_BUILDPACK_VERSION"),
            mode: RunMode::from_cached_flag(parse_flag(var("BPV_CACHED").as_deref())?),
            fixtures_dir: var("BPV_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.fixtures_dir),
            poll,
            scenario_timeout: Duration::from_secs(parse_or(&var, "BPV_SCENARIO_TIMEOUT_SECS", 900)?),
            parallelism: parse_or(&var, "BPV_PARALLELISM", 1)?,
            capture_command: var("BPV_CAPTURE_COMMAND"),
            proxy_log: var("BPV_PROXY_LOG").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.poll
            .validate()
            .map_err(|e| HarnessError::config(e.to_string()))?;
        if self.parallelism == 0 {
            return Err(HarnessError::config("parallelism must be at least 1"));
        }
        if self.scenario_timeout.is_zero() {
            return Err(HarnessError::config("scenario timeout must be positive"));
        }
        Ok(())
    }

    /// The traffic observer described by this configuration, if any.
    pub fn observer(&self) -> Option<Arc<dyn TrafficObserver>> {
        let mut members: Vec<Arc<dyn TrafficObserver>> = Vec::new();
        if let Some(observer) = self
            .capture_command
            .as_deref()
            .and_then(CaptureObserver::from_command_line)
        {
            members.push(Arc::new(observer));
        }
        if let Some(path) = &self.proxy_log {
            members.push(Arc::new(ProxyLogObserver::new(path)));
        }

        match members.len() {
            0 => None,
            1 => members.pop(),
            _ => Some(Arc::new(ObserverSet::new(members))),
        }
    }

    pub fn settings(&self, capabilities: Capabilities) -> SuiteSettings {
        SuiteSettings {
            mode: self.mode,
            capabilities,
            buildpack_version: self.buildpack_version.clone(),
            poll: self.poll,
            scenario_timeout: self.scenario_timeout,
            parallelism: self.parallelism,
            fixtures_dir: self.fixtures_dir.clone(),
            proxy_configured: self.proxy_log.is_some(),
        }
    }
}

fn parse_or<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| HarnessError::config(format!("{key}: cannot parse {raw:?}"))),
    }
}

fn parse_flag(raw: Option<&str>) -> Result<bool> {
    match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("0" | "false" | "no") => Ok(false),
        Some("1" | "true" | "yes") => Ok(true),
        Some(other) => Err(HarnessError::config(format!("BPV_CACHED: cannot parse {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.cf_bin, "cf");
        assert_eq!(config.buildpack, "nodejs_buildpack");
        assert_eq!(config.mode, RunMode::Uncached);
        assert_eq!(config.poll, PollConfig::default());
        assert_eq!(config.scenario_timeout, Duration::from_secs(900));
        assert_eq!(config.parallelism, 1);
        assert!(config.observer().is_none());
    }

    #[test]
    fn test_overrides() {
        let config = HarnessConfig::from_lookup(lookup(&[
            ("BPV_CACHED", "true"),
            ("BPV_BUILDPACK_VERSION", "1.6.20"),
            ("BPV_POLL_TIMEOUT_MS", "2000"),
            ("BPV_POLL_INTERVAL_MS", "50"),
            ("BPV_PARALLELISM", "4"),
            ("BPV_PROXY_LOG", "/var/log/squid/access.log"),
        ]))
        .unwrap();

        assert_eq!(config.mode, RunMode::Cached);
        assert_eq!(config.buildpack_version.as_deref(), Some("1.6.20"));
        assert_eq!(config.poll.timeout, Duration::from_secs(2));
        assert_eq!(config.parallelism, 4);
        assert!(config.observer().is_some());

        let settings = config.settings(Capabilities::full());
        assert!(settings.proxy_configured);
        assert_eq!(settings.mode, RunMode::Cached);
    }

    #[test]
    fn test_blank_values_keep_defaults() {
        let config = HarnessConfig::from_lookup(lookup(&[("BPV_CF_BIN", "  ")])).unwrap();
        assert_eq!(config.cf_bin, "cf");
    }

    #[rstest]
    #[case("BPV_PARALLELISM", "0")]
    #[case("BPV_PARALLELISM", "many")]
    #[case("BPV_POLL_TIMEOUT_MS", "0")]
    #[case("BPV_POLL_INTERVAL_MS", "20000")]
    #[case("BPV_SCENARIO_TIMEOUT_SECS", "0")]
    #[case("BPV_CACHED", "sometimes")]
    fn test_invalid_values_rejected(#[case] key: &str, #[case] value: &str) {
        let err = HarnessConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
        assert!(matches!(err, HarnessError::Config { .. }), "{err}");
    }
}
