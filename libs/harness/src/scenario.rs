//! Declarative scenario records.
//!
//! A scenario binds a fixture, optional environment overrides, the expected
//! staging outcome, and the checks to run afterwards. Scenarios are plain
//! data; the execution controller interprets them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::assertions::Pattern;
use crate::error::HarnessError;
use crate::platform::Capabilities;

/// Whether the buildpack under test ships with its dependencies pre-fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Cached,
    Uncached,
}

impl RunMode {
    pub fn from_cached_flag(cached: bool) -> Self {
        if cached {
            Self::Cached
        } else {
            Self::Uncached
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cached => "cached",
            Self::Uncached => "uncached",
        })
    }
}

/// Capability areas the catalog is organized by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityArea {
    VersionResolution,
    MemorySizing,
    Vendoring,
    DependencyResolution,
    Caching,
    NetworkIsolation,
    Environment,
    TrustStore,
}

impl CapabilityArea {
    pub const ALL: [Self; 8] = [
        Self::VersionResolution,
        Self::MemorySizing,
        Self::Vendoring,
        Self::DependencyResolution,
        Self::Caching,
        Self::NetworkIsolation,
        Self::Environment,
        Self::TrustStore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VersionResolution => "version-resolution",
            Self::MemorySizing => "memory-sizing",
            Self::Vendoring => "vendoring",
            Self::DependencyResolution => "dependency-resolution",
            Self::Caching => "caching",
            Self::NetworkIsolation => "network-isolation",
            Self::Environment => "environment",
            Self::TrustStore => "trust-store",
        }
    }
}

impl fmt::Display for CapabilityArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityArea {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|area| area.as_str() == s)
            .ok_or_else(|| HarnessError::config(format!("unknown capability area: {s}")))
    }
}

/// What staging is expected to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    Success,
    /// The platform reports a nonzero exit; checks then look at the failure output.
    Failure,
}

/// One post-staging check.
#[derive(Debug, Clone)]
pub enum Check {
    /// The log eventually shows a runtime version matching the pattern.
    VersionAppears { pattern: Pattern },
    LogMatches {
        pattern: Pattern,
        within: Option<Duration>,
    },
    LogContains {
        needle: String,
        within: Option<Duration>,
    },
    BodyContains { path: String, needle: String },
    BodyMatches { path: String, pattern: Pattern },
    BodyEquals { path: String, expected: String },
    /// No outbound connections while staging. Requires a traffic observer.
    NoOutboundNetwork,
    /// Staging traffic went through the proxy, when one is configured.
    UsedProxyIfConfigured,
    BuildpackVersionConfirmed,
    FixturePath { relative: String, is_dir: bool },
    /// Run a one-shot task and wait for its output in the log.
    TaskOutput {
        command: String,
        pattern: Pattern,
        within: Option<Duration>,
    },
    /// Mutually exclusive checks keyed on the run mode.
    ModeBranch {
        cached: Vec<Check>,
        uncached: Vec<Check>,
    },
}

impl Check {
    pub fn version(pattern: &str) -> Result<Self, HarnessError> {
        Ok(Self::VersionAppears {
            pattern: Pattern::new(pattern)?,
        })
    }

    pub fn log_matches(pattern: &str, within: Option<Duration>) -> Result<Self, HarnessError> {
        Ok(Self::LogMatches {
            pattern: Pattern::new(pattern)?,
            within,
        })
    }

    pub fn log_contains(needle: &str) -> Self {
        Self::LogContains {
            needle: needle.to_string(),
            within: None,
        }
    }

    pub fn body_contains(path: &str, needle: &str) -> Self {
        Self::BodyContains {
            path: path.to_string(),
            needle: needle.to_string(),
        }
    }

    pub fn body_matches(path: &str, pattern: &str) -> Result<Self, HarnessError> {
        Ok(Self::BodyMatches {
            path: path.to_string(),
            pattern: Pattern::new(pattern)?,
        })
    }

    pub fn body_equals(path: &str, expected: &str) -> Self {
        Self::BodyEquals {
            path: path.to_string(),
            expected: expected.to_string(),
        }
    }

    pub fn fixture_dir(relative: &str, is_dir: bool) -> Self {
        Self::FixturePath {
            relative: relative.to_string(),
            is_dir,
        }
    }

    pub fn task(command: &str, pattern: &str, within: Duration) -> Result<Self, HarnessError> {
        Ok(Self::TaskOutput {
            command: command.to_string(),
            pattern: Pattern::new(pattern)?,
            within: Some(within),
        })
    }

    /// Short label used in reports.
    pub fn label(&self) -> String {
        match self {
            Self::VersionAppears { pattern } => format!("version {pattern}"),
            Self::LogMatches { pattern, .. } => format!("log matches {pattern}"),
            Self::LogContains { needle, .. } => format!("log contains {needle:?}"),
            Self::BodyContains { path, needle } => format!("GET {path} contains {needle:?}"),
            Self::BodyMatches { path, pattern } => format!("GET {path} matches {pattern}"),
            Self::BodyEquals { path, expected } => format!("GET {path} equals {expected:?}"),
            Self::NoOutboundNetwork => "no outbound network during staging".to_string(),
            Self::UsedProxyIfConfigured => "staging used proxy".to_string(),
            Self::BuildpackVersionConfirmed => "buildpack version confirmed".to_string(),
            Self::FixturePath { relative, is_dir } => {
                let neg = if *is_dir { "" } else { "not " };
                format!("fixture {relative} is {neg}a directory")
            }
            Self::TaskOutput { command, .. } => format!("task {command:?}"),
            Self::ModeBranch { .. } => "cached/uncached branch".to_string(),
        }
    }

    /// Whether evaluating this check needs a recorded traffic log.
    fn needs_traffic(&self, proxy_configured: bool) -> bool {
        match self {
            Self::NoOutboundNetwork => true,
            Self::UsedProxyIfConfigured => proxy_configured,
            Self::ModeBranch { cached, uncached } => cached
                .iter()
                .chain(uncached)
                .any(|c| c.needs_traffic(proxy_configured)),
            _ => false,
        }
    }
}

/// Preconditions for running a scenario at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requirements {
    pub mode: Option<RunMode>,
    pub tasks: bool,
    pub symlinks: bool,
}

/// A declared test case.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub area: CapabilityArea,
    pub fixture: String,
    pub env: BTreeMap<String, String>,
    pub expect: Expectation,
    pub checks: Vec<Check>,
    pub requires: Requirements,
    /// Declared but not yet expected to pass; always reported as skipped.
    pub pending: bool,
}

impl Scenario {
    pub fn new(name: &str, area: CapabilityArea, fixture: &str) -> Self {
        Self {
            name: name.to_string(),
            area,
            fixture: fixture.to_string(),
            env: BTreeMap::new(),
            expect: Expectation::Success,
            checks: Vec::new(),
            requires: Requirements::default(),
            pending: false,
        }
    }

    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn expect_failure(mut self) -> Self {
        self.expect = Expectation::Failure;
        self
    }

    #[must_use]
    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    #[must_use]
    pub fn requires_mode(mut self, mode: RunMode) -> Self {
        self.requires.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn requires_tasks(mut self) -> Self {
        self.requires.tasks = true;
        self
    }

    #[must_use]
    pub fn requires_symlinks(mut self) -> Self {
        self.requires.symlinks = true;
        self
    }

    #[must_use]
    pub fn pending(mut self) -> Self {
        self.pending = true;
        self
    }

    /// Checks to run in `mode`, with mode branches resolved.
    pub fn checks_for(&self, mode: RunMode) -> Vec<&Check> {
        fn flatten<'a>(checks: &'a [Check], mode: RunMode, out: &mut Vec<&'a Check>) {
            for check in checks {
                match check {
                    Check::ModeBranch { cached, uncached } => {
                        let branch = match mode {
                            RunMode::Cached => cached,
                            RunMode::Uncached => uncached,
                        };
                        flatten(branch, mode, out);
                    }
                    other => out.push(other),
                }
            }
        }

        let mut out = Vec::new();
        flatten(&self.checks, mode, &mut out);
        out
    }

    /// Whether the staging window must be observed for network traffic.
    pub fn needs_traffic(&self, mode: RunMode, proxy_configured: bool) -> bool {
        self.checks_for(mode)
            .iter()
            .any(|c| c.needs_traffic(proxy_configured))
    }

    /// Whether the scenario must prove that staging made no direct
    /// connections, which a proxy log alone cannot show.
    pub fn needs_direct_traffic(&self, mode: RunMode) -> bool {
        self.checks_for(mode)
            .iter()
            .any(|c| matches!(c, Check::NoOutboundNetwork))
    }

    /// Why this scenario cannot run with the given mode and capabilities.
    pub fn skip_reason(&self, mode: RunMode, capabilities: &Capabilities) -> Option<String> {
        if self.pending {
            return Some("pending".to_string());
        }
        if let Some(required) = self.requires.mode {
            if required != mode {
                return Some(format!("requires {required} buildpack, running {mode}"));
            }
        }
        if self.requires.tasks && !capabilities.tasks {
            return Some("requires platform task support".to_string());
        }
        if self.requires.symlinks && !capabilities.symlinks {
            return Some("requires api symlink support".to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branching() -> Scenario {
        Scenario::new("vendored", CapabilityArea::Caching, "vendored_dependencies")
            .check(Check::body_contains("/", "0000000005"))
            .check(Check::ModeBranch {
                cached: vec![Check::log_contains("Copy [/tmp/buildpacks/")],
                uncached: vec![
                    Check::log_contains("Download [https://"),
                    Check::NoOutboundNetwork,
                ],
            })
    }

    #[test]
    fn test_mode_branches_are_exclusive() {
        let scenario = branching();

        let cached: Vec<String> = scenario
            .checks_for(RunMode::Cached)
            .iter()
            .map(|c| c.label())
            .collect();
        assert_eq!(cached.len(), 2);
        assert!(cached[1].contains("Copy"));

        let uncached = scenario.checks_for(RunMode::Uncached);
        assert_eq!(uncached.len(), 3);
        assert!(uncached.iter().all(|c| !c.label().contains("Copy")));
    }

    #[test]
    fn test_needs_traffic_follows_branches_and_proxy() {
        let scenario = branching();
        assert!(!scenario.needs_traffic(RunMode::Cached, false));
        assert!(scenario.needs_traffic(RunMode::Uncached, false));

        let proxy = Scenario::new("proxy", CapabilityArea::NetworkIsolation, "with_yarn")
            .check(Check::UsedProxyIfConfigured);
        assert!(!proxy.needs_traffic(RunMode::Cached, false));
        assert!(proxy.needs_traffic(RunMode::Cached, true));
        assert!(!proxy.needs_direct_traffic(RunMode::Cached));
        assert!(scenario.needs_direct_traffic(RunMode::Uncached));
        assert!(!scenario.needs_direct_traffic(RunMode::Cached));
    }

    #[test]
    fn test_skip_reasons() {
        let caps = Capabilities::default();
        let base = Scenario::new("s", CapabilityArea::Environment, "logenv");

        assert!(base.skip_reason(RunMode::Cached, &caps).is_none());
        assert_eq!(
            base.clone().pending().skip_reason(RunMode::Cached, &caps),
            Some("pending".to_string())
        );
        assert!(base
            .clone()
            .requires_mode(RunMode::Cached)
            .skip_reason(RunMode::Uncached, &caps)
            .is_some());
        assert!(base
            .clone()
            .requires_tasks()
            .skip_reason(RunMode::Cached, &caps)
            .is_some());
        assert!(base
            .clone()
            .requires_symlinks()
            .skip_reason(RunMode::Cached, &Capabilities::full())
            .is_none());
    }

    #[test]
    fn test_area_parse_roundtrip() {
        for area in CapabilityArea::ALL {
            assert_eq!(area.as_str().parse::<CapabilityArea>().unwrap(), area);
        }
        assert!("nope".parse::<CapabilityArea>().is_err());
    }
}
