//! The Node.js buildpack scenario catalog.
//!
//! Every scenario pushes one fixture directory from the fixtures root and
//! confirms the buildpack version that staged it; the remaining checks are
//! what each case is about.

use std::time::Duration;

use crate::error::Result;
use crate::scenario::{CapabilityArea, Check, RunMode, Scenario};

/// Version banner printed when the buildpack installs a Node.js 6 runtime.
const NODE_6_BANNER: &str = r"NodeJS 6\.\d+\.\d+";

const HELLO: &str = "Hello, World!";

/// How long a line printed at the end of staging may take to reach the log
/// once staging has returned, whether it succeeded or failed.
const SHORT_LOG_WINDOW: Duration = Duration::from_secs(2);

const TASK_WITHIN: Duration = Duration::from_secs(30);

/// An ordered, named set of scenarios.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    scenarios: Vec<Scenario>,
}

impl Catalog {
    pub fn new(scenarios: Vec<Scenario>) -> Self {
        Self { scenarios }
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    /// Scenarios whose name contains `name` and whose area is `area`, when
    /// given. Order is preserved.
    #[must_use]
    pub fn filter(&self, name: Option<&str>, area: Option<CapabilityArea>) -> Self {
        Self {
            scenarios: self
                .scenarios
                .iter()
                .filter(|s| name.is_none_or(|n| s.name.contains(n)))
                .filter(|s| area.is_none_or(|a| s.area == a))
                .cloned()
                .collect(),
        }
    }
}

impl IntoIterator for Catalog {
    type Item = Scenario;
    type IntoIter = std::vec::IntoIter<Scenario>;

    fn into_iter(self) -> Self::IntoIter {
        self.scenarios.into_iter()
    }
}

/// Push `fixture` and confirm the buildpack version.
fn push(name: &str, area: CapabilityArea, fixture: &str) -> Scenario {
    Scenario::new(name, area, fixture).check(Check::BuildpackVersionConfirmed)
}

fn no_internet(fixture: &str) -> Scenario {
    Scenario::new(
        &format!("{fixture}_has_no_internet_traffic"),
        CapabilityArea::NetworkIsolation,
        fixture,
    )
    .env("BP_DEBUG", "true")
    .check(Check::NoOutboundNetwork)
}

fn uses_proxy(fixture: &str) -> Scenario {
    Scenario::new(
        &format!("{fixture}_uses_proxy_during_staging"),
        CapabilityArea::NetworkIsolation,
        fixture,
    )
    .env("BP_DEBUG", "true")
    .check(Check::UsedProxyIfConfigured)
}

/// Staging is expected to fail with a dependency-resolution message naming
/// `version`. The pattern tolerates both message shapes the buildpack has
/// printed (with and without a comma after `node`).
fn unresolvable_version(name: &str, fixture: &str, version: &str) -> Result<Scenario> {
    let pattern = format!(
        r"no valid dependencies for node,? {}, and .* in",
        regex::escape(version)
    );
    Ok(Scenario::new(name, CapabilityArea::VersionResolution, fixture)
        .expect_failure()
        .check(Check::log_matches(&pattern, Some(SHORT_LOG_WINDOW))?)
        .check(Check::BuildpackVersionConfirmed))
}

/// The full Node.js catalog.
pub fn nodejs() -> Result<Catalog> {
    use CapabilityArea::*;

    let scenarios = vec![
        // Runtime version resolution.
        push("node_version_range", VersionResolution, "node_version_range")
            .check(Check::version(NODE_6_BANNER)?)
            .check(Check::body_contains("/", HELLO)),
        push("node_version_6", VersionResolution, "node_version_6")
            .check(Check::version(NODE_6_BANNER)?)
            .check(Check::body_contains("/", HELLO))
            .check(Check::task(
                r#"echo "RUNNING A TASK: $(node --version)""#,
                r"RUNNING A TASK: v6\.\d+\.\d+",
                TASK_WITHIN,
            )?),
        push("without_node_version", VersionResolution, "without_node_version")
            .check(Check::version(NODE_6_BANNER)?)
            .check(Check::body_contains("/", HELLO)),
        unresolvable_version("unreleased_node_version", "unreleased_node_version", "9000.0.0")?,
        unresolvable_version("unsupported_node_version", "unsupported_node_version", "4.1.1")?,
        // Memory sizing.
        push("optimize_memory", MemorySizing, "simple_app")
            .env("OPTIMIZE_MEMORY", "true")
            .check(Check::body_contains("/", "NodeOptions: --max_old_space_size=96")),
        push("default_memory", MemorySizing, "simple_app")
            .check(Check::body_contains("/", "NodeOptions: undefined")),
        push("nvmrc_takes_precedence", VersionResolution, "simple_app_with_nvmrc")
            .check(Check::body_contains("/", "NodeOptions: undefined")),
        // Vendored node_modules.
        push("vendored_dependencies", Caching, "vendored_dependencies")
            .env("BP_DEBUG", "true")
            .check(Check::body_contains("/", "0000000005"))
            .check(Check::ModeBranch {
                cached: vec![Check::log_contains("Copy [/tmp/buildpacks/")],
                uncached: vec![Check::log_contains("Download [https://")],
            }),
        no_internet("vendored_dependencies"),
        push(
            "vendored_dependencies_with_binaries",
            Vendoring,
            "vendored_dependencies_with_binaries",
        )
        .env("BP_DEBUG", "true")
        .requires_symlinks(),
        push("with_yarn_vendored", Vendoring, "with_yarn_vendored")
            .env("BP_DEBUG", "true")
            .check(Check::fixture_dir("node_modules", true))
            .check(Check::log_contains("Running yarn in offline mode"))
            .check(Check::body_matches("/microtime", r"native time: \d+\.\d+")?)
            .pending(),
        no_internet("with_yarn_vendored").pending(),
        push("incomplete_node_modules", Vendoring, "incomplete_node_modules")
            .check(Check::fixture_dir("node_modules", true))
            .check(Check::fixture_dir("node_modules/hashish", false))
            .check(Check::body_equals("/", HELLO)),
        push("incomplete_package_json", Vendoring, "incomplete_package_json")
            .check(Check::body_equals("/", HELLO)),
        // No vendored node_modules.
        push("no_vendored_dependencies", DependencyResolution, "no_vendored_dependencies")
            .env("BP_DEBUG", "true")
            .check(Check::fixture_dir("node_modules", false))
            .check(Check::body_contains("/", HELLO)),
        uses_proxy("no_vendored_dependencies"),
        push("with_yarn", DependencyResolution, "with_yarn")
            .env("BP_DEBUG", "true")
            .check(Check::fixture_dir("node_modules", false))
            .check(Check::log_contains("Running yarn in online mode"))
            .check(Check::body_contains("/", HELLO)),
        uses_proxy("with_yarn"),
        push("out_of_date_yarn_lock", DependencyResolution, "out_of_date_yarn_lock")
            .check(Check::log_contains("yarn.lock is outdated")),
        push("pre_post_commands", DependencyResolution, "pre_post_commands").check(
            Check::body_contains(
                "/",
                "Text: heroku-prebuild\npreinstall\npostinstall\nheroku-postbuild\n",
            ),
        ),
        push("postinstall_in_app_dir", DependencyResolution, "pre_post_commands").check(
            Check::LogContains {
                needle: "postinstall /home/vcap/app".to_string(),
                within: Some(SHORT_LOG_WINDOW),
            },
        ),
        // Environment propagation.
        push("node_home_and_env", Environment, "logenv")
            .requires_mode(RunMode::Cached)
            .check(Check::log_matches("Writing NODE_HOME", None)?)
            .check(Check::body_matches("/", r#""NODE_HOME":"[^"]*/node""#)?)
            .check(Check::body_contains("/", r#""NODE_ENV":"production""#))
            .check(Check::body_contains("/", r#""MEMORY_AVAILABLE":"128""#)),
        // Trust store.
        push("system_ca_store", TrustStore, "use-openssl-ca")
            .env("SSL_CERT_FILE", "cert.pem")
            .check(Check::body_contains("/", "Response over self signed https")),
        push("with_mysql", DependencyResolution, "with_mysql"),
    ];

    Ok(Catalog::new(scenarios))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Expectation;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_builds_with_unique_names() {
        let catalog = nodejs().unwrap();
        assert_eq!(catalog.len(), 25);

        let names: HashSet<&str> = catalog.scenarios().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.len(), catalog.len());
    }

    #[test]
    fn test_every_scenario_confirms_or_observes() {
        for scenario in nodejs().unwrap() {
            let confirms = scenario
                .checks
                .iter()
                .any(|c| matches!(c, Check::BuildpackVersionConfirmed));
            let observes = scenario.area == CapabilityArea::NetworkIsolation;
            assert!(confirms || observes, "{}", scenario.name);
        }
    }

    #[test]
    fn test_late_log_scenarios_use_short_window() {
        let catalog = nodejs().unwrap();
        for name in ["unreleased_node_version", "unsupported_node_version"] {
            let scenario = catalog.get(name).unwrap();
            assert_eq!(scenario.expect, Expectation::Failure);
            let Check::LogMatches { pattern, within } = &scenario.checks[0] else {
                panic!("{name}: first check should match the log");
            };
            assert_eq!(*within, Some(SHORT_LOG_WINDOW));
            assert!(pattern.is_match("no valid dependencies for node, 9000.0.0, and x in")
                || pattern.is_match("no valid dependencies for node 4.1.1, and x in"));
        }

        let postinstall = catalog.get("postinstall_in_app_dir").unwrap();
        assert_eq!(postinstall.expect, Expectation::Success);
        assert!(postinstall.checks.iter().any(|c| matches!(
            c,
            Check::LogContains { within, .. } if *within == Some(SHORT_LOG_WINDOW)
        )));
    }

    #[test]
    fn test_requirements() {
        let catalog = nodejs().unwrap();
        assert!(catalog.get("vendored_dependencies_with_binaries").unwrap().requires.symlinks);
        assert_eq!(
            catalog.get("node_home_and_env").unwrap().requires.mode,
            Some(RunMode::Cached)
        );
        assert!(catalog.get("with_yarn_vendored").unwrap().pending);
        assert!(catalog.get("with_yarn_vendored_has_no_internet_traffic").unwrap().pending);
    }

    #[test]
    fn test_filter_by_name_and_area() {
        let catalog = nodejs().unwrap();

        let yarn = catalog.filter(Some("yarn"), None);
        assert!(yarn.len() >= 4);
        assert!(yarn.scenarios().iter().all(|s| s.name.contains("yarn")));

        let proxy = catalog.filter(Some("proxy"), Some(CapabilityArea::NetworkIsolation));
        assert_eq!(proxy.len(), 2);

        assert!(catalog.filter(Some("nope"), None).is_empty());
    }
}
