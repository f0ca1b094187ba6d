//! End-to-end run of the Node.js catalog.
//!
//! The platform is scripted to behave like a correct buildpack: staging
//! prints the expected banners, negative-path fixtures fail with the
//! dependency-resolution message, and each app's route points at a wiremock
//! server answering with that app's body. Every scenario that is not skipped
//! must pass, and no deployment may outlive the run.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p bpverify-e2e --test nodejs_catalog
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bpverify_harness::catalog;
use bpverify_harness::observer::{Connection, ScriptedObserver, TrafficObserver};
use bpverify_harness::platform::{Capabilities, ScriptedApp, ScriptedPlatform};
use bpverify_harness::{ExecutionController, Outcome, PollConfig, RunMode, SuiteReport, SuiteSettings};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BUILDPACK_VERSION: &str = "1.6.20";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn serve(route: &str, body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    server
}

/// Routes the scripted apps answer on. Kept alive for the whole test.
struct Apps {
    hello: MockServer,
    optimized: MockServer,
    unoptimized: MockServer,
    vendored: MockServer,
    scripts: MockServer,
    logenv: MockServer,
    openssl: MockServer,
}

impl Apps {
    async fn start() -> Self {
        Self {
            hello: serve("/", "Hello, World!").await,
            optimized: serve("/", "NodeOptions: --max_old_space_size=96").await,
            unoptimized: serve("/", "NodeOptions: undefined").await,
            vendored: serve("/", "0000000005").await,
            scripts: serve(
                "/",
                "Text: heroku-prebuild\npreinstall\npostinstall\nheroku-postbuild\n",
            )
            .await,
            logenv: serve(
                "/",
                r#"{"NODE_HOME":"/tmp/contents123/node","NODE_ENV":"production","MEMORY_AVAILABLE":"128"}"#,
            )
            .await,
            openssl: serve("/", "Response over self signed https").await,
        }
    }
}

fn app(lines: &[&str]) -> ScriptedApp {
    ScriptedApp::staging(lines)
        .staging_time(Duration::from_millis(20))
        .buildpack_version(BUILDPACK_VERSION)
}

fn scripted_platform(apps: &Apps, mode: RunMode, capabilities: Capabilities) -> ScriptedPlatform {
    let node = &["-----> Installing binaries", "\x1b[1mNodeJS 6.11.1\x1b[0m"];
    let vendoring = match mode {
        RunMode::Cached => "Copy [/tmp/buildpacks/4a1b/dependencies/node-6.11.1.tgz]",
        RunMode::Uncached => "Download [https://buildpacks.cloudfoundry.org/node-6.11.1.tgz]",
    };

    ScriptedPlatform::new(capabilities)
        .script("node_version_range", app(node).route(apps.hello.uri()))
        .script(
            "node_version_6",
            app(node)
                .route(apps.hello.uri())
                .task(&["[APP/TASK/1/0] OUT RUNNING A TASK: v6.11.1"]),
        )
        .script("without_node_version", app(node).route(apps.hello.uri()))
        .script(
            "unreleased_node_version",
            ScriptedApp::failing(1, &["-----> Installing binaries"])
                .late(
                    Duration::from_millis(300),
                    &["**ERROR** no valid dependencies for node, 9000.0.0, and 6.11.1 in [...]"],
                )
                .buildpack_version(BUILDPACK_VERSION),
        )
        .script(
            "unsupported_node_version",
            ScriptedApp::failing(
                1,
                &[
                    "-----> Installing binaries",
                    "**ERROR** no valid dependencies for node 4.1.1, and 6.11.1 in [...]",
                ],
            )
            .buildpack_version(BUILDPACK_VERSION),
        )
        .script("simple_app", app(node).route(apps.unoptimized.uri()))
        .script(
            "simple_app",
            app(node)
                .when_env("OPTIMIZE_MEMORY", "true")
                .route(apps.optimized.uri()),
        )
        .script("simple_app_with_nvmrc", app(node).route(apps.unoptimized.uri()))
        .script(
            "vendored_dependencies",
            app(&[vendoring]).route(apps.vendored.uri()),
        )
        .script("vendored_dependencies_with_binaries", app(node))
        .script("incomplete_node_modules", app(node).route(apps.hello.uri()))
        .script("incomplete_package_json", app(node).route(apps.hello.uri()))
        .script("no_vendored_dependencies", app(node).route(apps.hello.uri()))
        .script(
            "with_yarn",
            app(&["-----> Running yarn in online mode"]).route(apps.hello.uri()),
        )
        .script(
            "out_of_date_yarn_lock",
            app(&["**WARNING** yarn.lock is outdated"]),
        )
        .script(
            "pre_post_commands",
            app(node)
                .route(apps.scripts.uri())
                .late(Duration::from_millis(200), &["postinstall /home/vcap/app"]),
        )
        .script(
            "logenv",
            app(&["Writing NODE_HOME to .profile.d/nodejs.sh"]).route(apps.logenv.uri()),
        )
        .script(
            "use-openssl-ca",
            app(node).route(apps.openssl.uri()),
        )
        .script("with_mysql", app(node))
}

fn fixtures() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("incomplete_node_modules/node_modules/express")).unwrap();
    std::fs::create_dir_all(dir.path().join("no_vendored_dependencies")).unwrap();
    std::fs::create_dir_all(dir.path().join("with_yarn")).unwrap();
    dir
}

fn settings(fixtures: &Path, mode: RunMode, capabilities: Capabilities) -> SuiteSettings {
    SuiteSettings {
        mode,
        capabilities,
        buildpack_version: Some(BUILDPACK_VERSION.to_string()),
        poll: PollConfig::new(Duration::from_secs(3), Duration::from_millis(20)),
        scenario_timeout: Duration::from_secs(30),
        parallelism: 4,
        fixtures_dir: fixtures.to_path_buf(),
        proxy_configured: false,
    }
}

fn assert_no_failures(report: &SuiteReport) {
    let failures: Vec<String> = report
        .failures()
        .map(|r| match &r.outcome {
            Outcome::Failed { diagnostic } => format!("{}: {diagnostic}", r.name),
            _ => unreachable!(),
        })
        .collect();
    assert!(failures.is_empty(), "failures:\n{}", failures.join("\n\n"));
}

fn skipped(report: &SuiteReport) -> Vec<&str> {
    report
        .results
        .iter()
        .filter(|r| matches!(r.outcome, Outcome::Skipped { .. }))
        .map(|r| r.name.as_str())
        .collect()
}

async fn run_catalog(
    mode: RunMode,
    capabilities: Capabilities,
) -> (SuiteReport, Arc<ScriptedPlatform>) {
    let apps = Apps::start().await;
    let fixtures = fixtures();
    let platform = Arc::new(scripted_platform(&apps, mode, capabilities));
    let observer: Arc<dyn TrafficObserver> = Arc::new(ScriptedObserver::new(vec![]));

    let controller =
        ExecutionController::new(platform.clone(), settings(fixtures.path(), mode, capabilities))
            .with_observer(Some(observer));
    let catalog = catalog::nodejs().unwrap();
    let report = controller.run(catalog.scenarios()).await;
    (report, platform)
}

#[tokio::test]
async fn test_uncached_catalog_on_minimal_platform() {
    init_tracing();
    let (report, platform) = run_catalog(RunMode::Uncached, Capabilities::default()).await;

    assert_no_failures(&report);
    assert_eq!(
        skipped(&report),
        [
            "vendored_dependencies_with_binaries",
            "with_yarn_vendored",
            "with_yarn_vendored_has_no_internet_traffic",
            "node_home_and_env",
        ]
    );
    assert_eq!(report.passed(), 21);
    assert_eq!(platform.live_count(), 0);

    let task = report
        .results
        .iter()
        .find(|r| r.name == "node_version_6")
        .unwrap();
    let Outcome::Passed { notes } = &task.outcome else {
        panic!("node_version_6 did not pass");
    };
    assert_eq!(notes.len(), 1, "{notes:?}");
}

#[tokio::test]
async fn test_cached_catalog_on_full_platform() {
    init_tracing();
    let (report, platform) = run_catalog(RunMode::Cached, Capabilities::full()).await;

    assert_no_failures(&report);
    assert_eq!(
        skipped(&report),
        ["with_yarn_vendored", "with_yarn_vendored_has_no_internet_traffic"]
    );
    assert_eq!(report.passed(), 23);

    for result in &report.results {
        if let Some(name) = &result.deployment {
            assert_eq!(platform.deletes(name), 1, "{}", result.name);
        }
    }
    assert_eq!(platform.live_count(), 0);
}

#[tokio::test]
async fn test_wrong_mode_branch_fails() {
    init_tracing();
    let apps = Apps::start().await;
    let fixtures = fixtures();
    // The platform stages like an uncached buildpack while the run claims cached.
    let platform = Arc::new(scripted_platform(&apps, RunMode::Uncached, Capabilities::full()));
    let controller = ExecutionController::new(
        platform,
        settings(fixtures.path(), RunMode::Cached, Capabilities::full()),
    );

    let catalog = catalog::nodejs().unwrap().filter(Some("vendored_dependencies"), None);
    let scenario = catalog.get("vendored_dependencies").unwrap();
    let report = controller.run_scenario(scenario).await;

    let Outcome::Failed { diagnostic } = report.outcome else {
        panic!("expected the cached branch to fail");
    };
    assert!(diagnostic.contains("Copy [/tmp/buildpacks/"), "{diagnostic}");
    assert!(diagnostic.contains("Download [https://"), "{diagnostic}");
}

#[tokio::test]
async fn test_proxy_scenarios_with_proxy_configured() {
    init_tracing();
    let apps = Apps::start().await;
    let fixtures = fixtures();
    let platform = Arc::new(scripted_platform(&apps, RunMode::Uncached, Capabilities::full()));

    let mut settings = settings(fixtures.path(), RunMode::Uncached, Capabilities::full());
    settings.proxy_configured = true;

    let catalog = catalog::nodejs().unwrap().filter(Some("uses_proxy"), None);
    assert_eq!(catalog.len(), 2);

    let proxied = Arc::new(ScriptedObserver::new(vec![Connection::proxied(
        "CONNECT registry.npmjs.org:443",
    )]));
    let controller = ExecutionController::new(platform.clone(), settings.clone())
        .with_observer(Some(proxied.clone()));
    let report = controller.run(catalog.scenarios()).await;
    assert_eq!(report.passed(), 2);
    assert_eq!(proxied.starts(), 2);

    let direct = Arc::new(ScriptedObserver::new(vec![Connection::direct(
        "104.16.24.35:443",
    )]));
    let controller =
        ExecutionController::new(platform, settings).with_observer(Some(direct));
    let report = controller.run(catalog.scenarios()).await;
    assert_eq!(report.failed(), 2);
}

#[tokio::test]
async fn test_parallel_catalog_keeps_observed_windows_exclusive() {
    init_tracing();
    let mode = RunMode::Cached;
    let (report, platform) = run_catalog(mode, Capabilities::full()).await;
    assert_no_failures(&report);

    let catalog = catalog::nodejs().unwrap();
    let observed = catalog
        .scenarios()
        .iter()
        .zip(&report.results)
        .filter(|(scenario, result)| {
            !matches!(result.outcome, Outcome::Skipped { .. }) && scenario.needs_traffic(mode, false)
        })
        .count();
    assert!(observed > 0);
    assert_eq!(platform.starts_while_observed(), observed);
}

#[tokio::test]
async fn test_proxy_bypass_fails() {
    init_tracing();
    let apps = Apps::start().await;
    let fixtures = fixtures();
    let platform = Arc::new(scripted_platform(&apps, RunMode::Uncached, Capabilities::full()));

    let mut settings = settings(fixtures.path(), RunMode::Uncached, Capabilities::full());
    settings.proxy_configured = true;

    let mixed = Arc::new(ScriptedObserver::new(vec![
        Connection::proxied("CONNECT registry.npmjs.org:443"),
        Connection::direct("104.16.24.35:443"),
    ]));
    let controller = ExecutionController::new(platform.clone(), settings).with_observer(Some(mixed));
    let catalog = catalog::nodejs().unwrap().filter(Some("uses_proxy"), None);
    let report = controller.run(catalog.scenarios()).await;

    assert_eq!(report.failed(), 2);
    for result in report.failures() {
        let Outcome::Failed { diagnostic } = &result.outcome else {
            unreachable!()
        };
        assert!(diagnostic.contains("bypassed the proxy: 104.16.24.35:443"), "{diagnostic}");
    }
    assert_eq!(platform.live_count(), 0);
}

#[tokio::test]
async fn test_report_serializes() {
    init_tracing();
    let (report, _) = run_catalog(RunMode::Uncached, Capabilities::default()).await;
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["mode"], "uncached");
    assert!(json["run_id"].as_str().unwrap().starts_with("run-"));
    assert_eq!(json["results"].as_array().unwrap().len(), 25);
    assert_eq!(json["results"][0]["status"], "passed");
}
