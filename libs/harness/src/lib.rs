//! bpverify harness library
//!
//! Verifies a buildpack by deploying fixture applications to a real platform
//! and asserting on what happens: the staging log, the running app's HTTP
//! responses, and the network traffic seen while staging.
//!
//! ## Layout
//!
//! ```text
//! ExecutionController
//! ├── DeploymentDriver      (create / stage / http_get / run_task / destroy)
//! │   └── dyn Platform      (CfCli, ScriptedPlatform)
//! ├── assertions            (poll-based checks over logs and HTTP bodies)
//! └── ObserverScope         (process-wide traffic observer, one window at a time)
//! ```
//!
//! Scenarios are plain data (see [`scenario`]); the Node.js catalog lives in
//! [`catalog`].

pub mod assertions;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod logbuf;
pub mod observer;
pub mod platform;
pub mod poll;
pub mod report;
pub mod scenario;

pub use assertions::{AssertionFailure, Pattern, Verdict};
pub use catalog::Catalog;
pub use config::HarnessConfig;
pub use controller::{ExecutionController, PlannedScenario, SuiteSettings};
pub use driver::{Deployment, DeploymentDriver, DeploymentState, Fixture};
pub use error::{HarnessError, Result};
pub use logbuf::LogBuffer;
pub use poll::PollConfig;
pub use report::{Outcome, ScenarioReport, SuiteReport};
pub use scenario::{CapabilityArea, Check, Expectation, RunMode, Scenario};
