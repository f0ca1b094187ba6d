//! Typed names used by the harness.

use crate::define_name;

define_name!(DeploymentName, "bpv");
define_name!(RunId, "run");
