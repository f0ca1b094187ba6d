//! # bpverify-id
//!
//! Unique names for the things a verification run creates on the platform.
//!
//! Every deployment the harness pushes needs a name that no other deployment
//! in the same org/space is using, including deployments left behind by an
//! aborted earlier run. Names are `{prefix}-{ulid}` with the ULID rendered in
//! lowercase, because the platform derives route hostnames from app names and
//! hostnames are lowercase DNS labels.
//!
//! Examples:
//! - `bpv-01hv4z2wqxkjnm8gpqy6vbkc3d`
//! - `run-01hv4z3mxnkpqr9hstz7wcld4e`

mod error;
mod macros;
mod types;

pub use error::NameError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
