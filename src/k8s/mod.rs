//! Cluster object helpers
//!
//! Thin wrappers around the Kubernetes API (and `kubectl` where the scenario
//! needs the CLI) for the objects scenarios create, inspect and delete.

pub mod configmap;
pub mod deployment;
pub mod namespace;
pub mod pod;
pub mod service_account;
pub mod storage;

use std::collections::BTreeMap;
use std::time::Duration;

/// Label put on every object the harness creates.
pub const E2E_LABEL: &str = "velero-e2e";

/// Interval used by the readiness polls in this module.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) fn e2e_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(E2E_LABEL.to_string(), "true".to_string())])
}
