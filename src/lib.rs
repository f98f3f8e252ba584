//! End-to-end backup and restore scenarios for Velero
//!
//! Scenarios install a workload, back it up, delete it, restore it and check
//! the data survived. Velero is driven through its CLI; cluster objects are
//! managed through the Kubernetes API and `kubectl`.

pub mod config;
pub mod error;
pub mod exec;
pub mod k8s;
pub mod kibishii;
pub mod policy;
pub mod providers;
pub mod scenario;
pub mod telemetry;
pub mod velero;
pub mod wait;

pub use config::E2eConfig;
pub use error::{Error, Result};

/// Select the process-wide rustls provider. Must run before the first kube
/// or S3 client is built; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
