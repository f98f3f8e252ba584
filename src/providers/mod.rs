//! Cloud-side snapshot verification
//!
//! After a snapshot backup, the harness records a [`SnapshotCheckpoint`]
//! (which persistent volumes should have been snapshotted) and then polls the
//! object store until the backup's snapshot metadata shows them all.

pub mod aws;
pub mod vsphere;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tracing::{info, instrument, warn};

use crate::config::{AdditionalBsl, E2eConfig};
use crate::error::{Error, Result};
use crate::k8s::{pod, storage};

/// Number of times the provider is asked before verification gives up.
pub const SNAPSHOT_CHECK_ATTEMPTS: u32 = 10;
pub const SNAPSHOT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Object store providers whose snapshot metadata the harness can read.
pub const SNAPSHOT_VERIFICATION_PROVIDERS: [&str; 1] = ["aws"];

pub fn supports_snapshot_verification(provider: &str) -> bool {
    SNAPSHOT_VERIFICATION_PROVIDERS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(provider))
}

/// Expected provider-side snapshots of one backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCheckpoint {
    pub backup_name: String,
    pub namespace: String,
    pub expected_count: usize,
    pub pod_names: Vec<String>,
    /// Persistent volumes bound to the claims of `pod_names`
    pub volume_names: Vec<String>,
}

/// One volume snapshot recorded in a backup's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSnapshot {
    pub persistent_volume_name: String,
    pub snapshot_id: Option<String>,
    pub phase: String,
}

/// Where backups of a storage location live.
#[derive(Debug, Clone)]
pub struct ObjectStoreLocation {
    pub provider: String,
    pub credentials_file: Option<PathBuf>,
    pub bucket: String,
    pub prefix: String,
    /// `key=value,...` location config, as given to `velero install`
    pub config: String,
}

impl ObjectStoreLocation {
    /// The default storage location installed with Velero.
    pub fn from_config(config: &E2eConfig) -> Self {
        Self {
            provider: config.object_store_provider().to_string(),
            credentials_file: config.cloud_credentials_file.clone(),
            bucket: config.bsl_bucket.clone(),
            prefix: config.bsl_prefix.clone(),
            config: config.bsl_config.clone(),
        }
    }

    pub fn from_additional(bsl: &AdditionalBsl<'_>) -> Self {
        Self {
            provider: bsl.provider.to_string(),
            credentials_file: Some(bsl.credentials.clone()),
            bucket: bsl.bucket.to_string(),
            prefix: bsl.prefix.to_string(),
            config: bsl.config.to_string(),
        }
    }
}

#[async_trait]
pub trait ObjectStoreProvider: Send + Sync {
    /// Snapshots recorded for `backup_name`; empty while metadata is not uploaded yet.
    async fn recorded_snapshots(&self, backup_name: &str) -> anyhow::Result<Vec<RecordedSnapshot>>;
}

/// Provider client for the location's object store.
pub async fn object_store_provider(location: &ObjectStoreLocation) -> Result<Box<dyn ObjectStoreProvider>> {
    match location.provider.to_ascii_lowercase().as_str() {
        "aws" => Ok(Box::new(aws::S3SnapshotStore::connect(location).await?)),
        other => Err(Error::ConfigError(format!(
            "snapshot verification is not supported for provider {other:?}"
        ))),
    }
}

/// Record the persistent volumes behind the claims of `pod_names`.
#[instrument(skip(client))]
pub async fn snapshot_checkpoint(
    client: &Client,
    namespace: &str,
    backup_name: &str,
    pod_names: &[&str],
    expected_count: usize,
) -> Result<SnapshotCheckpoint> {
    let pods = pod::list_pods(client, namespace).await?;
    let mut volume_names = Vec::new();

    for name in pod_names {
        let pod = pods
            .iter()
            .find(|p| p.metadata.name.as_deref() == Some(*name))
            .ok_or_else(|| Error::Verification(format!("pod {namespace}/{name} not found")))?;
        for (_, claim) in pod::pod_volume_claims(pod) {
            let Some(claim) = claim else { continue };
            match storage::bound_volume_name(client, namespace, &claim).await? {
                Some(pv) => volume_names.push(pv),
                None => {
                    return Err(Error::Verification(format!(
                        "claim {namespace}/{claim} of pod {name} is not bound"
                    )))
                }
            }
        }
    }

    info!(
        "Snapshot checkpoint for backup {}: {} volumes, expecting {} snapshots",
        backup_name,
        volume_names.len(),
        expected_count
    );
    Ok(SnapshotCheckpoint {
        backup_name: backup_name.to_string(),
        namespace: namespace.to_string(),
        expected_count,
        pod_names: pod_names.iter().map(|s| s.to_string()).collect(),
        volume_names,
    })
}

/// Completed snapshots in `recorded` that belong to the checkpoint's volumes.
pub fn matching_snapshots(checkpoint: &SnapshotCheckpoint, recorded: &[RecordedSnapshot]) -> usize {
    recorded
        .iter()
        .filter(|s| s.phase == crate::velero::PHASE_COMPLETED)
        .filter(|s| checkpoint.volume_names.contains(&s.persistent_volume_name))
        .count()
}

/// Poll the provider until the checkpoint's snapshot count shows up or the
/// attempt budget runs out.
#[instrument(skip(provider, checkpoint), fields(backup = %checkpoint.backup_name))]
pub async fn snapshots_should_be_created(
    provider: &dyn ObjectStoreProvider,
    checkpoint: &SnapshotCheckpoint,
    attempts: u32,
    interval: Duration,
) -> Result<()> {
    let mut observed = 0;
    let mut last_error = None;
    for attempt in 1..=attempts {
        match provider.recorded_snapshots(&checkpoint.backup_name).await {
            Ok(recorded) => {
                last_error = None;
                observed = matching_snapshots(checkpoint, &recorded);
                if observed == checkpoint.expected_count {
                    info!(
                        "Found {} snapshots for backup {}",
                        observed, checkpoint.backup_name
                    );
                    return Ok(());
                }
                info!(
                    attempt,
                    "Found {} of {} snapshots for backup {}",
                    observed,
                    checkpoint.expected_count,
                    checkpoint.backup_name
                );
            }
            Err(e) => {
                warn!(attempt, "Failed to list snapshots: {:#}", e);
                last_error = Some(format!("{e:#}"));
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    if let Some(e) = last_error {
        return Err(Error::Provider(format!(
            "failed to list snapshots of backup {} after {} attempts: {}",
            checkpoint.backup_name, attempts, e
        )));
    }
    Err(Error::Verification(format!(
        "expected {} snapshots for backup {} in namespace {}, observed {} after {} attempts",
        checkpoint.expected_count, checkpoint.backup_name, checkpoint.namespace, observed, attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn checkpoint() -> SnapshotCheckpoint {
        SnapshotCheckpoint {
            backup_name: "backup-1".into(),
            namespace: "kibishii-workload".into(),
            expected_count: 2,
            pod_names: vec!["kibishii-deployment-0".into(), "kibishii-deployment-1".into()],
            volume_names: vec!["pv-a".into(), "pv-b".into()],
        }
    }

    fn snap(pv: &str, phase: &str) -> RecordedSnapshot {
        RecordedSnapshot {
            persistent_volume_name: pv.into(),
            snapshot_id: Some(format!("snap-{pv}")),
            phase: phase.into(),
        }
    }

    /// Returns one more completed snapshot on every call.
    struct GrowingStore {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ObjectStoreProvider for GrowingStore {
        async fn recorded_snapshots(&self, _backup: &str) -> anyhow::Result<Vec<RecordedSnapshot>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                anyhow::bail!("metadata not uploaded yet");
            }
            Ok(["pv-a", "pv-b"]
                .iter()
                .take(n as usize)
                .map(|pv| snap(pv, "Completed"))
                .collect())
        }
    }

    #[test]
    fn only_completed_snapshots_of_checkpoint_volumes_count() {
        let recorded = vec![
            snap("pv-a", "Completed"),
            snap("pv-b", "InProgress"),
            snap("pv-other", "Completed"),
        ];
        assert_eq!(matching_snapshots(&checkpoint(), &recorded), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_expected_count() {
        let store = GrowingStore {
            calls: AtomicU32::new(0),
        };
        snapshots_should_be_created(&store, &checkpoint(), 5, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_is_descriptive() {
        let store = GrowingStore {
            calls: AtomicU32::new(0),
        };
        let err = snapshots_should_be_created(&store, &checkpoint(), 2, Duration::from_secs(30))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("expected 2 snapshots for backup backup-1"));
        assert!(msg.contains("observed 1 after 2 attempts"));
    }

    struct BrokenStore;

    #[async_trait]
    impl ObjectStoreProvider for BrokenStore {
        async fn recorded_snapshots(&self, _backup: &str) -> anyhow::Result<Vec<RecordedSnapshot>> {
            anyhow::bail!("access denied")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_listing_failure_is_a_provider_error() {
        let err = snapshots_should_be_created(&BrokenStore, &checkpoint(), 3, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(ref m) if m.contains("access denied")));
    }

    #[test]
    fn location_follows_the_object_store_provider() {
        let config = crate::config::test_config(&[
            "--cloud-provider",
            "vsphere",
            "--object-store-provider",
            "aws",
            "--bsl-bucket",
            "velero-bucket",
        ]);
        let location = ObjectStoreLocation::from_config(&config);
        assert_eq!(location.provider, "aws");
        assert_eq!(location.bucket, "velero-bucket");
        assert!(supports_snapshot_verification(&location.provider));
        assert!(!supports_snapshot_verification("gcp"));
    }

    #[test]
    fn additional_location_reads_its_own_bucket() {
        let config = crate::config::test_config(&[
            "--cloud-provider",
            "aws",
            "--bsl-bucket",
            "default-bucket",
            "--bsl-prefix",
            "default-prefix",
            "--additional-bsl-provider",
            "aws",
            "--additional-bsl-bucket",
            "extra-bucket",
            "--additional-bsl-prefix",
            "extra-prefix",
            "--additional-bsl-config",
            "region=eu-west-1",
            "--additional-bsl-credentials",
            "/tmp/extra-creds",
        ]);
        let location = ObjectStoreLocation::from_additional(&config.additional_bsl().unwrap());
        assert_eq!(location.provider, "aws");
        assert_eq!(location.bucket, "extra-bucket");
        assert_eq!(location.prefix, "extra-prefix");
        assert_eq!(location.config, "region=eu-west-1");
        assert_eq!(location.credentials_file, Some(PathBuf::from("/tmp/extra-creds")));
    }

    #[tokio::test]
    async fn unsupported_provider_is_a_config_error() {
        let location = ObjectStoreLocation {
            provider: "kind".into(),
            credentials_file: None,
            bucket: "b".into(),
            prefix: String::new(),
            config: String::new(),
        };
        assert!(matches!(
            object_store_provider(&location).await,
            Err(Error::ConfigError(_))
        ));
    }
}
