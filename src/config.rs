//! Harness configuration
//!
//! Every scenario receives an explicitly constructed [`E2eConfig`] (usually
//! wrapped in an `Arc`). Values come from command-line flags with
//! `VELERO_E2E_*` environment fallbacks.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};

pub const DEFAULT_KIBISHII_DIRECTORY: &str =
    "github.com/vmware-tanzu-experiments/distributed-data-generator/kubernetes/yaml/";

#[derive(Parser, Debug, Clone)]
pub struct E2eConfig {
    /// Path of the velero binary
    #[arg(long, env = "VELERO_E2E_VELERO_CLI", default_value = "velero")]
    pub velero_cli: String,

    /// Namespace Velero is (or will be) installed in
    #[arg(long, env = "VELERO_E2E_VELERO_NAMESPACE", default_value = "velero")]
    pub velero_namespace: String,

    /// Platform the cluster runs on (kind, aws, azure, gcp, vsphere)
    #[arg(long, env = "VELERO_E2E_CLOUD_PROVIDER", default_value = "kind")]
    pub cloud_provider: String,

    /// Provider backing the object store when it differs from the cloud provider
    #[arg(long, env = "VELERO_E2E_OBJECT_STORE_PROVIDER")]
    pub object_store_provider: Option<String>,

    /// Credentials file for the object store / snapshot provider
    #[arg(long, env = "VELERO_E2E_CLOUD_CREDENTIALS_FILE")]
    pub cloud_credentials_file: Option<PathBuf>,

    #[arg(long, env = "VELERO_E2E_BSL_BUCKET", default_value = "")]
    pub bsl_bucket: String,

    #[arg(long, env = "VELERO_E2E_BSL_PREFIX", default_value = "")]
    pub bsl_prefix: String,

    /// Backup storage location config, e.g. `region=minio,s3ForcePathStyle=true,s3Url=http://minio:9000`
    #[arg(long, env = "VELERO_E2E_BSL_CONFIG", default_value = "")]
    pub bsl_config: String,

    #[arg(long, env = "VELERO_E2E_VSL_CONFIG", default_value = "")]
    pub vsl_config: String,

    /// Comma separated plugin images passed to `velero install`
    #[arg(long, env = "VELERO_E2E_PLUGINS", default_value = "")]
    pub plugins: String,

    /// Velero feature flags, e.g. `EnableCSI`
    #[arg(long, env = "VELERO_E2E_FEATURES", default_value = "")]
    pub features: String,

    #[arg(long, env = "VELERO_E2E_VELERO_IMAGE")]
    pub velero_image: Option<String>,

    /// Docker config used to build an image pull secret for the workload
    #[arg(long, env = "VELERO_E2E_REGISTRY_CREDENTIAL_FILE")]
    pub registry_credential_file: Option<PathBuf>,

    /// Kustomize base; the platform name is appended to it
    #[arg(long, env = "VELERO_E2E_KIBISHII_DIRECTORY", default_value = DEFAULT_KIBISHII_DIRECTORY)]
    pub kibishii_directory: String,

    /// Directory holding `<provider>.yaml` storage class manifests
    #[arg(long, env = "VELERO_E2E_STORAGE_CLASS_DIR", default_value = "testdata/storage-class")]
    pub storage_class_dir: PathBuf,

    /// Install Velero before and uninstall it after each scenario
    #[arg(long, env = "VELERO_E2E_INSTALL_VELERO")]
    pub install_velero: bool,

    #[arg(long, env = "VELERO_E2E_USE_NODE_AGENT")]
    pub use_node_agent: bool,

    /// Keep namespaces, backups and Velero in place for inspection
    #[arg(long, env = "VELERO_E2E_DEBUG")]
    pub debug: bool,

    /// Where diagnostic dumps of failed backups/restores are written
    #[arg(long, env = "VELERO_E2E_DEBUG_DIR", default_value = "debug")]
    pub debug_dir: PathBuf,

    #[arg(long, env = "VELERO_E2E_ADDITIONAL_BSL_PROVIDER")]
    pub additional_bsl_provider: Option<String>,

    #[arg(long, env = "VELERO_E2E_ADDITIONAL_BSL_BUCKET")]
    pub additional_bsl_bucket: Option<String>,

    #[arg(long, env = "VELERO_E2E_ADDITIONAL_BSL_PREFIX", default_value = "")]
    pub additional_bsl_prefix: String,

    #[arg(long, env = "VELERO_E2E_ADDITIONAL_BSL_CONFIG", default_value = "")]
    pub additional_bsl_config: String,

    #[arg(long, env = "VELERO_E2E_ADDITIONAL_BSL_CREDENTIALS")]
    pub additional_bsl_credentials: Option<PathBuf>,

    /// Plugin images needed by the additional storage location provider
    #[arg(long, env = "VELERO_E2E_ADD_BSL_PLUGINS", default_value = "")]
    pub add_bsl_plugins: String,

    /// Seconds to let storage settle after a restore before verifying data
    #[arg(long, env = "VELERO_E2E_RESTORE_SETTLE_SECS", default_value_t = 60)]
    pub restore_settle_secs: u64,

    /// Seconds to wait for provider snapshots to leave the pending state before restoring
    #[arg(long, env = "VELERO_E2E_SNAPSHOT_SETTLE_SECS", default_value_t = 300)]
    pub snapshot_settle_secs: u64,
}

impl E2eConfig {
    /// Provider used for the object store; falls back to the cloud provider.
    pub fn object_store_provider(&self) -> &str {
        self.object_store_provider
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.cloud_provider)
    }

    pub fn restore_settle(&self) -> Duration {
        Duration::from_secs(self.restore_settle_secs)
    }

    pub fn snapshot_settle(&self) -> Duration {
        Duration::from_secs(self.snapshot_settle_secs)
    }

    pub fn is_kind(&self) -> bool {
        self.cloud_provider.eq_ignore_ascii_case("kind")
    }

    pub fn csi_enabled(&self) -> bool {
        self.features.eq_ignore_ascii_case("EnableCSI")
    }

    /// Settings of the additional storage location, if all of them were given.
    pub fn additional_bsl(&self) -> Option<AdditionalBsl<'_>> {
        let provider = self.additional_bsl_provider.as_deref().filter(|s| !s.is_empty())?;
        let bucket = self.additional_bsl_bucket.as_deref().filter(|s| !s.is_empty())?;
        let credentials = self.additional_bsl_credentials.as_ref()?;
        Some(AdditionalBsl {
            provider,
            bucket,
            prefix: &self.additional_bsl_prefix,
            config: &self.additional_bsl_config,
            credentials,
            plugins: &self.add_bsl_plugins,
        })
    }

    /// Checks the settings a snapshot scenario depends on.
    pub fn validate_for_snapshots(&self) -> Result<()> {
        if self.is_kind() {
            return Err(Error::ConfigError(
                "volume snapshots are not supported on kind".to_string(),
            ));
        }
        let provider = self.object_store_provider();
        if !crate::providers::supports_snapshot_verification(provider) {
            return Err(Error::ConfigError(format!(
                "snapshot verification is not supported for object store provider {provider:?}"
            )));
        }
        if self.bsl_bucket.is_empty() {
            return Err(Error::ConfigError(
                "--bsl-bucket is required to verify snapshots".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdditionalBsl<'a> {
    pub provider: &'a str,
    pub bucket: &'a str,
    pub prefix: &'a str,
    pub config: &'a str,
    pub credentials: &'a PathBuf,
    pub plugins: &'a str,
}

/// Parses a `key=value,key=value` location config string.
pub fn parse_location_config(config: &str) -> Vec<(String, String)> {
    config
        .split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn test_config(args: &[&str]) -> E2eConfig {
    let mut argv = vec!["velero-e2e"];
    argv.extend_from_slice(args);
    E2eConfig::try_parse_from(argv).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_store_provider_falls_back_to_cloud_provider() {
        let cfg = test_config(&["--cloud-provider", "aws"]);
        assert_eq!(cfg.object_store_provider(), "aws");

        let cfg = test_config(&["--cloud-provider", "kind", "--object-store-provider", "aws"]);
        assert_eq!(cfg.object_store_provider(), "aws");
    }

    #[test]
    fn additional_bsl_requires_provider_bucket_and_credentials() {
        let cfg = test_config(&[
            "--additional-bsl-provider",
            "aws",
            "--additional-bsl-bucket",
            "extra",
        ]);
        assert!(cfg.additional_bsl().is_none());

        let cfg = test_config(&[
            "--additional-bsl-provider",
            "aws",
            "--additional-bsl-bucket",
            "extra",
            "--additional-bsl-credentials",
            "/tmp/creds",
        ]);
        let bsl = cfg.additional_bsl().unwrap();
        assert_eq!(bsl.provider, "aws");
        assert_eq!(bsl.bucket, "extra");
    }

    #[test]
    fn snapshots_rejected_on_kind() {
        let cfg = test_config(&["--cloud-provider", "kind", "--bsl-bucket", "b"]);
        assert!(cfg.validate_for_snapshots().is_err());
        let cfg = test_config(&["--cloud-provider", "aws", "--bsl-bucket", "b"]);
        assert!(cfg.validate_for_snapshots().is_ok());
    }

    #[test]
    fn snapshots_need_a_readable_object_store() {
        let cfg = test_config(&["--cloud-provider", "gcp", "--bsl-bucket", "b"]);
        let err = cfg.validate_for_snapshots().unwrap_err();
        assert!(err.to_string().contains("\"gcp\""));

        let cfg = test_config(&[
            "--cloud-provider",
            "vsphere",
            "--object-store-provider",
            "aws",
            "--bsl-bucket",
            "b",
        ]);
        assert!(cfg.validate_for_snapshots().is_ok());
    }

    #[test]
    fn location_config_pairs() {
        let pairs = parse_location_config("region=minio, s3ForcePathStyle=true,s3Url=http://minio:9000,bogus");
        assert_eq!(
            pairs,
            vec![
                ("region".to_string(), "minio".to_string()),
                ("s3ForcePathStyle".to_string(), "true".to_string()),
                ("s3Url".to_string(), "http://minio:9000".to_string()),
            ]
        );
    }

    #[test]
    fn settle_defaults() {
        let cfg = test_config(&[]);
        assert_eq!(cfg.restore_settle(), Duration::from_secs(60));
        assert_eq!(cfg.snapshot_settle(), Duration::from_secs(300));
    }
}
