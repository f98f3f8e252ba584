//! Kibishii backup and restore, with snapshots or filesystem backup, to the
//! default storage location or an additional one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{run_scenario, Scenario, ScenarioCase};
use crate::config::{AdditionalBsl, E2eConfig};
use crate::error::{Error, Result};
use crate::k8s::{namespace, service_account};
use crate::kibishii::{self, KibishiiData, KIBISHII_DATA_PODS};
use crate::providers::{self, vsphere, ObjectStoreLocation};
use crate::velero::VeleroCli;

pub const KIBISHII_NAMESPACE: &str = "kibishii-workload";
pub const DEFAULT_LOCATION: &str = "default";

const VSPHERE_UPLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

pub struct KibishiiBackupRestore {
    case: ScenarioCase,
    use_volume_snapshots: bool,
    data: KibishiiData,
    backup_location: Option<String>,
    /// Backup and restore names fixed by the caller instead of generated
    names: Option<(String, String)>,
}

impl KibishiiBackupRestore {
    pub fn new(client: Client, config: Arc<E2eConfig>, use_volume_snapshots: bool) -> Self {
        let mode = if use_volume_snapshots {
            "volume snapshots"
        } else {
            "filesystem backup"
        };
        Self {
            case: ScenarioCase::new(
                format!("kibishii backup and restore with {mode}"),
                client,
                config,
            ),
            use_volume_snapshots,
            data: KibishiiData::default(),
            backup_location: None,
            names: None,
        }
    }

    /// Target a named storage location with fixed backup and restore names.
    pub fn with_location(mut self, location: &str, backup_name: String, restore_name: String) -> Self {
        self.case.description = format!("{} to location {location}", self.case.description);
        self.backup_location = Some(location.to_string());
        self.names = Some((backup_name, restore_name));
        self
    }

    fn namespace(&self) -> &str {
        &self.case.base_name
    }

    /// Object store holding this run's backup metadata.
    fn snapshot_location(&self) -> Result<ObjectStoreLocation> {
        let config = &self.case.config;
        match self.backup_location.as_deref() {
            None | Some(DEFAULT_LOCATION) => Ok(ObjectStoreLocation::from_config(config)),
            Some(location) => config
                .additional_bsl()
                .map(|bsl| ObjectStoreLocation::from_additional(&bsl))
                .ok_or_else(|| {
                    Error::ConfigError(format!(
                        "storage location {location} is not the configured additional location"
                    ))
                }),
        }
    }

    async fn verify_snapshots(&self) -> Result<()> {
        let case = &self.case;
        if case.config.cloud_provider.eq_ignore_ascii_case("vsphere") {
            vsphere::wait_for_vsphere_upload_completion(
                &case.client,
                self.namespace(),
                VSPHERE_UPLOAD_TIMEOUT,
            )
            .await?;
        }

        let checkpoint = providers::snapshot_checkpoint(
            &case.client,
            self.namespace(),
            &case.backup.backup_name,
            &KIBISHII_DATA_PODS,
            KIBISHII_DATA_PODS.len(),
        )
        .await?;
        let provider = providers::object_store_provider(&self.snapshot_location()?).await?;
        providers::snapshots_should_be_created(
            provider.as_ref(),
            &checkpoint,
            providers::SNAPSHOT_CHECK_ATTEMPTS,
            providers::SNAPSHOT_CHECK_INTERVAL,
        )
        .await
    }
}

#[async_trait]
impl Scenario for KibishiiBackupRestore {
    fn case(&self) -> &ScenarioCase {
        &self.case
    }

    async fn init(&mut self) -> Result<()> {
        if self.use_volume_snapshots {
            self.case.config.validate_for_snapshots()?;
        }
        let id = Uuid::new_v4();
        let (backup_name, restore_name) = self
            .names
            .clone()
            .unwrap_or_else(|| (format!("backup-{id}"), format!("restore-{id}")));

        let case = &mut self.case;
        case.base_name = KIBISHII_NAMESPACE.to_string();
        case.namespaces = vec![KIBISHII_NAMESPACE.to_string()];
        case.backup.backup_name = backup_name.clone();
        case.backup.namespaces = case.namespaces.clone();
        case.backup.backup_location = self.backup_location.clone();
        case.backup.use_volume_snapshots = self.use_volume_snapshots;
        case.restore.backup_name = backup_name;
        case.restore.restore_name = restore_name;
        Ok(())
    }

    async fn create_resources(&mut self) -> Result<()> {
        let case = &self.case;
        let ns = self.namespace();
        if namespace::get_namespace(&case.client, ns).await?.is_some() {
            info!("Workload namespace {} exists, delete it first", ns);
            if let Err(e) = namespace::delete_namespace(&case.client, ns, true).await {
                warn!("Failed to delete namespace {}: {}", ns, e);
            }
        }
        namespace::create_namespace(&case.client, ns).await?;
        kibishii::prepare_before_backup(&case.client, &case.config, ns, &self.data).await
    }

    async fn backup(&mut self) -> Result<()> {
        self.case.velero.backup(&self.case.backup).await?;
        if self.use_volume_snapshots {
            self.verify_snapshots().await?;
        }
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        info!("Simulating a disaster by removing namespace {}", self.namespace());
        self.case.delete_namespaces().await?;

        // Snapshots may still be pending on the provider side right after
        // the backup completes; restoring from them too early fails.
        if self.use_volume_snapshots {
            let settle = self.case.config.snapshot_settle();
            info!("Waiting {:?} to make sure the snapshots are ready", settle);
            tokio::time::sleep(settle).await;
        }
        Ok(())
    }

    async fn verify(&mut self) -> Result<()> {
        let case = &self.case;
        kibishii::verify_after_restore(
            &case.client,
            self.namespace(),
            &self.data,
            case.config.restore_settle(),
        )
        .await
    }

    async fn clean(&mut self) -> Result<()> {
        self.case.delete_namespaces().await
    }
}

/// Backup and restore names for a run against `location`. Runs against the
/// default location carry the suite id so repeated runs do not collide.
pub fn location_names(location: &str, id: &Uuid) -> (String, String) {
    if location == DEFAULT_LOCATION {
        (
            format!("backup-{location}-{id}"),
            format!("restore-{location}-{id}"),
        )
    } else {
        (format!("backup-{location}"), format!("restore-{location}"))
    }
}

/// Secret holding the additional location's credentials, and the key under
/// which they are stored.
pub fn location_secret(provider: &str, id: &Uuid) -> (String, String) {
    (format!("bsl-credentials-{id}"), format!("creds-{provider}"))
}

/// Plugin images to add before creating the additional location. A provider
/// other than the default location's needs its plugin named explicitly.
pub fn additional_location_plugins<'a>(config: &E2eConfig, bsl: &AdditionalBsl<'a>) -> Result<&'a str> {
    if bsl.plugins.trim().is_empty()
        && !bsl.provider.eq_ignore_ascii_case(config.object_store_provider())
    {
        return Err(Error::ConfigError(format!(
            "--add-bsl-plugins must name the plugin for additional location provider {:?}",
            bsl.provider
        )));
    }
    Ok(bsl.plugins)
}

/// Create an additional storage location with its own credentials, then run
/// the kibishii flow against the default location and the new one.
#[instrument(skip_all)]
pub async fn run_additional_location(
    client: &Client,
    config: &Arc<E2eConfig>,
    use_volume_snapshots: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let bsl = config.additional_bsl().ok_or_else(|| {
        Error::ConfigError("additional storage location is not configured".to_string())
    })?;
    let plugins = additional_location_plugins(config, &bsl)?;
    let velero = VeleroCli::from_config(config);
    velero.add_plugins(plugins).await?;

    let id = Uuid::new_v4();
    let (secret_name, secret_key) = location_secret(bsl.provider, &id);
    service_account::create_secret_from_files(
        client,
        velero.namespace(),
        &secret_name,
        &BTreeMap::from([(secret_key.clone(), bsl.credentials.clone())]),
    )
    .await?;

    let location = format!("bsl-{id}");
    velero
        .create_backup_location(
            &location,
            bsl.provider,
            bsl.bucket,
            bsl.prefix,
            bsl.config,
            &secret_name,
            &secret_key,
        )
        .await?;

    for target in [DEFAULT_LOCATION, location.as_str()] {
        let (backup_name, restore_name) = location_names(target, &id);
        let mut scenario =
            KibishiiBackupRestore::new(client.clone(), config.clone(), use_volume_snapshots)
                .with_location(target, backup_name, restore_name);
        run_scenario(&mut scenario, cancel).await?;
    }
    Ok(())
}
