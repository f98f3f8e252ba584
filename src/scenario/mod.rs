//! Scenario definitions and the runner that drives them
//!
//! Every scenario goes through the same phases in the same order:
//! `init`, `create_resources`, `backup`, `destroy`, `restore`, `verify`, and
//! finally `clean`. The runner owns the one-hour deadline and cancellation;
//! cleanup runs after success, failure, timeout or cancellation alike.

pub mod backup_restore;
pub mod resource_policies;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::E2eConfig;
use crate::error::{Error, Result};
use crate::k8s::namespace;
use crate::providers::supports_snapshot_verification;
use crate::velero::{BackupConfig, RestoreConfig, VeleroCli};
use crate::wait::with_timeout;

/// Deadline for the phases of a single scenario.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// State every scenario carries: names, the backup and restore it runs and
/// the handles it needs to reach the cluster.
#[derive(Clone)]
pub struct ScenarioCase {
    pub description: String,
    /// Base name the namespaces and workloads are derived from
    pub base_name: String,
    pub namespaces: Vec<String>,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub client: Client,
    pub config: Arc<E2eConfig>,
    pub velero: VeleroCli,
}

impl ScenarioCase {
    pub fn new(description: impl Into<String>, client: Client, config: Arc<E2eConfig>) -> Self {
        let velero = VeleroCli::from_config(&config);
        Self {
            description: description.into(),
            base_name: String::new(),
            namespaces: Vec::new(),
            backup: BackupConfig::default(),
            restore: RestoreConfig::default(),
            client,
            config,
            velero,
        }
    }

    /// Delete every namespace of the scenario and wait for them to be gone.
    /// A failure on one namespace does not stop deletion of the others.
    pub async fn delete_namespaces(&self) -> Result<()> {
        let mut errors = CleanupErrors::default();
        for ns in &self.namespaces {
            info!("Deleting namespace {}", ns);
            errors.record(
                &format!("namespace {ns}"),
                namespace::delete_namespace(&self.client, ns, true).await,
            );
        }
        errors.into_result()
    }
}

/// Runs cleanup steps to the end, keeping the first failure.
#[derive(Debug, Default)]
pub struct CleanupErrors {
    first: Option<Error>,
}

impl CleanupErrors {
    pub fn record(&mut self, step: &str, result: Result<()>) {
        if let Err(e) = result {
            warn!("Cleanup of {} failed: {}", step, e);
            self.first.get_or_insert(e);
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
pub trait Scenario: Send {
    fn case(&self) -> &ScenarioCase;

    /// Choose names and build the backup/restore configuration.
    async fn init(&mut self) -> Result<()>;

    async fn create_resources(&mut self) -> Result<()>;

    async fn backup(&mut self) -> Result<()> {
        let case = self.case();
        case.velero.backup(&case.backup).await
    }

    /// Simulate the disaster by deleting the scenario's namespaces.
    async fn destroy(&mut self) -> Result<()> {
        self.case().delete_namespaces().await
    }

    async fn restore(&mut self) -> Result<()> {
        let case = self.case();
        case.velero.restore(&case.restore).await
    }

    async fn verify(&mut self) -> Result<()>;

    async fn clean(&mut self) -> Result<()>;
}

async fn phase<F>(name: &'static str, fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    info!(phase = name, "Starting phase");
    let result = fut.instrument(info_span!("phase", name)).await;
    if let Err(e) = &result {
        error!(phase = name, error = %e, "Phase failed");
    }
    result
}

async fn run_phases(scenario: &mut dyn Scenario) -> Result<()> {
    phase("init", scenario.init()).await?;
    phase("create_resources", scenario.create_resources()).await?;
    phase("backup", scenario.backup()).await?;
    phase("destroy", scenario.destroy()).await?;
    phase("restore", scenario.restore()).await?;
    phase("verify", scenario.verify()).await
}

/// Run all phases under the scenario deadline, then clean up. A cleanup
/// failure is logged and never replaces the outcome of the phases.
pub async fn run_scenario(scenario: &mut dyn Scenario, cancel: &CancellationToken) -> Result<()> {
    let description = scenario.case().description.clone();
    info!("Running scenario: {}", description);

    let label = format!("scenario {description:?}");
    let outcome = tokio::select! {
        result = with_timeout(&label, SCENARIO_TIMEOUT, run_phases(scenario)) => result,
        _ = cancel.cancelled() => Err(Error::Cancelled),
    };

    if scenario.case().config.debug {
        warn!("Debug mode: keeping resources of scenario {:?}", description);
    } else if let Err(e) = with_timeout("scenario cleanup", CLEANUP_TIMEOUT, scenario.clean()).await {
        warn!("Cleanup of scenario {:?} failed: {}", description, e);
    }

    match &outcome {
        Ok(()) => info!("Scenario {:?} passed", description),
        Err(e) => error!("Scenario {:?} failed: {}", description, e),
    }
    outcome
}

/// Scenarios selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScenarioKind {
    /// Kibishii backup and restore with native volume snapshots
    BackupRestoreSnapshots,
    /// Kibishii backup and restore with filesystem backup
    BackupRestoreFs,
    /// Kibishii to the default and an additional storage location, snapshots
    AdditionalBslSnapshots,
    /// Kibishii to the default and an additional storage location, filesystem backup
    AdditionalBslFs,
    /// Volumes filtered by a resource policy config map
    ResourcePolicies,
}

impl ScenarioKind {
    pub fn uses_volume_snapshots(self) -> bool {
        matches!(
            self,
            ScenarioKind::BackupRestoreSnapshots | ScenarioKind::AdditionalBslSnapshots
        )
    }

    pub fn all() -> &'static [ScenarioKind] {
        Self::value_variants()
    }
}

/// Result of one selected scenario.
#[derive(Debug)]
pub enum Outcome {
    Passed,
    Skipped(String),
    Failed(Error),
}

/// Why a scenario cannot run with this configuration, if it cannot.
pub fn skip_reason(kind: ScenarioKind, config: &E2eConfig) -> Option<String> {
    if kind.uses_volume_snapshots() {
        if config.is_kind() {
            return Some("volume snapshots are not supported on kind".to_string());
        }
        let provider = config.object_store_provider();
        if !supports_snapshot_verification(provider) {
            return Some(format!(
                "snapshots cannot be verified in a {provider:?} object store"
            ));
        }
    }
    if matches!(
        kind,
        ScenarioKind::AdditionalBslSnapshots | ScenarioKind::AdditionalBslFs
    ) {
        let Some(bsl) = config.additional_bsl() else {
            return Some(
                "no additional storage location provider, bucket and credentials given"
                    .to_string(),
            );
        };
        if kind.uses_volume_snapshots() && !supports_snapshot_verification(bsl.provider) {
            return Some(format!(
                "snapshots cannot be verified in a {:?} object store",
                bsl.provider
            ));
        }
    }
    None
}

/// Install Velero for the scenario when the harness manages the install.
pub async fn before_each(config: &E2eConfig, velero: &VeleroCli, use_volume_snapshots: bool) -> Result<()> {
    if config.install_velero {
        velero.install(config, use_volume_snapshots).await?;
    }
    Ok(())
}

/// Delete backups and uninstall a harness-managed Velero. Skipped in debug mode.
pub async fn after_each(config: &E2eConfig, velero: &VeleroCli) -> Result<()> {
    if config.debug {
        return Ok(());
    }
    velero.delete_backups().await?;
    if config.install_velero {
        velero.uninstall().await?;
    }
    Ok(())
}

/// Run one selected scenario with its suite hooks.
pub async fn run_kind(
    kind: ScenarioKind,
    client: &Client,
    config: &Arc<E2eConfig>,
    cancel: &CancellationToken,
) -> Outcome {
    if let Some(reason) = skip_reason(kind, config) {
        info!("Skipping {:?}: {}", kind, reason);
        return Outcome::Skipped(reason);
    }

    let velero = VeleroCli::from_config(config);
    if let Err(e) = before_each(config, &velero, kind.uses_volume_snapshots()).await {
        return Outcome::Failed(e);
    }

    let result = match kind {
        ScenarioKind::BackupRestoreSnapshots | ScenarioKind::BackupRestoreFs => {
            let mut scenario = backup_restore::KibishiiBackupRestore::new(
                client.clone(),
                config.clone(),
                kind.uses_volume_snapshots(),
            );
            run_scenario(&mut scenario, cancel).await
        }
        ScenarioKind::AdditionalBslSnapshots | ScenarioKind::AdditionalBslFs => {
            backup_restore::run_additional_location(
                client,
                config,
                kind.uses_volume_snapshots(),
                cancel,
            )
            .await
        }
        ScenarioKind::ResourcePolicies => {
            let mut scenario =
                resource_policies::ResourcePoliciesCase::new(client.clone(), config.clone());
            run_scenario(&mut scenario, cancel).await
        }
    };

    if let Err(e) = after_each(config, &velero).await {
        warn!("Suite cleanup after {:?} failed: {}", kind, e);
    }

    match result {
        Ok(()) => Outcome::Passed,
        Err(e) => Outcome::Failed(e),
    }
}
