//! Volume filtering through a resource policy config map
//!
//! Three namespaces each get one busybox deployment with one volume:
//!
//! | index | storage class         | size | outcome                   |
//! |-------|-----------------------|------|---------------------------|
//! | 0     | `e2e-storage-class`   | 1Gi  | skipped by storage class  |
//! | 1     | `e2e-storage-class-2` | 1Gi  | backed up                 |
//! | 2     | `e2e-storage-class-2` | 2Gi  | skipped by capacity range |
//!
//! After the restore, only the odd namespace still has the test file.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{CleanupErrors, Scenario, ScenarioCase};
use crate::config::E2eConfig;
use crate::error::{Error, Result};
use crate::k8s::deployment::{self, DeploymentBuilder, BUSYBOX_CONTAINER};
use crate::k8s::storage::{self, PvcBuilder, E2E_STORAGE_CLASS, E2E_STORAGE_CLASS_2};
use crate::k8s::{configmap, namespace, pod};
use crate::policy::ResourcePolicies;
use crate::wait::with_timeout;

pub const NAMESPACES_TOTAL: usize = 3;
pub const POLICY_CONFIGMAP: &str = "cm-resource-policies-sc";
pub const TEST_FILE: &str = "test-data.txt";
const CLAIM_NAME: &str = "pvc-0";

const CREATE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const CONFIGMAP_TIMEOUT: Duration = Duration::from_secs(60);
const DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct ResourcePoliciesCase {
    case: ScenarioCase,
    policies: ResourcePolicies,
}

/// Storage class and requested size of the claim in namespace `index`.
pub fn claim_for_index(index: usize) -> (&'static str, Option<&'static str>) {
    match index % 3 {
        0 => (E2E_STORAGE_CLASS, None),
        1 => (E2E_STORAGE_CLASS_2, None),
        _ => (E2E_STORAGE_CLASS_2, Some("2Gi")),
    }
}

/// Volumes in even namespaces are filtered out of the backup.
pub fn volume_backed_up(index: usize) -> bool {
    index % 2 == 1
}

pub fn volume_name(base_name: &str, index: usize) -> String {
    format!("vol-{base_name}-{index}")
}

/// Content written into each volume; verification compares against it.
pub fn file_content(namespace: &str, pod: &str, volume: &str) -> String {
    format!("ns-{namespace} pod-{pod} volume-{volume}")
}

fn workload_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("resource-policies".to_string(), "resource-policies".to_string())])
}

impl ResourcePoliciesCase {
    pub fn new(client: Client, config: Arc<E2eConfig>) -> Self {
        Self {
            case: ScenarioCase::new(
                "skip backup of volumes by resource policies",
                client,
                config,
            ),
            policies: ResourcePolicies::e2e_default(),
        }
    }

    async fn install_storage_classes(&self) -> Result<()> {
        let path = self
            .case
            .config
            .storage_class_dir
            .join(format!("{}.yaml", self.case.config.cloud_provider));
        storage::install_storage_class(&path).await?;
        let renamed =
            storage::renamed_storage_class_manifest(&path, E2E_STORAGE_CLASS, E2E_STORAGE_CLASS_2)?;
        storage::install_storage_class(renamed.path()).await
    }

    async fn create_namespace_workload(&self, index: usize, ns: &str) -> Result<()> {
        let client = &self.case.client;
        namespace::create_namespace(client, ns).await?;

        let (class, size) = claim_for_index(index);
        let mut pvc = PvcBuilder::new(ns, CLAIM_NAME).with_storage_class(class);
        if let Some(size) = size {
            pvc = pvc.with_resource_storage(size);
        }
        storage::create_pvc(client, &pvc).await?;

        let volume = volume_name(&self.case.base_name, index);
        let builder = DeploymentBuilder::new(&self.case.base_name, ns, 1, workload_labels())
            .with_volumes(vec![deployment::claim_volume(&volume, CLAIM_NAME)]);
        deployment::create_deployment(client, &builder).await?;
        deployment::wait_for_ready_deployment(client, ns, &self.case.base_name, DEPLOYMENT_TIMEOUT)
            .await?;

        self.write_data(ns, &volume).await
    }

    async fn write_data(&self, ns: &str, volume: &str) -> Result<()> {
        for p in pod::list_pods(&self.case.client, ns).await? {
            let pod_name = p.metadata.name.clone().unwrap_or_default();
            for (vol, _) in pod::pod_volume_claims(&p) {
                if vol != volume {
                    continue;
                }
                pod::create_file_in_pod_volume(
                    ns,
                    &pod_name,
                    BUSYBOX_CONTAINER,
                    &vol,
                    TEST_FILE,
                    &file_content(ns, &pod_name, &vol),
                )
                .await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn verify_namespace(&self, index: usize, ns: &str) -> Result<()> {
        let client = &self.case.client;
        deployment::wait_for_ready_deployment(client, ns, &self.case.base_name, DEPLOYMENT_TIMEOUT)
            .await?;

        let volume = volume_name(&self.case.base_name, index);
        for p in pod::list_pods(client, ns).await? {
            let pod_name = p.metadata.name.clone().unwrap_or_default();
            for (vol, _) in pod::pod_volume_claims(&p) {
                if vol != volume {
                    continue;
                }
                let read =
                    pod::read_file_from_pod_volume(ns, &pod_name, BUSYBOX_CONTAINER, &vol, TEST_FILE)
                        .await;
                check_restored_file(index, ns, &pod_name, &vol, read)?;
            }
        }
        info!("Volume data in {} matches the resource policies", ns);
        Ok(())
    }
}

/// Skipped volumes must come back without the file, backed up ones with the
/// exact content.
pub fn check_restored_file(
    index: usize,
    ns: &str,
    pod: &str,
    volume: &str,
    read: Result<String>,
) -> Result<()> {
    match (volume_backed_up(index), read) {
        (false, Err(_)) => Ok(()),
        (false, Ok(_)) => Err(Error::Verification(format!(
            "file {TEST_FILE} in volume {volume} of pod {ns}/{pod} should have been skipped"
        ))),
        (true, Err(e)) => Err(Error::Verification(format!(
            "failed to read {TEST_FILE} from volume {volume} of pod {ns}/{pod}: {e}"
        ))),
        (true, Ok(content)) => {
            let expected = file_content(ns, pod, volume);
            if content.replace('\n', "") == expected {
                Ok(())
            } else {
                Err(Error::Verification(format!(
                    "file {TEST_FILE} in volume {volume} of pod {ns}/{pod} has {content:?}, expected {expected:?}"
                )))
            }
        }
    }
}

#[async_trait]
impl Scenario for ResourcePoliciesCase {
    fn case(&self) -> &ScenarioCase {
        &self.case
    }

    async fn init(&mut self) -> Result<()> {
        let id = Uuid::new_v4();
        let case = &mut self.case;
        case.base_name = format!("resource-policies-{id}");
        case.namespaces = (0..NAMESPACES_TOTAL)
            .map(|i| format!("{}-{i}", case.base_name))
            .collect();

        case.backup.backup_name = format!("backup-resource-policies-{id}");
        case.backup.namespaces = case.namespaces.clone();
        case.backup.use_volume_snapshots = false;
        case.backup.resource_policies_configmap = Some(POLICY_CONFIGMAP.to_string());

        case.restore.restore_name = format!("restore-resource-policies-{id}");
        case.restore.backup_name = case.backup.backup_name.clone();
        info!(
            "Should back up PVs in namespaces {:?} with respect to resource policies",
            case.namespaces
        );
        Ok(())
    }

    async fn create_resources(&mut self) -> Result<()> {
        let this = &*self;
        with_timeout("resource policy resources", CREATE_TIMEOUT, async move {
            this.install_storage_classes().await?;

            let case = &this.case;
            let velero_ns = case.velero.namespace();
            configmap::create_configmap_from_yaml_data(
                &case.client,
                &this.policies.to_yaml()?,
                POLICY_CONFIGMAP,
                velero_ns,
            )
            .await?;
            configmap::wait_for_configmap(&case.client, velero_ns, POLICY_CONFIGMAP, CONFIGMAP_TIMEOUT)
                .await?;

            for (index, ns) in case.namespaces.iter().enumerate() {
                this.create_namespace_workload(index, ns).await?;
            }
            Ok(())
        })
        .await
    }

    async fn verify(&mut self) -> Result<()> {
        for (index, ns) in self.case.namespaces.iter().enumerate() {
            self.verify_namespace(index, ns).await?;
        }
        Ok(())
    }

    async fn clean(&mut self) -> Result<()> {
        let case = &self.case;
        let mut errors = CleanupErrors::default();
        for class in [E2E_STORAGE_CLASS, E2E_STORAGE_CLASS_2] {
            errors.record(
                &format!("storage class {class}"),
                storage::delete_storage_class(&case.client, class).await,
            );
        }
        errors.record(
            &format!("config map {POLICY_CONFIGMAP}"),
            configmap::delete_configmap(&case.client, case.velero.namespace(), POLICY_CONFIGMAP).await,
        );
        errors.record("scenario namespaces", case.delete_namespaces().await);
        errors.into_result()
    }
}
