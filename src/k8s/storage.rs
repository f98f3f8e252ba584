//! Storage classes and persistent volume claims

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tempfile::NamedTempFile;
use tracing::info;

use super::e2e_labels;
use crate::error::{is_not_found, Error, Result};
use crate::exec::Cmd;

pub const E2E_STORAGE_CLASS: &str = "e2e-storage-class";
pub const E2E_STORAGE_CLASS_2: &str = "e2e-storage-class-2";

const APPLY_TIMEOUT: Duration = Duration::from_secs(90);

/// `kubectl apply -f <path>` for a storage class manifest.
pub async fn install_storage_class(path: &Path) -> Result<()> {
    let cmd = Cmd::kubectl()
        .args(["apply", "-f"])
        .arg(path.display().to_string())
        .timeout(APPLY_TIMEOUT);
    info!("Install storage class: {}", cmd);
    cmd.run()
        .await
        .map_err(|e| e.context(format!("storage class from {}", path.display())))?;
    Ok(())
}

/// Copy of the manifest at `path` with every `name: <from>` replaced by
/// `name: <to>`, written to a temporary file. The original is left untouched
/// and the temp file is removed when the handle is dropped.
pub fn renamed_storage_class_manifest(path: &Path, from: &str, to: &str) -> Result<NamedTempFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::setup(
            format!("storage class from {}", path.display()),
            format!("failed to read manifest: {e}"),
        )
    })?;
    let renamed = content.replace(&format!("name: {from}"), &format!("name: {to}"));

    let mut tmp = tempfile::Builder::new().prefix("sc-file").suffix(".yaml").tempfile()?;
    tmp.write_all(renamed.as_bytes())?;
    tmp.flush()?;
    Ok(tmp)
}

pub async fn delete_storage_class(client: &Client, name: &str) -> Result<()> {
    let api: Api<StorageClass> = Api::all(client.clone());
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => info!("Deleted storage class {}", name),
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(Error::KubeError(e)),
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PvcBuilder {
    namespace: String,
    name: String,
    storage_class: Option<String>,
    storage: String,
}

impl PvcBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            storage_class: None,
            storage: "1Gi".to_string(),
        }
    }

    pub fn with_storage_class(mut self, storage_class: &str) -> Self {
        self.storage_class = Some(storage_class.to_string());
        self
    }

    pub fn with_resource_storage(mut self, quantity: &str) -> Self {
        self.storage = quantity.to_string();
        self
    }

    pub fn build(&self) -> PersistentVolumeClaim {
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(self.storage.clone()));

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(e2e_labels()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                storage_class_name: self.storage_class.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

pub async fn create_pvc(client: &Client, pvc: &PvcBuilder) -> Result<PersistentVolumeClaim> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &pvc.namespace);
    info!(
        "Creating PVC {}/{} with size {} and storage class {:?}",
        pvc.namespace, pvc.name, pvc.storage, pvc.storage_class
    );
    api.create(&PostParams::default(), &pvc.build())
        .await
        .map_err(|e| Error::setup(format!("pvc {}/{}", pvc.namespace, pvc.name), e))
}

/// Name of the persistent volume bound to a claim, once binding has happened.
pub async fn bound_volume_name(client: &Client, namespace: &str, claim: &str) -> Result<Option<String>> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let pvc = api.get(claim).await?;
    Ok(pvc.spec.and_then(|s| s.volume_name))
}
