use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::info;

use super::{e2e_labels, POLL_INTERVAL};
use crate::error::{is_not_found, Error, Result};
use crate::wait::wait_for;

/// Data key the YAML payload is stored under.
pub const CONFIGMAP_DATA_KEY: &str = "policy.yaml";

pub fn configmap_from_yaml_data(yaml: &str, name: &str, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(e2e_labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CONFIGMAP_DATA_KEY.to_string(),
            yaml.to_string(),
        )])),
        ..Default::default()
    }
}

pub async fn create_configmap_from_yaml_data(
    client: &Client,
    yaml: &str,
    name: &str,
    namespace: &str,
) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    api.create(&PostParams::default(), &configmap_from_yaml_data(yaml, name, namespace))
        .await
        .map_err(|e| Error::setup(format!("configmap {namespace}/{name}"), e))?;
    info!("Created ConfigMap {}/{}", namespace, name);
    Ok(())
}

pub async fn wait_for_configmap(
    client: &Client,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let api = &api;
    wait_for(
        &format!("configmap {namespace}/{name}"),
        timeout,
        POLL_INTERVAL,
        move || async move {
            match api.get(name).await {
                Ok(_) => Ok(true),
                Err(e) if is_not_found(&e) => Ok(false),
                Err(e) => Err(Error::KubeError(e)),
            }
        },
    )
    .await
}

pub async fn delete_configmap(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => info!("Deleted ConfigMap {}/{}", namespace, name),
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(Error::KubeError(e)),
    }
    Ok(())
}
