//! Service accounts and secrets

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::info;

use super::{e2e_labels, POLL_INTERVAL};
use crate::error::{is_not_found, Error, Result};
use crate::wait::wait_for;

pub const IMAGE_PULL_SECRET: &str = "image-pull-secret";

pub async fn wait_until_service_account_created(
    client: &Client,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let api = &api;
    wait_for(
        &format!("service account {namespace}/{name}"),
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

/// Create a docker-config pull secret from `credential_file` and attach it to
/// the service account. Does nothing when no credential file is configured.
pub async fn patch_with_image_pull_secret(
    client: &Client,
    namespace: &str,
    name: &str,
    credential_file: Option<&Path>,
) -> Result<()> {
    let Some(path) = credential_file else {
        return Ok(());
    };
    let content = tokio::fs::read(path).await.map_err(|e| {
        Error::setup(
            format!("image pull secret {namespace}/{IMAGE_PULL_SECRET}"),
            format!("failed to read {}: {e}", path.display()),
        )
    })?;

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(IMAGE_PULL_SECRET.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(e2e_labels()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(content),
        )])),
        ..Default::default()
    };
    create_secret(client, namespace, &secret).await?;

    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let patch = json!({ "imagePullSecrets": [{ "name": IMAGE_PULL_SECRET }] });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| Error::setup(format!("service account {namespace}/{name}"), e))?;
    info!("Patched service account {}/{} with image pull secret", namespace, name);
    Ok(())
}

/// Create an opaque secret whose keys map to the contents of the given files.
pub async fn create_secret_from_files(
    client: &Client,
    namespace: &str,
    name: &str,
    files: &BTreeMap<String, PathBuf>,
) -> Result<()> {
    let mut data = BTreeMap::new();
    for (key, path) in files {
        let content = tokio::fs::read(path).await.map_err(|e| {
            Error::setup(
                format!("secret {namespace}/{name}"),
                format!("failed to read {}: {e}", path.display()),
            )
        })?;
        data.insert(key.clone(), ByteString(content));
    }

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(e2e_labels()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    };
    create_secret(client, namespace, &secret).await
}

async fn create_secret(client: &Client, namespace: &str, secret: &Secret) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let name = secret.metadata.name.clone().unwrap_or_default();
    match api.create(&PostParams::default(), secret).await {
        Ok(_) => info!("Created secret {}/{}", namespace, name),
        Err(kube::Error::Api(e)) if e.code == 409 => info!("Secret {}/{} already exists", namespace, name),
        Err(e) => return Err(Error::setup(format!("secret {namespace}/{name}"), e)),
    }
    Ok(())
}
