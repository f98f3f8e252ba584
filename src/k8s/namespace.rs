use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::{info, instrument};

use super::{e2e_labels, POLL_INTERVAL};
use crate::error::{is_not_found, Error, Result};
use crate::exec::Cmd;
use crate::wait::wait_for;

/// How long a namespace may stay in `Terminating` before deletion is reported as failed.
pub const NAMESPACE_DELETE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const LABEL_TIMEOUT: Duration = Duration::from_secs(60);

#[instrument(skip(client))]
pub async fn create_namespace(client: &Client, name: &str) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(e2e_labels()),
            ..Default::default()
        },
        ..Default::default()
    };

    match api.create(&PostParams::default(), &ns).await {
        Ok(_) => info!("Created namespace {}", name),
        Err(kube::Error::Api(e)) if e.code == 409 => info!("Namespace {} already exists", name),
        Err(e) => return Err(Error::setup(format!("namespace {name}"), e)),
    }
    Ok(())
}

pub async fn get_namespace(client: &Client, name: &str) -> Result<Option<Namespace>> {
    let api: Api<Namespace> = Api::all(client.clone());
    match api.get(name).await {
        Ok(ns) => Ok(Some(ns)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Delete a namespace; with `wait` set, block until the API no longer returns it.
#[instrument(skip(client))]
pub async fn delete_namespace(client: &Client, name: &str, wait: bool) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => info!("Deleting namespace {}", name),
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(Error::KubeError(e)),
    }

    if wait {
        wait_for(
            &format!("namespace {name} to be deleted"),
            NAMESPACE_DELETE_TIMEOUT,
            POLL_INTERVAL,
            move || async move { Ok(get_namespace(client, name).await?.is_none()) },
        )
        .await?;
        info!("Namespace {} deleted", name);
    }
    Ok(())
}

/// Apply baseline pod-security admission labels so privileged-free workloads schedule.
pub async fn label_pod_security_baseline(namespace: &str) -> Result<()> {
    let cmd = pod_security_label_cmd(namespace);
    info!("Label namespace with PSA policy: {}", cmd);
    cmd.run().await.map_err(|e| {
        Error::setup(
            format!("namespace {namespace}"),
            format!("failed to label namespace with PSA policy: {e}"),
        )
    })?;
    Ok(())
}

fn pod_security_label_cmd(namespace: &str) -> Cmd {
    Cmd::kubectl()
        .args(["label", "namespace", namespace])
        .args([
            "pod-security.kubernetes.io/enforce=baseline",
            "pod-security.kubernetes.io/enforce-version=latest",
            "--overwrite=true",
        ])
        .timeout(LABEL_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_security_label_args() {
        let cmd = pod_security_label_cmd("kibishii-workload");
        assert_eq!(
            cmd.to_string(),
            "kubectl label namespace kibishii-workload \
             pod-security.kubernetes.io/enforce=baseline \
             pod-security.kubernetes.io/enforce-version=latest --overwrite=true"
        );
    }
}
