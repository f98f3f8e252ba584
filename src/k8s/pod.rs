use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, info, instrument};

use super::POLL_INTERVAL;
use crate::error::{is_not_found, Error, Result};
use crate::exec::Cmd;
use crate::wait::wait_for;

const POD_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn list_pods(client: &Client, namespace: &str) -> Result<Vec<Pod>> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pods = api.list(&ListParams::default()).await?;
    Ok(pods.items)
}

pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Wait until every named pod exists and reports phase `Running`.
#[instrument(skip(client))]
pub async fn wait_for_pods(
    client: &Client,
    namespace: &str,
    pod_names: &[&str],
    timeout: Duration,
) -> Result<()> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let api = &api;
    wait_for(
        &format!("pods {pod_names:?} in {namespace} to be running"),
        timeout,
        POLL_INTERVAL,
        move || async move {
            for name in pod_names {
                match api.get(name).await {
                    Ok(pod) if pod_phase(&pod) == Some("Running") => {}
                    Ok(pod) => {
                        debug!(pod = %name, phase = ?pod_phase(&pod), "pod not running yet");
                        return Ok(false);
                    }
                    Err(e) if is_not_found(&e) => {
                        debug!(pod = %name, "pod not found yet");
                        return Ok(false);
                    }
                    Err(e) => return Err(Error::KubeError(e)),
                }
            }
            Ok(true)
        },
    )
    .await?;
    info!("Pods {:?} in {} are running", pod_names, namespace);
    Ok(())
}

/// Names of the pod's volumes, paired with the claim each one mounts (if any).
pub fn pod_volume_claims(pod: &Pod) -> Vec<(String, Option<String>)> {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .map(|v| {
                    let claim = v
                        .persistent_volume_claim
                        .as_ref()
                        .map(|c| c.claim_name.clone());
                    (v.name.clone(), claim)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Write `content` into `/<volume>/<file>` inside the given container.
pub async fn create_file_in_pod_volume(
    namespace: &str,
    pod: &str,
    container: &str,
    volume: &str,
    file: &str,
    content: &str,
) -> Result<()> {
    let cmd = write_file_cmd(namespace, pod, container, volume, file, content);
    info!("Writing file: {}", cmd);
    cmd.run().await?;
    Ok(())
}

/// Read `/<volume>/<file>` from the given container. A missing file is an error.
pub async fn read_file_from_pod_volume(
    namespace: &str,
    pod: &str,
    container: &str,
    volume: &str,
    file: &str,
) -> Result<String> {
    let out = read_file_cmd(namespace, pod, container, volume, file)
        .run()
        .await?;
    Ok(out.stdout)
}

fn volume_path(volume: &str, file: &str) -> String {
    format!("/{volume}/{file}")
}

fn write_file_cmd(
    namespace: &str,
    pod: &str,
    container: &str,
    volume: &str,
    file: &str,
    content: &str,
) -> Cmd {
    Cmd::kubectl()
        .args(["exec", "-n", namespace, "-c", container, pod, "--"])
        .args(["/bin/sh", "-c"])
        .arg(format!("echo {content} > {}", volume_path(volume, file)))
        .timeout(POD_EXEC_TIMEOUT)
}

fn read_file_cmd(namespace: &str, pod: &str, container: &str, volume: &str, file: &str) -> Cmd {
    Cmd::kubectl()
        .args(["exec", "-n", namespace, "-c", container, pod, "--"])
        .args(["cat", &volume_path(volume, file)])
        .timeout(POD_EXEC_TIMEOUT)
}
