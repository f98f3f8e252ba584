//! Kibishii sample workload
//!
//! Kibishii is a distributed data generator: an etcd-backed stateful set that
//! writes a deterministic tree of files into its volumes, plus a `jump-pad`
//! pod that runs the generate and verify scripts.

use std::time::Duration;

use kube::Client;
use tracing::{info, instrument};

use crate::config::E2eConfig;
use crate::error::{Error, Result};
use crate::exec::Cmd;
use crate::k8s::{namespace, pod, service_account};

pub const JUMP_PAD_POD: &str = "jump-pad";
pub const KIBISHII_STATEFULSET: &str = "statefulset.apps/kibishii-deployment";

/// Pods that make up a running installation.
pub const KIBISHII_PODS: [&str; 6] = [
    "jump-pad",
    "etcd0",
    "etcd1",
    "etcd2",
    "kibishii-deployment-0",
    "kibishii-deployment-1",
];

/// Pods whose volumes hold generated data; one snapshot is expected per pod.
pub const KIBISHII_DATA_PODS: [&str; 2] = ["kibishii-deployment-0", "kibishii-deployment-1"];

const SERVICE_ACCOUNT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const APPLY_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const ROLLOUT_TIMEOUT: Duration = Duration::from_secs(31 * 60);
const PODS_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Shape of the generated data set. Generation and verification must use the
/// same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KibishiiData {
    pub levels: u32,
    pub dirs_per_level: u32,
    pub files_per_level: u32,
    pub file_length: u32,
    pub block_size: u32,
    pub pass_num: u32,
    pub expected_nodes: u32,
}

impl Default for KibishiiData {
    fn default() -> Self {
        Self {
            levels: 2,
            dirs_per_level: 10,
            files_per_level: 10,
            file_length: 1024,
            block_size: 1024,
            pass_num: 0,
            expected_nodes: 2,
        }
    }
}

impl KibishiiData {
    /// Positional arguments of `generate.sh` and `verify.sh`.
    pub fn args(&self) -> [String; 7] {
        [
            self.levels,
            self.dirs_per_level,
            self.files_per_level,
            self.file_length,
            self.block_size,
            self.pass_num,
            self.expected_nodes,
        ]
        .map(|n| n.to_string())
    }
}

/// Manifest directory name for the platform; Azure with CSI uses its own set.
pub fn platform_dir(cloud_provider: &str, features: &str) -> String {
    if cloud_provider.eq_ignore_ascii_case("azure") && features.eq_ignore_ascii_case("EnableCSI") {
        "azure-csi".to_string()
    } else {
        cloud_provider.to_string()
    }
}

/// Kustomize target for the platform. The directory is concatenated as-is,
/// so remote directories keep their trailing slash.
pub fn kustomize_target(kibishii_directory: &str, platform: &str) -> String {
    format!("{kibishii_directory}{platform}")
}

fn apply_cmd(namespace: &str, target: &str) -> Cmd {
    Cmd::kubectl()
        .args(["apply", "-n", namespace, "-k", target, "--timeout=90s"])
        .timeout(APPLY_TIMEOUT)
}

fn rollout_cmd(namespace: &str) -> Cmd {
    Cmd::kubectl()
        .args(["rollout", "status", KIBISHII_STATEFULSET, "-n", namespace, "-w", "--timeout=30m"])
        .timeout(ROLLOUT_TIMEOUT)
}

fn jump_pad_wait_cmd(namespace: &str) -> Cmd {
    Cmd::kubectl()
        .args(["wait", "--for=condition=ready", "-n", namespace])
        .arg(format!("pod/{JUMP_PAD_POD}"))
}

fn script_cmd(namespace: &str, script: &str, data: &KibishiiData) -> Cmd {
    Cmd::kubectl()
        .args(["exec", "-n", namespace, JUMP_PAD_POD, "--", script])
        .args(data.args())
}

/// Apply the manifests, label the namespace and wait for the rollout and the
/// jump pad. No step is retried.
#[instrument(skip(config))]
pub async fn install(config: &E2eConfig, namespace: &str) -> Result<()> {
    let platform = platform_dir(&config.cloud_provider, &config.features);
    let target = kustomize_target(&config.kibishii_directory, &platform);

    let cmd = apply_cmd(namespace, &target);
    info!("Install Kibishii cmd: {}", cmd);
    cmd.run()
        .await
        .map_err(|e| e.context(format!("kibishii in {namespace}")))?;

    namespace::label_pod_security_baseline(namespace).await?;

    rollout_cmd(namespace)
        .run()
        .await
        .map_err(|e| e.context(format!("kibishii rollout in {namespace}")))?;

    info!("Waiting for kibishii jump-pad pod to be ready");
    jump_pad_wait_cmd(namespace)
        .run()
        .await
        .map_err(|e| e.context(format!("pod {namespace}/{JUMP_PAD_POD}")))?;
    Ok(())
}

#[instrument(skip(data))]
pub async fn generate_data(namespace: &str, data: &KibishiiData) -> Result<()> {
    let cmd = script_cmd(namespace, "/usr/local/bin/generate.sh", data).timeout(GENERATE_TIMEOUT);
    info!("kibishii generate cmd: {}", cmd);
    cmd.run()
        .await
        .map_err(|e| e.context(format!("kibishii data in {namespace}")))?;
    Ok(())
}

/// Run the in-pod verifier. Mismatch, exit failure and timeout all become
/// [`Error::Verification`].
#[instrument(skip(data))]
pub async fn verify_data(namespace: &str, data: &KibishiiData) -> Result<()> {
    let cmd = script_cmd(namespace, "/usr/local/bin/verify.sh", data).timeout(VERIFY_TIMEOUT);
    run_verifier(namespace, &cmd).await
}

async fn run_verifier(namespace: &str, cmd: &Cmd) -> Result<()> {
    info!("kibishii verify cmd: {}", cmd);
    match cmd.run().await {
        Ok(_) => Ok(()),
        Err(Error::CommandFailed { stdout, stderr, .. }) => Err(Error::Verification(format!(
            "kibishii data in {namespace} did not verify: stderr={stderr}, stdout={stdout}"
        ))),
        Err(e) => Err(Error::Verification(format!(
            "kibishii data in {namespace} did not verify: {e}"
        ))),
    }
}

pub async fn wait_for_kibishii_pods(client: &Client, namespace: &str) -> Result<()> {
    info!("Waiting for kibishii pods to be ready");
    pod::wait_for_pods(client, namespace, &KIBISHII_PODS, PODS_TIMEOUT).await
}

/// Attach the pull secret to the default service account, install the
/// workload, wait for its pods and generate the data set.
#[instrument(skip(client, config, data))]
pub async fn prepare_before_backup(
    client: &Client,
    config: &E2eConfig,
    namespace: &str,
    data: &KibishiiData,
) -> Result<()> {
    let account = "default";
    service_account::wait_until_service_account_created(
        client,
        namespace,
        account,
        SERVICE_ACCOUNT_TIMEOUT,
    )
    .await?;
    service_account::patch_with_image_pull_secret(
        client,
        namespace,
        account,
        config.registry_credential_file.as_deref(),
    )
    .await?;

    install(config, namespace).await?;
    wait_for_kibishii_pods(client, namespace).await?;
    generate_data(namespace, data).await
}

/// Wait for the restored workload, let storage settle, then verify.
#[instrument(skip(client, data))]
pub async fn verify_after_restore(
    client: &Client,
    namespace: &str,
    data: &KibishiiData,
    settle: Duration,
) -> Result<()> {
    wait_for_kibishii_pods(client, namespace).await?;
    if !settle.is_zero() {
        info!("Waiting {:?} for restored volumes to settle", settle);
        tokio::time::sleep(settle).await;
    }
    verify_data(namespace, data).await?;
    info!("kibishii data in {} verified", namespace);
    Ok(())
}
