use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::info;

use super::{e2e_labels, POLL_INTERVAL};
use crate::error::{is_not_found, Error, Result};
use crate::wait::wait_for;

pub const BUSYBOX_CONTAINER: &str = "container-busybox";
const BUSYBOX_IMAGE: &str = "busybox:latest";

/// A pod volume backed by the named claim.
pub fn claim_volume(volume_name: &str, claim_name: &str) -> Volume {
    Volume {
        name: volume_name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim_name.to_string(),
            read_only: None,
        }),
        ..Default::default()
    }
}

/// Busybox deployment that mounts each volume at `/<volume name>`.
#[derive(Debug, Clone)]
pub struct DeploymentBuilder {
    name: String,
    namespace: String,
    replicas: i32,
    labels: BTreeMap<String, String>,
    volumes: Vec<Volume>,
}

impl DeploymentBuilder {
    pub fn new(name: &str, namespace: &str, replicas: i32, labels: BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            replicas,
            labels,
            volumes: Vec::new(),
        }
    }

    pub fn with_volumes(mut self, volumes: Vec<Volume>) -> Self {
        self.volumes = volumes;
        self
    }

    pub fn build(&self) -> Deployment {
        let mut labels = e2e_labels();
        labels.extend(self.labels.clone());

        let mounts = self
            .volumes
            .iter()
            .map(|v| VolumeMount {
                name: v.name.clone(),
                mount_path: format!("/{}", v.name),
                ..Default::default()
            })
            .collect::<Vec<_>>();

        let container = Container {
            name: BUSYBOX_CONTAINER.to_string(),
            image: Some(BUSYBOX_IMAGE.to_string()),
            command: Some(vec!["sleep".to_string(), "1000000".to_string()]),
            volume_mounts: (!mounts.is_empty()).then_some(mounts),
            ..Default::default()
        };

        Deployment {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.replicas),
                selector: LabelSelector {
                    match_labels: Some(self.labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: (!self.volumes.is_empty()).then(|| self.volumes.clone()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

pub async fn create_deployment(client: &Client, deployment: &DeploymentBuilder) -> Result<Deployment> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), &deployment.namespace);
    info!("Creating deployment {}/{}", deployment.namespace, deployment.name);
    api.create(&PostParams::default(), &deployment.build())
        .await
        .map_err(|e| {
            Error::setup(
                format!("deployment {}/{}", deployment.namespace, deployment.name),
                e,
            )
        })
}

/// Ready when every desired replica is reported ready.
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready >= desired
}

pub async fn wait_for_ready_deployment(
    client: &Client,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let api = &api;
    wait_for(
        &format!("deployment {namespace}/{name} to be ready"),
        timeout,
        POLL_INTERVAL,
        move || async move {
            match api.get(name).await {
                Ok(d) => Ok(deployment_ready(&d)),
                Err(e) if is_not_found(&e) => Ok(false),
                Err(e) => Err(Error::KubeError(e)),
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentStatus;

    fn labels() -> BTreeMap<String, String> {
        BTreeMap::from([("resource-policies".to_string(), "resource-policies".to_string())])
    }

    #[test]
    fn volumes_are_mounted_under_their_name() {
        let d = DeploymentBuilder::new("base", "ns-0", 1, labels())
            .with_volumes(vec![claim_volume("vol-base-0", "pvc-0")])
            .build();
        let pod = d.spec.unwrap().template.spec.unwrap();
        let mounts = pod.containers[0].volume_mounts.clone().unwrap();
        assert_eq!(mounts[0].name, "vol-base-0");
        assert_eq!(mounts[0].mount_path, "/vol-base-0");
        assert_eq!(pod.containers[0].name, BUSYBOX_CONTAINER);
        assert_eq!(
            pod.volumes.unwrap()[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "pvc-0"
        );
    }

    #[test]
    fn selector_matches_template_labels() {
        let d = DeploymentBuilder::new("base", "ns-0", 1, labels()).build();
        let spec = d.spec.unwrap();
        let selector = spec.selector.match_labels.unwrap();
        let template_labels = spec.template.metadata.unwrap().labels.unwrap();
        for (k, v) in &selector {
            assert_eq!(template_labels.get(k), Some(v));
        }
    }

    #[test]
    fn readiness_compares_ready_to_desired() {
        let mut d = DeploymentBuilder::new("base", "ns-0", 2, labels()).build();
        assert!(!deployment_ready(&d));
        d.status = Some(DeploymentStatus {
            ready_replicas: Some(2),
            ..Default::default()
        });
        assert!(deployment_ready(&d));
    }
}
