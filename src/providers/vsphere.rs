//! Upload tracking for the Velero plugin for vSphere
//!
//! The plugin records each local snapshot as a `Snapshot` object in the
//! `backupdriver.cnsdp.vmware.com` group and uploads it to the object store in
//! the background. Provider-side verification only makes sense once every
//! upload has finished.

use std::time::Duration;

use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::Client;
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::wait::wait_for;

pub const UPLOAD_POLL_INTERVAL: Duration = Duration::from_secs(60);

const PHASE_UPLOADED: &str = "Uploaded";
const FAILED_PHASES: [&str; 2] = ["UploadFailed", "Canceled"];

fn backupdriver_snapshot_api_resource() -> ApiResource {
    ApiResource {
        group: "backupdriver.cnsdp.vmware.com".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "backupdriver.cnsdp.vmware.com/v1alpha1".to_string(),
        kind: "Snapshot".to_string(),
        plural: "snapshots".to_string(),
    }
}

fn snapshot_phase(obj: &DynamicObject) -> Option<&str> {
    obj.data.get("status")?.get("phase")?.as_str()
}

/// `Ok(true)` once every snapshot is uploaded; failed or canceled uploads are errors.
pub fn uploads_complete(snapshots: &[DynamicObject]) -> Result<bool> {
    let mut complete = true;
    for snapshot in snapshots {
        let name = snapshot.metadata.name.as_deref().unwrap_or("<unnamed>");
        match snapshot_phase(snapshot) {
            Some(PHASE_UPLOADED) => {}
            Some(phase) if FAILED_PHASES.contains(&phase) => {
                return Err(Error::Verification(format!(
                    "vSphere snapshot {name} upload ended in phase {phase}"
                )))
            }
            phase => {
                info!("vSphere snapshot {} in phase {:?}", name, phase);
                complete = false;
            }
        }
    }
    Ok(complete)
}

#[instrument(skip(client))]
pub async fn wait_for_vsphere_upload_completion(
    client: &Client,
    namespace: &str,
    timeout: Duration,
) -> Result<()> {
    let api_resource = backupdriver_snapshot_api_resource();
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &api_resource);
    let api = &api;

    info!("Waiting for vSphere uploads to complete");
    wait_for(
        &format!("vSphere uploads in {namespace}"),
        timeout,
        UPLOAD_POLL_INTERVAL,
        move || async move {
            let list = api.list(&ListParams::default()).await?;
            uploads_complete(&list.items)
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(name: &str, phase: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &backupdriver_snapshot_api_resource());
        obj.data = json!({ "status": { "phase": phase } });
        obj
    }

    #[test]
    fn all_uploaded_is_complete() {
        let snaps = vec![snapshot("a", "Uploaded"), snapshot("b", "Uploaded")];
        assert!(uploads_complete(&snaps).unwrap());
    }

    #[test]
    fn in_flight_upload_keeps_waiting() {
        let snaps = vec![snapshot("a", "Uploaded"), snapshot("b", "Uploading")];
        assert!(!uploads_complete(&snaps).unwrap());
    }

    #[test]
    fn failed_upload_aborts() {
        let snaps = vec![snapshot("a", "Uploading"), snapshot("b", "UploadFailed")];
        let err = uploads_complete(&snaps).unwrap_err();
        assert!(err.to_string().contains("UploadFailed"));
    }
}
