//! Snapshot metadata stored by Velero in an S3 bucket
//!
//! Velero uploads `backups/<name>/<name>-volumesnapshots.json.gz` next to the
//! backup tarball once the backup finishes. The file lists every native
//! volume snapshot it took, with the provider snapshot id and phase.

use std::io::Read;

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_runtime::env_config::file::{EnvConfigFileKind, EnvConfigFiles};
use aws_sdk_s3::config::Region;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::debug;

use super::{ObjectStoreLocation, ObjectStoreProvider, RecordedSnapshot};
use crate::config::parse_location_config;
use crate::error::Result;

const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeSnapshotEntry {
    spec: VolumeSnapshotSpec,
    #[serde(default)]
    status: VolumeSnapshotStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeSnapshotSpec {
    persistent_volume_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeSnapshotStatus {
    #[serde(default, rename = "providerSnapshotID")]
    provider_snapshot_id: Option<String>,
    #[serde(default)]
    phase: String,
}

/// Object key of the snapshot metadata of `backup_name`.
pub fn volume_snapshots_key(prefix: &str, backup_name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let key = format!("backups/{backup_name}/{backup_name}-volumesnapshots.json.gz");
    if prefix.is_empty() {
        key
    } else {
        format!("{prefix}/{key}")
    }
}

/// Decode a gzipped `volumesnapshots.json` document.
pub fn parse_volume_snapshots(gzipped: &[u8]) -> anyhow::Result<Vec<RecordedSnapshot>> {
    let mut json = String::new();
    GzDecoder::new(gzipped)
        .read_to_string(&mut json)
        .context("failed to decompress volume snapshot metadata")?;
    // Velero writes `null` when a backup took no native snapshots.
    let entries: Option<Vec<VolumeSnapshotEntry>> =
        serde_json::from_str(&json).context("failed to parse volume snapshot metadata")?;
    Ok(entries
        .unwrap_or_default()
        .into_iter()
        .map(|e| RecordedSnapshot {
            persistent_volume_name: e.spec.persistent_volume_name,
            snapshot_id: e.status.provider_snapshot_id,
            phase: e.status.phase,
        })
        .collect())
}

pub struct S3SnapshotStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3SnapshotStore {
    /// Build a client from the location config (`region`, `s3Url`) and the
    /// shared credentials file Velero was installed with.
    pub async fn connect(location: &ObjectStoreLocation) -> Result<Self> {
        let settings = parse_location_config(&location.config);
        let setting = |key: &str| {
            settings
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        let region = setting("region").unwrap_or_else(|| DEFAULT_REGION.to_string());

        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region));
        if let Some(file) = &location.credentials_file {
            loader = loader.profile_files(
                EnvConfigFiles::builder()
                    .with_file(EnvConfigFileKind::Credentials, file)
                    .build(),
            );
        }
        let shared = loader.load().await;

        let mut s3 = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(url) = setting("s3Url") {
            s3 = s3.endpoint_url(url);
        }
        if setting("s3ForcePathStyle").as_deref() == Some("true") {
            s3 = s3.force_path_style(true);
        }

        Ok(Self::with_client(
            aws_sdk_s3::Client::from_conf(s3.build()),
            &location.bucket,
            &location.prefix,
        ))
    }

    pub fn with_client(client: aws_sdk_s3::Client, bucket: &str, prefix: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStoreProvider for S3SnapshotStore {
    async fn recorded_snapshots(&self, backup_name: &str) -> anyhow::Result<Vec<RecordedSnapshot>> {
        let key = volume_snapshots_key(&self.prefix, backup_name);
        debug!("Fetching s3://{}/{}", self.bucket, key);

        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.raw_response().map(|r| r.status().as_u16()) == Some(404) => {
                return Ok(Vec::new())
            }
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to get s3://{}/{}", self.bucket, key))
            }
        };

        let body = output
            .body
            .collect()
            .await
            .with_context(|| format!("failed to read s3://{}/{}", self.bucket, key))?
            .into_bytes();
        parse_volume_snapshots(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{BehaviorVersion, Credentials};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const METADATA: &str = r#"[
        {"spec": {"backupName": "b1", "persistentVolumeName": "pv-a", "providerVolumeID": "vol-1"},
         "status": {"providerSnapshotID": "snap-1", "phase": "Completed"}},
        {"spec": {"backupName": "b1", "persistentVolumeName": "pv-b", "providerVolumeID": "vol-2"},
         "status": {"phase": "InProgress"}}
    ]"#;

    fn gzip(s: &str) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(s.as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    fn store_for(server: &MockServer, prefix: &str) -> S3SnapshotStore {
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("key", "secret", None, None, "test"))
            .endpoint_url(server.uri())
            .force_path_style(true)
            .build();
        S3SnapshotStore::with_client(aws_sdk_s3::Client::from_conf(conf), "velero", prefix)
    }

    #[test]
    fn key_includes_prefix_when_set() {
        assert_eq!(
            volume_snapshots_key("", "b1"),
            "backups/b1/b1-volumesnapshots.json.gz"
        );
        assert_eq!(
            volume_snapshots_key("cluster-a/", "b1"),
            "cluster-a/backups/b1/b1-volumesnapshots.json.gz"
        );
    }

    #[test]
    fn parses_snapshot_metadata() {
        let snaps = parse_volume_snapshots(&gzip(METADATA)).unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].persistent_volume_name, "pv-a");
        assert_eq!(snaps[0].snapshot_id.as_deref(), Some("snap-1"));
        assert_eq!(snaps[0].phase, "Completed");
        assert_eq!(snaps[1].snapshot_id, None);
    }

    #[test]
    fn null_metadata_means_no_snapshots() {
        assert!(parse_volume_snapshots(&gzip("null")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetches_metadata_from_bucket() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/velero/e2e/backups/b1/b1-volumesnapshots.json.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(gzip(METADATA)))
            .mount(&server)
            .await;

        let snaps = store_for(&server, "e2e").recorded_snapshots("b1").await.unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].snapshot_id.as_deref(), Some("snap-1"));
    }

    #[tokio::test]
    async fn missing_metadata_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let snaps = store_for(&server, "").recorded_snapshots("b1").await.unwrap();
        assert!(snaps.is_empty());
    }
}
