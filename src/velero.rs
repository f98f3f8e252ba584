//! Driving the velero CLI
//!
//! Backups and restores are created with `--wait` and their phase is read
//! back afterwards, since the CLI exits zero for partially failed runs. A
//! failed backup or restore is never retried; a diagnostic dump is collected
//! before the error is returned.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::config::E2eConfig;
use crate::error::{Error, Result};
use crate::exec::Cmd;

pub const PHASE_COMPLETED: &str = "Completed";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupConfig {
    pub backup_name: String,
    pub namespaces: Vec<String>,
    /// Non-default backup storage location
    pub backup_location: Option<String>,
    pub use_volume_snapshots: bool,
    pub selector: Option<String>,
    pub resource_policies_configmap: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreConfig {
    pub restore_name: String,
    pub backup_name: String,
    pub selector: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Backup,
    Restore,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Kind::Backup => "backup",
            Kind::Restore => "restore",
        }
    }
}

#[derive(Debug, Deserialize)]
struct VeleroObject {
    #[serde(default)]
    status: Option<VeleroStatus>,
}

#[derive(Debug, Deserialize)]
struct VeleroStatus {
    #[serde(default)]
    phase: Option<String>,
}

/// Handle on the velero binary bound to one Velero install.
#[derive(Debug, Clone)]
pub struct VeleroCli {
    cli: String,
    namespace: String,
    debug_dir: PathBuf,
}

impl VeleroCli {
    pub fn new(cli: impl Into<String>, namespace: impl Into<String>, debug_dir: PathBuf) -> Self {
        Self {
            cli: cli.into(),
            namespace: namespace.into(),
            debug_dir,
        }
    }

    pub fn from_config(config: &E2eConfig) -> Self {
        Self::new(
            config.velero_cli.clone(),
            config.velero_namespace.clone(),
            config.debug_dir.clone(),
        )
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn cmd(&self) -> Cmd {
        Cmd::new(&self.cli).args(["--namespace", self.namespace.as_str()])
    }

    pub fn backup_args(&self, cfg: &BackupConfig) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "backup".to_string(),
            cfg.backup_name.clone(),
            "--include-namespaces".to_string(),
            cfg.namespaces.join(","),
        ];
        if let Some(cm) = &cfg.resource_policies_configmap {
            args.push("--resource-policies-configmap".to_string());
            args.push(cm.clone());
        }
        if let Some(selector) = cfg.selector.as_deref().filter(|s| !s.is_empty()) {
            args.push("--selector".to_string());
            args.push(selector.to_string());
        }
        if let Some(location) = cfg.backup_location.as_deref().filter(|l| !l.is_empty()) {
            args.push("--storage-location".to_string());
            args.push(location.to_string());
        }
        if cfg.use_volume_snapshots {
            args.push("--snapshot-volumes".to_string());
        } else {
            args.push("--default-volumes-to-fs-backup".to_string());
            args.push("--snapshot-volumes=false".to_string());
        }
        args.push("--wait".to_string());
        args
    }

    pub fn restore_args(&self, cfg: &RestoreConfig) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "restore".to_string(),
            cfg.restore_name.clone(),
            "--from-backup".to_string(),
            cfg.backup_name.clone(),
        ];
        if let Some(selector) = cfg.selector.as_deref().filter(|s| !s.is_empty()) {
            args.push("--selector".to_string());
            args.push(selector.to_string());
        }
        args.push("--wait".to_string());
        args
    }

    #[instrument(skip(self, cfg), fields(backup = %cfg.backup_name))]
    pub async fn backup(&self, cfg: &BackupConfig) -> Result<()> {
        let result = self
            .create_and_check(Kind::Backup, &cfg.backup_name, self.backup_args(cfg))
            .await;
        if result.is_err() {
            self.run_debug(Some(&cfg.backup_name), None).await;
        }
        result
    }

    #[instrument(skip(self, cfg), fields(restore = %cfg.restore_name, backup = %cfg.backup_name))]
    pub async fn restore(&self, cfg: &RestoreConfig) -> Result<()> {
        let result = self
            .create_and_check(Kind::Restore, &cfg.restore_name, self.restore_args(cfg))
            .await;
        if result.is_err() {
            self.run_debug(None, Some(&cfg.restore_name)).await;
        }
        result
    }

    async fn create_and_check(&self, kind: Kind, name: &str, args: Vec<String>) -> Result<()> {
        let cmd = self.cmd().args(args);
        info!("velero {} cmd = {}", kind.as_str(), cmd);
        cmd.run().await?;

        let phase = self.phase(kind, name).await?;
        if phase != PHASE_COMPLETED {
            return Err(Error::Verification(format!(
                "{} {} finished in phase {:?}, expected {}",
                kind.as_str(),
                name,
                phase,
                PHASE_COMPLETED
            )));
        }
        info!("{} {} completed", kind.as_str(), name);
        Ok(())
    }

    async fn phase(&self, kind: Kind, name: &str) -> Result<String> {
        let out = self
            .cmd()
            .args([kind.as_str(), "get", name, "-o", "json"])
            .run()
            .await?;
        parse_phase(&out.stdout)
    }

    /// Best-effort collection of describe output and logs. Never fails.
    pub async fn run_debug(&self, backup: Option<&str>, restore: Option<&str>) {
        let targets = backup
            .map(|b| (Kind::Backup, b))
            .into_iter()
            .chain(restore.map(|r| (Kind::Restore, r)));

        for (kind, name) in targets {
            let mut report = String::new();
            let describe = self
                .cmd()
                .args([kind.as_str(), "describe", name, "--details"]);
            let logs = self.cmd().args([kind.as_str(), "logs", name]);
            for cmd in [describe, logs] {
                report.push_str(&format!("$ {cmd}\n"));
                match cmd.run().await {
                    Ok(out) => report.push_str(&out.stdout),
                    Err(e) => report.push_str(&format!("failed: {e}\n")),
                }
                report.push('\n');
            }

            warn!("Debug output for {} {}:\n{}", kind.as_str(), name, report);
            if let Err(e) = self.write_debug_report(kind, name, &report).await {
                warn!("Failed to write debug report for {} {}: {}", kind.as_str(), name, e);
            }
        }
    }

    async fn write_debug_report(&self, kind: Kind, name: &str, report: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.debug_dir).await?;
        let file = self.debug_dir.join(format!(
            "{}-{}-{}.log",
            kind.as_str(),
            name,
            chrono::Utc::now().format("%Y%m%d-%H%M%S")
        ));
        tokio::fs::write(&file, report).await?;
        info!("Debug report written to {}", file.display());
        Ok(())
    }

    pub async fn delete_backups(&self) -> Result<()> {
        self.cmd()
            .args(["delete", "backup", "--all", "--confirm"])
            .run()
            .await?;
        info!("Deleted all backups in {}", self.namespace);
        Ok(())
    }

    pub fn install_args(&self, config: &E2eConfig, use_volume_snapshots: bool) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            "--provider".to_string(),
            config.object_store_provider().to_string(),
            "--bucket".to_string(),
            config.bsl_bucket.clone(),
        ];
        let optional = [
            ("--prefix", config.bsl_prefix.as_str()),
            ("--backup-location-config", config.bsl_config.as_str()),
            ("--snapshot-location-config", config.vsl_config.as_str()),
            ("--plugins", config.plugins.as_str()),
            ("--features", config.features.as_str()),
            ("--image", config.velero_image.as_deref().unwrap_or_default()),
        ];
        for (flag, value) in optional {
            if !value.is_empty() {
                args.push(flag.to_string());
                args.push(value.to_string());
            }
        }
        match &config.cloud_credentials_file {
            Some(path) => {
                args.push("--secret-file".to_string());
                args.push(path.display().to_string());
            }
            None => args.push("--no-secret".to_string()),
        }
        args.push(format!("--use-volume-snapshots={use_volume_snapshots}"));
        if config.use_node_agent || !use_volume_snapshots {
            args.push("--use-node-agent".to_string());
        }
        args.push("--wait".to_string());
        args
    }

    #[instrument(skip(self, config))]
    pub async fn install(&self, config: &E2eConfig, use_volume_snapshots: bool) -> Result<()> {
        let cmd = self.cmd().args(self.install_args(config, use_volume_snapshots));
        info!("Installing Velero: {}", cmd);
        cmd.run()
            .await
            .map_err(|e| e.context(format!("velero in {}", self.namespace)))?;
        Ok(())
    }

    pub async fn uninstall(&self) -> Result<()> {
        self.cmd().args(["uninstall", "--force"]).run().await?;
        info!("Uninstalled Velero from {}", self.namespace);
        Ok(())
    }

    /// Add comma separated plugin images; already-present plugins are skipped.
    pub async fn add_plugins(&self, plugins: &str) -> Result<()> {
        for image in plugins.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match self.cmd().args(["plugin", "add", image]).run().await {
                Ok(_) => info!("Added plugin {}", image),
                Err(Error::CommandFailed { stderr, .. })
                    if stderr.contains("Duplicate value") || stderr.contains("already exists") =>
                {
                    info!("Plugin {} already installed", image)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_backup_location(
        &self,
        name: &str,
        provider: &str,
        bucket: &str,
        prefix: &str,
        config: &str,
        secret_name: &str,
        secret_key: &str,
    ) -> Result<()> {
        let mut cmd = self
            .cmd()
            .args(["create", "backup-location", name])
            .args(["--provider", provider, "--bucket", bucket]);
        if !prefix.is_empty() {
            cmd = cmd.args(["--prefix", prefix]);
        }
        if !config.is_empty() {
            cmd = cmd.args(["--config", config]);
        }
        cmd = cmd
            .arg("--credential")
            .arg(format!("{secret_name}={secret_key}"));
        cmd.run()
            .await
            .map_err(|e| e.context(format!("backup storage location {name}")))?;
        info!("Created backup storage location {}", name);
        Ok(())
    }
}

fn parse_phase(json: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let item = match value.get("items").and_then(|i| i.as_array()) {
        Some(items) => items
            .first()
            .cloned()
            .ok_or_else(|| Error::Verification("velero returned an empty list".to_string()))?,
        None => value,
    };
    let object: VeleroObject = serde_json::from_value(item)?;
    Ok(object
        .status
        .and_then(|s| s.phase)
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn cli() -> VeleroCli {
        VeleroCli::new("velero", "velero", PathBuf::from("debug"))
    }

    fn backup_cfg(use_volume_snapshots: bool) -> BackupConfig {
        BackupConfig {
            backup_name: "backup-1".to_string(),
            namespaces: vec!["kibishii-workload".to_string()],
            use_volume_snapshots,
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_backup_args() {
        let args = cli().backup_args(&backup_cfg(true));
        assert_eq!(
            args,
            [
                "create",
                "backup",
                "backup-1",
                "--include-namespaces",
                "kibishii-workload",
                "--snapshot-volumes",
                "--wait"
            ]
        );
    }

    #[test]
    fn fs_backup_args_with_location_and_policies() {
        let mut cfg = backup_cfg(false);
        cfg.namespaces = vec!["a-0".into(), "a-1".into()];
        cfg.backup_location = Some("bsl-1".into());
        cfg.resource_policies_configmap = Some("cm-resource-policies-sc".into());
        cfg.selector = Some(String::new());

        let args = cli().backup_args(&cfg);
        assert_eq!(
            args,
            [
                "create",
                "backup",
                "backup-1",
                "--include-namespaces",
                "a-0,a-1",
                "--resource-policies-configmap",
                "cm-resource-policies-sc",
                "--storage-location",
                "bsl-1",
                "--default-volumes-to-fs-backup",
                "--snapshot-volumes=false",
                "--wait"
            ]
        );
    }

    #[test]
    fn default_location_adds_no_flag() {
        let mut cfg = backup_cfg(true);
        cfg.backup_location = Some(String::new());
        assert!(!cli().backup_args(&cfg).contains(&"--storage-location".to_string()));
    }

    #[test]
    fn restore_args_with_selector() {
        let args = cli().restore_args(&RestoreConfig {
            restore_name: "restore-1".into(),
            backup_name: "backup-1".into(),
            selector: Some("app=kibishii".into()),
        });
        assert_eq!(
            args,
            [
                "create",
                "restore",
                "restore-1",
                "--from-backup",
                "backup-1",
                "--selector",
                "app=kibishii",
                "--wait"
            ]
        );
    }

    #[test]
    fn install_args_for_fs_backup_enable_node_agent() {
        let config = test_config(&[
            "--cloud-provider",
            "kind",
            "--object-store-provider",
            "aws",
            "--bsl-bucket",
            "bucket",
            "--bsl-config",
            "region=minio",
            "--plugins",
            "velero/velero-plugin-for-aws:main",
        ]);
        let args = cli().install_args(&config, false);
        assert_eq!(args[..5], ["install", "--provider", "aws", "--bucket", "bucket"]);
        assert!(args.contains(&"--no-secret".to_string()));
        assert!(args.contains(&"--use-volume-snapshots=false".to_string()));
        assert!(args.contains(&"--use-node-agent".to_string()));
        assert!(!args.contains(&"--prefix".to_string()));
    }

    #[test]
    fn phase_from_single_object() {
        let json = r#"{"kind":"Backup","metadata":{"name":"b"},"status":{"phase":"PartiallyFailed"}}"#;
        assert_eq!(parse_phase(json).unwrap(), "PartiallyFailed");
    }

    #[test]
    fn phase_from_list() {
        let json = r#"{"kind":"BackupList","items":[{"status":{"phase":"Completed"}}]}"#;
        assert_eq!(parse_phase(json).unwrap(), PHASE_COMPLETED);
        assert!(parse_phase(r#"{"items":[]}"#).is_err());
    }

    #[test]
    fn phase_missing_status_is_empty() {
        assert_eq!(parse_phase(r#"{"metadata":{}}"#).unwrap(), "");
    }

    /// Velero stand-in: backups end `PartiallyFailed`, restores exit non-zero,
    /// describe and logs print a marker.
    const FAKE_VELERO: &str = r#"#!/bin/sh
shift 2
case "$1 $2" in
  "create backup") exit 0 ;;
  "backup get") echo '{"status":{"phase":"PartiallyFailed"}}' ;;
  "create restore") echo "restore rejected" >&2; exit 1 ;;
  *" describe") echo "describe $3" ;;
  *" logs") echo "logs $3" ;;
  *) exit 2 ;;
esac
"#;

    fn fake_cli(dir: &tempfile::TempDir) -> VeleroCli {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.path().join("velero");
        std::fs::write(&script, FAKE_VELERO).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        VeleroCli::new(
            script.display().to_string(),
            "velero",
            dir.path().join("debug"),
        )
    }

    fn debug_reports(dir: &tempfile::TempDir) -> Vec<(String, String)> {
        std::fs::read_dir(dir.path().join("debug"))
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path();
                let name = path.file_name().unwrap().to_string_lossy().to_string();
                (name, std::fs::read_to_string(&path).unwrap())
            })
            .collect()
    }

    #[tokio::test]
    async fn incomplete_backup_fails_and_writes_debug_report() {
        let dir = tempfile::tempdir().unwrap();
        let err = fake_cli(&dir).backup(&backup_cfg(false)).await.unwrap_err();
        assert!(matches!(err, Error::Verification(ref m) if m.contains("PartiallyFailed")));

        let reports = debug_reports(&dir);
        assert_eq!(reports.len(), 1);
        let (name, report) = &reports[0];
        assert!(name.starts_with("backup-backup-1-"), "{name}");
        assert!(report.contains("describe backup-1"));
        assert!(report.contains("logs backup-1"));
    }

    #[tokio::test]
    async fn failed_restore_command_writes_debug_report() {
        let dir = tempfile::tempdir().unwrap();
        let err = fake_cli(&dir)
            .restore(&RestoreConfig {
                restore_name: "restore-1".into(),
                backup_name: "backup-1".into(),
                selector: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { ref stderr, .. } if stderr.contains("restore rejected")));

        let reports = debug_reports(&dir);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].0.starts_with("restore-restore-1-"));
        assert!(reports[0].1.contains("describe restore-1"));
    }
}
