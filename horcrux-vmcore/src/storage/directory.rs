//! Directory-backed `StorageDriver`, grounded directly in
//! `horcrux-api::storage::directory::DirectoryManager`: plain qcow2/raw
//! files on a local path, volumes created and inspected by shelling out to
//! `qemu-img`. Snapshotting is QEMU-side (external qcow2 chains via
//! `volumechain.rs`), so the storage-side snapshot operations here are thin.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::{ParsedVolume, QemuSnapshotMethod, StorageConfig, StorageDriver, VolumeChain};

pub struct DirectoryDriver {
    pub base_path: String,
}

impl DirectoryDriver {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn volume_path(&self, name: &str) -> String {
        format!("{}/{}.qcow2", self.base_path, name)
    }
}

#[async_trait]
impl StorageDriver for DirectoryDriver {
    async fn path(&self, volid: &str, snap: Option<&str>) -> Result<String> {
        let name = match super::parse_volume_id(volid) {
            ParsedVolume::Volume { name, .. } => name,
            ParsedVolume::Path(p) => return Ok(p),
        };
        match snap {
            Some(snap) => Ok(format!("{}/{}@{}.qcow2", self.base_path, name, snap)),
            None => Ok(self.volume_path(&name)),
        }
    }

    async fn storage_config(&self, _storeid: &str) -> Result<StorageConfig> {
        Ok(StorageConfig {
            storage_type: "directory".to_string(),
            shared: false,
            path: Some(self.base_path.clone()),
            monhost: None,
            pool: None,
        })
    }

    async fn volume_snapshot(&self, volid: &str, snap: &str) -> Result<()> {
        // Directory storage delegates actual snapshotting to the qcow2
        // external-chain rewrite in volumechain.rs; this records intent.
        debug!(volid, snap, "directory storage noop snapshot (qemu-managed)");
        Ok(())
    }

    async fn volume_snapshot_delete(&self, volid: &str, snap: &str, _running: bool) -> Result<()> {
        let path = self.path(volid, Some(snap)).await?;
        if tokio::fs::metadata(&path).await.is_ok() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn volume_snapshot_rollback(&self, _volid: &str, _snap: &str) -> Result<()> {
        Ok(())
    }

    async fn volume_rollback_is_possible(&self, _volid: &str, _snap: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn volume_snapshot_info(&self, _volid: &str) -> Result<VolumeChain> {
        Ok(VolumeChain { entries: Vec::new() })
    }

    async fn volume_size_info(&self, volid: &str) -> Result<u64> {
        let path = self.path(volid, None).await?;
        let output = Command::new("qemu-img")
            .args(["info", "--output=json", &path])
            .stdout(Stdio::piped())
            .output()
            .await?;
        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).map_err(|_| {
            Error::StorageFailure {
                volid: volid.to_string(),
                reason: "qemu-img info returned unparseable output".to_string(),
            }
        })?;
        parsed
            .get("virtual-size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::StorageFailure {
                volid: volid.to_string(),
                reason: "virtual-size missing from qemu-img info".to_string(),
            })
    }

    async fn vdisk_alloc(&self, storeid: &str, vmid: &str, fmt: &str, name: Option<&str>, size_kb: u64) -> Result<String> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("vm-{vmid}-disk-0"));
        let path = self.volume_path(&name);
        let size = format!("{}K", size_kb);
        info!(storeid, %path, %size, "allocating directory volume");

        let output = Command::new("qemu-img")
            .args(["create", "-f", fmt, &path, &size])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::StorageFailure {
                volid: name,
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(format!("{storeid}:{name}"))
    }

    async fn vdisk_free(&self, volid: &str) -> Result<()> {
        let path = self.path(volid, None).await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn volume_qemu_snapshot_method(&self, _volid: &str) -> Result<QemuSnapshotMethod> {
        Ok(QemuSnapshotMethod::Mixed)
    }

    async fn volume_has_feature(&self, _feature: &str, _volid: &str, _snap: Option<&str>, _running: bool) -> Result<bool> {
        Ok(true)
    }

    async fn activate_volumes(&self, _volids: &[String], _snap: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn deactivate_volumes(&self, _volids: &[String]) -> Result<()> {
        Ok(())
    }

    async fn supports_direct_io(&self, _storeid: &str) -> Result<bool> {
        Ok(true)
    }

    async fn snapshot_as_volume_chain(&self, _storeid: &str) -> Result<bool> {
        Ok(false)
    }
}
