//! LVM-backed `StorageDriver`, grounded in
//! `horcrux-api::storage::lvm::LvmManager` — `lvcreate`/`lvremove` for
//! volume lifecycle, `lvcreate --snapshot` for storage-side snapshots,
//! `lvconvert --merge` for rollback.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::error::{Error, Result};

use super::{QemuSnapshotMethod, StorageConfig, StorageDriver, VolumeChain};

pub struct LvmDriver {
    pub volume_group: String,
}

impl LvmDriver {
    pub fn new(volume_group: impl Into<String>) -> Self {
        Self {
            volume_group: volume_group.into(),
        }
    }

    fn device_path(&self, name: &str) -> String {
        format!("/dev/{}/{}", self.volume_group, name)
    }

    fn snapshot_lv_name(name: &str, snap: &str) -> String {
        format!("{name}_snap_{snap}")
    }
}

#[async_trait]
impl StorageDriver for LvmDriver {
    async fn path(&self, volid: &str, snap: Option<&str>) -> Result<String> {
        let name = match super::parse_volume_id(volid) {
            super::ParsedVolume::Volume { name, .. } => name,
            super::ParsedVolume::Path(p) => return Ok(p),
        };
        match snap {
            Some(snap) => Ok(self.device_path(&Self::snapshot_lv_name(&name, snap))),
            None => Ok(self.device_path(&name)),
        }
    }

    async fn storage_config(&self, _storeid: &str) -> Result<StorageConfig> {
        Ok(StorageConfig {
            storage_type: "lvm".to_string(),
            shared: true,
            path: Some(format!("/dev/{}", self.volume_group)),
            monhost: None,
            pool: Some(self.volume_group.clone()),
        })
    }

    async fn volume_snapshot(&self, volid: &str, snap: &str) -> Result<()> {
        let name = match super::parse_volume_id(volid) {
            super::ParsedVolume::Volume { name, .. } => name,
            super::ParsedVolume::Path(p) => p,
        };
        let snap_name = Self::snapshot_lv_name(&name, snap);
        info!(volid, snap, "creating lvm snapshot");
        let output = Command::new("lvcreate")
            .args([
                "--snapshot",
                "--name",
                &snap_name,
                "--extents",
                "20%ORIGIN",
                &self.device_path(&name),
            ])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::StorageFailure {
                volid: volid.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    async fn volume_snapshot_delete(&self, volid: &str, snap: &str, _running: bool) -> Result<()> {
        let name = match super::parse_volume_id(volid) {
            super::ParsedVolume::Volume { name, .. } => name,
            super::ParsedVolume::Path(p) => p,
        };
        let output = Command::new("lvremove")
            .args(["-f", &self.device_path(&Self::snapshot_lv_name(&name, snap))])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::StorageFailure {
                volid: volid.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    async fn volume_snapshot_rollback(&self, volid: &str, snap: &str) -> Result<()> {
        let name = match super::parse_volume_id(volid) {
            super::ParsedVolume::Volume { name, .. } => name,
            super::ParsedVolume::Path(p) => p,
        };
        let output = Command::new("lvconvert")
            .args(["--merge", &self.device_path(&Self::snapshot_lv_name(&name, snap))])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::StorageFailure {
                volid: volid.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
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
        let output = Command::new("blockdev").args(["--getsize64", &path]).output().await?;
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|_| Error::StorageFailure {
                volid: volid.to_string(),
                reason: "blockdev --getsize64 returned unparseable output".to_string(),
            })
    }

    async fn vdisk_alloc(&self, storeid: &str, vmid: &str, _fmt: &str, name: Option<&str>, size_kb: u64) -> Result<String> {
        let name = name.map(str::to_string).unwrap_or_else(|| format!("vm-{vmid}-disk-0"));
        let output = Command::new("lvcreate")
            .args([
                "--name",
                &name,
                "--size",
                &format!("{size_kb}K"),
                &self.volume_group,
            ])
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
        let output = Command::new("lvremove").args(["-f", &path]).output().await?;
        if !output.status.success() {
            return Err(Error::StorageFailure {
                volid: volid.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    async fn volume_qemu_snapshot_method(&self, _volid: &str) -> Result<QemuSnapshotMethod> {
        Ok(QemuSnapshotMethod::Storage)
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
        Ok(true)
    }
}
