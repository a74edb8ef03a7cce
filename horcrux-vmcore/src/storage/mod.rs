//! The storage contract this core depends on, implemented elsewhere: a
//! trait with exactly the operations the VM core calls against a
//! per-backend store (`zfs`/`lvm`/`directory`, chosen by a `StorageType`
//! tag on a pool) — no pool CRUD, no multi-backend registry, just the
//! consumer-facing surface.

pub mod directory;
pub mod lvm;
pub mod zfs;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub storage_type: String,
    pub shared: bool,
    pub path: Option<String>,
    pub monhost: Option<String>,
    pub pool: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VolumeChain {
    pub entries: Vec<ChainEntry>,
}

#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub snapshot: Option<String>,
    pub parent: Option<String>,
    pub file: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QemuSnapshotMethod {
    Storage,
    Qemu,
    Mixed,
}

/// Either a `storeid:name` volume reference or a bare filesystem path,
/// mirroring `parse_volume_id`'s two possible returns.
#[derive(Debug, Clone)]
pub enum ParsedVolume {
    Volume { storeid: String, name: String },
    Path(String),
}

pub fn parse_volume_id(volid: &str) -> ParsedVolume {
    match volid.split_once(':') {
        Some((storeid, name)) if !volid.starts_with('/') => ParsedVolume::Volume {
            storeid: storeid.to_string(),
            name: name.to_string(),
        },
        _ => ParsedVolume::Path(volid.to_string()),
    }
}

/// The operations the VM core consumes from a storage backend.
/// Contracts the core relies on: all mutations are safe when the VM is
/// stopped; while the VM runs, only `volume_snapshot` and
/// `volume_snapshot_delete` with explicit `running` semantics may be called.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn path(&self, volid: &str, snap: Option<&str>) -> Result<String>;
    async fn storage_config(&self, storeid: &str) -> Result<StorageConfig>;

    async fn volume_snapshot(&self, volid: &str, snap: &str) -> Result<()>;
    async fn volume_snapshot_delete(&self, volid: &str, snap: &str, running: bool) -> Result<()>;
    async fn volume_snapshot_rollback(&self, volid: &str, snap: &str) -> Result<()>;
    async fn volume_rollback_is_possible(&self, volid: &str, snap: &str) -> Result<Vec<String>>;

    async fn volume_snapshot_info(&self, volid: &str) -> Result<VolumeChain>;
    async fn volume_size_info(&self, volid: &str) -> Result<u64>;

    async fn vdisk_alloc(&self, storeid: &str, vmid: &str, fmt: &str, name: Option<&str>, size_kb: u64) -> Result<String>;
    async fn vdisk_free(&self, volid: &str) -> Result<()>;

    async fn volume_qemu_snapshot_method(&self, volid: &str) -> Result<QemuSnapshotMethod>;
    async fn volume_has_feature(&self, feature: &str, volid: &str, snap: Option<&str>, running: bool) -> Result<bool>;

    async fn activate_volumes(&self, volids: &[String], snap: Option<&str>) -> Result<()>;
    async fn deactivate_volumes(&self, volids: &[String]) -> Result<()>;

    /// Whether the underlying storage supports direct I/O, used to derive a
    /// drive's default `aio` mode.
    async fn supports_direct_io(&self, storeid: &str) -> Result<bool>;

    /// Whether this storage reports `snapshot-as-volume-chain`, which bounds
    /// qcow2 growth on LVM-backed volumes.
    async fn snapshot_as_volume_chain(&self, storeid: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_storeid_name_pair() {
        match parse_volume_id("local-lvm:vm-100-disk-0") {
            ParsedVolume::Volume { storeid, name } => {
                assert_eq!(storeid, "local-lvm");
                assert_eq!(name, "vm-100-disk-0");
            }
            ParsedVolume::Path(_) => panic!("expected volume"),
        }
    }

    #[test]
    fn parses_absolute_path() {
        match parse_volume_id("/mnt/nfs/vm-100-disk-0.qcow2") {
            ParsedVolume::Path(p) => assert_eq!(p, "/mnt/nfs/vm-100-disk-0.qcow2"),
            ParsedVolume::Volume { .. } => panic!("expected path"),
        }
    }
}
