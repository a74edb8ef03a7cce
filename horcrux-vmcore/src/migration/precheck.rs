//! Migration pre-check: verify the target differs from
//! the source, classify each drive's migration strategy, and build the
//! storage map. Run on the source while the VM config lock is held.

use std::collections::HashMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveStrategy {
    /// Already on shared storage both nodes can see; no copy needed.
    Shared,
    /// Covered by a replication job; one last sync suffices.
    Replicated,
    /// VM is offline: a plain storage-side copy to the target.
    StorageMigrate,
    /// VM is online and the disk is local: `drive-mirror`/`blockdev-mirror`.
    DriveMirror,
}

#[derive(Debug, Clone)]
pub struct PlannedDrive {
    pub key: String,
    pub volid: String,
    pub strategy: DriveStrategy,
    pub target_storeid: String,
    pub is_cdrom: bool,
    pub is_efi: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    pub online: bool,
    pub with_local_disks: bool,
    pub drives: Vec<PlannedDrive>,
    pub storage_map: HashMap<String, String>,
}

/// Classifies one drive: shared storage never needs copying;
/// a drive covered by replication only needs a final sync; otherwise an
/// offline VM gets a storage-side copy and an online VM gets a live mirror.
pub fn classify_drive(
    shared: bool,
    replicated: bool,
    online: bool,
    is_cdrom: bool,
) -> Result<DriveStrategy> {
    if is_cdrom && !shared {
        return Err(Error::MigrationFailed(
            "local cdrom backends cannot be migrated".to_string(),
        ));
    }
    if shared {
        return Ok(DriveStrategy::Shared);
    }
    if replicated {
        return Ok(DriveStrategy::Replicated);
    }
    if online {
        Ok(DriveStrategy::DriveMirror)
    } else {
        Ok(DriveStrategy::StorageMigrate)
    }
}

/// Resolves the target storage id for a drive: `storagemap` override if one
/// covers this drive's source storage, else the same storeid unchanged.
pub fn resolve_target_storeid(storagemap: &HashMap<String, String>, source_storeid: &str) -> String {
    storagemap
        .get(source_storeid)
        .cloned()
        .unwrap_or_else(|| source_storeid.to_string())
}

/// Phase 1 entry point: validates source != target and the
/// online/with-local-disks preconditions. Drive classification is layered
/// on afterward via `classify_drive`/`resolve_target_storeid` once the
/// caller has the VM's drive list in hand — kept separate so this function
/// stays usable for the "no local disks" fast path exercised by offline
/// migrations and tests.
pub fn precheck(source_node: &str, target_node: &str, online: bool, with_local_disks: bool) -> Result<MigrationPlan> {
    if source_node == target_node {
        return Err(Error::MigrationFailed(format!(
            "target node {target_node} is the same as source"
        )));
    }
    if with_local_disks && !online {
        return Err(Error::MigrationFailed(
            "with-local-disks requires an online migration".to_string(),
        ));
    }
    Ok(MigrationPlan {
        online,
        with_local_disks,
        drives: Vec::new(),
        storage_map: HashMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_self_migration() {
        assert!(precheck("pve1", "pve1", true, false).is_err());
    }

    #[test]
    fn shared_storage_never_needs_copy() {
        assert_eq!(classify_drive(true, false, true, false).unwrap(), DriveStrategy::Shared);
    }

    #[test]
    fn online_local_disk_uses_mirror() {
        assert_eq!(classify_drive(false, false, true, false).unwrap(), DriveStrategy::DriveMirror);
    }

    #[test]
    fn offline_local_disk_uses_storage_migrate() {
        assert_eq!(classify_drive(false, false, false, false).unwrap(), DriveStrategy::StorageMigrate);
    }

    #[test]
    fn rejects_local_cdrom() {
        assert!(classify_drive(false, false, true, true).is_err());
    }

    #[test]
    fn storagemap_override_wins_over_identity() {
        let mut map = HashMap::new();
        map.insert("local-lvm".to_string(), "local-dir".to_string());
        assert_eq!(resolve_target_storeid(&map, "local-lvm"), "local-dir");
        assert_eq!(resolve_target_storeid(&map, "other"), "other");
    }
}
