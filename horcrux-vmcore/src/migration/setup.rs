//! Migration setup: start QEMU on the target with
//! `-incoming defer`, allocate and attach mirror targets for each local disk
//! moving online, and negotiate migration capabilities.

use serde_json::json;
use tracing::info;

use crate::blockdev::{self, NodeKind};
use crate::blockjob::{BlockJobEngine, CompletionMode, JobKind, TrackedJob};
use crate::error::Result;
use crate::migration::precheck::{DriveStrategy, MigrationPlan, PlannedDrive};
use crate::migration::RemoteNode;
use crate::qmp::{Peer, Qmp, QmpTransport};
use crate::storage::StorageDriver;
use crate::version::{QemuVersion, BLOCKDEV_CMDLINE};

/// Everything accumulated during setup that cutover and rollback need:
/// the plan itself, the tracked mirror jobs (empty for an offline or
/// fully-shared migration), and the volumes allocated on the target so a
/// failed rollback can free them.
pub struct PreparedMigration {
    pub plan: MigrationPlan,
    pub mirror_jobs: BlockJobEngine,
    pub allocated_target_volumes: Vec<String>,
}

/// A drive whose virtual size must be forced on its mirror target —
/// currently only an EFI disk moving to a raw-format target, since QEMU
/// requires equal virtual sizes across a mirror.
fn efi_size_override(is_efi: bool, target_format: &str, source_size: u64) -> Option<u64> {
    (is_efi && target_format == "raw").then_some(source_size)
}

#[allow(clippy::too_many_arguments)]
pub async fn setup(
    qmp: &dyn QmpTransport,
    storage: &dyn StorageDriver,
    remote: &dyn RemoteNode,
    peer: &Peer,
    vmid: &str,
    target_node: &str,
    plan: &MigrationPlan,
    qemu_version: QemuVersion,
) -> Result<PreparedMigration> {
    let qmp = Qmp::new(qmp);

    let incoming_uri = format!("unix:/run/horcrux/vmcore/{vmid}.migrate");
    remote.start_incoming(vmid, "", &incoming_uri).await?;

    let mut mirror_jobs = BlockJobEngine::new();
    let mut allocated = Vec::new();

    for drive in &plan.drives {
        match drive.strategy {
            DriveStrategy::Shared | DriveStrategy::Replicated => continue,
            DriveStrategy::StorageMigrate => {
                let target_volid = allocate_and_copy_offline(storage, drive).await?;
                allocated.push(target_volid);
            }
            DriveStrategy::DriveMirror => {
                let job_id = format!("mirror-{}", drive.key);
                let source_node = blockdev::top_node_name(&drive.key);

                if BLOCKDEV_CMDLINE.satisfied_by(qemu_version) {
                    let (target_volid, target_node_name) =
                        attach_mirror_target(&qmp, peer, storage, drive).await?;
                    allocated.push(target_volid);

                    qmp.cmd(
                        peer,
                        "blockdev-mirror",
                        Some(json!({
                            "job-id": job_id,
                            "device": drive.key,
                            "replaces": source_node.clone(),
                            "target": target_node_name,
                            "sync": "full",
                            "auto-dismiss": false,
                            "copy-mode": "background",
                        })),
                    )
                    .await?;
                    let mut job =
                        TrackedJob::new(job_id, drive.key.clone(), JobKind::Mirror, source_node, CompletionMode::Skip);
                    job.target_node = Some(target_node_name);
                    mirror_jobs.track(job);
                } else {
                    let (target_volid, target_path) =
                        allocate_legacy_mirror_target(storage, drive).await?;
                    allocated.push(target_volid);

                    qmp.cmd(
                        peer,
                        "drive-mirror",
                        Some(json!({
                            "job-id": job_id,
                            "device": drive.key,
                            "target": target_path,
                            "format": "raw",
                            "mode": "existing",
                            "sync": "full",
                            "auto-dismiss": false,
                        })),
                    )
                    .await?;
                    let job =
                        TrackedJob::new(job_id, drive.key.clone(), JobKind::Mirror, source_node, CompletionMode::Skip);
                    mirror_jobs.track(job);
                }
            }
        }
    }

    if !mirror_jobs.is_empty() {
        mirror_jobs.wait_all_ready(&qmp, peer).await?;
    }

    set_migration_caps(&qmp, peer).await?;
    info!(vmid, target_node, "migration setup complete");

    Ok(PreparedMigration {
        plan: plan.clone(),
        mirror_jobs,
        allocated_target_volumes: allocated,
    })
}

async fn allocate_and_copy_offline(storage: &dyn StorageDriver, drive: &PlannedDrive) -> Result<String> {
    let size = storage.volume_size_info(&drive.volid).await?;
    storage
        .vdisk_alloc(&drive.target_storeid, "", "raw", None, size / 1024)
        .await
}

async fn attach_mirror_target(
    qmp: &Qmp<'_>,
    peer: &Peer,
    storage: &dyn StorageDriver,
    drive: &PlannedDrive,
) -> Result<(String, String)> {
    let size = storage.volume_size_info(&drive.volid).await?;
    let target_volid = storage
        .vdisk_alloc(&drive.target_storeid, "", "raw", None, size / 1024)
        .await?;
    let path = storage.path(&target_volid, None).await?;
    let size_override = efi_size_override(drive.is_efi, "raw", size);

    let target_node_name = blockdev::node_name(NodeKind::Format, &drive.key, &target_volid, None);
    let mut tree = json!({
        "node-name": target_node_name,
        "driver": "raw",
        "file": {
            "node-name": blockdev::node_name(NodeKind::File, &drive.key, &target_volid, None),
            "driver": "file",
            "filename": path,
        },
    });
    if let Some(size) = size_override {
        tree["size"] = json!(size);
    }
    qmp.cmd(peer, "blockdev-add", Some(tree)).await?;
    Ok((target_volid, target_node_name))
}

/// Device-addressed legacy path: `drive-mirror` takes a target filename
/// directly, no `blockdev-add` node to wire up first.
async fn allocate_legacy_mirror_target(storage: &dyn StorageDriver, drive: &PlannedDrive) -> Result<(String, String)> {
    let size = storage.volume_size_info(&drive.volid).await?;
    let target_volid = storage
        .vdisk_alloc(&drive.target_storeid, "", "raw", None, size / 1024)
        .await?;
    let path = storage.path(&target_volid, None).await?;
    Ok((target_volid, path))
}

async fn set_migration_caps(qmp: &Qmp<'_>, peer: &Peer) -> Result<()> {
    qmp.cmd(
        peer,
        "migrate-set-capabilities",
        Some(json!({ "capabilities": [
            { "capability": "xbzrle", "state": false },
            { "capability": "dirty-bitmaps", "state": true },
        ] })),
    )
    .await?;
    Ok(())
}
