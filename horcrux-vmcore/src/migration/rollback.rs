//! Migration rollback: undoes allocations on the target when setup fails before
//! `migrate` is ever issued, or when cutover itself fails after issuing it.
//!
//! Best-effort, not a second source of truth — every step here is a cleanup
//! of state this module itself created, never a destructive action on the
//! VM's own config or volumes.

use tracing::warn;

use crate::migration::precheck::MigrationPlan;
use crate::migration::setup::PreparedMigration;
use crate::migration::RemoteNode;

/// Setup failed before `migrate` was issued: free whatever target volumes
/// were allocated so far. The plan alone is enough here since setup hasn't
/// handed back a `PreparedMigration` yet.
pub async fn rollback_before_cutover(remote: &dyn RemoteNode, plan: &MigrationPlan) {
    for drive in &plan.drives {
        if let Err(e) = remote.free_volume(&drive.volid).await {
            warn!(drive = %drive.key, error = %e, "failed to free target volume during rollback");
        }
    }
}

/// Cutover failed after `migrate` was issued but before it reached
/// `completed`: mirrors have already been cancelled by `cutover.rs`'s own
/// failure path, so this only frees the target-side volumes those mirrors
/// were writing into. The source VM is left running untouched.
pub async fn rollback_after_cutover_failure(remote: &dyn RemoteNode, prepared: &PreparedMigration) {
    for volid in &prepared.allocated_target_volumes {
        if let Err(e) = remote.free_volume(volid).await {
            warn!(volid, error = %e, "failed to free target volume during rollback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRemote {
        freed: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemoteNode for CountingRemote {
        async fn start_incoming(&self, _vmid: &str, _migratedfrom: &str, _incoming_uri: &str) -> Result<()> {
            Ok(())
        }
        async fn move_config_to_node(&self, _vmid: &str) -> Result<()> {
            Ok(())
        }
        async fn free_volume(&self, _volid: &str) -> Result<()> {
            self.freed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop_vm(&self, _vmid: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn rollback_after_cutover_failure_frees_every_allocated_volume() {
        let remote = CountingRemote { freed: AtomicUsize::new(0) };
        let prepared = PreparedMigration {
            plan: MigrationPlan::default(),
            mirror_jobs: crate::blockjob::BlockJobEngine::new(),
            allocated_target_volumes: vec!["dir:x1".to_string(), "dir:x2".to_string()],
        };
        rollback_after_cutover_failure(&remote, &prepared).await;
        assert_eq!(remote.freed.load(Ordering::SeqCst), 2);
    }
}
