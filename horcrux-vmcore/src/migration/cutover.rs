//! Migration cutover: issue `migrate`, poll
//! `query-migrate` to a terminal state, then complete or cancel the tracked
//! mirror jobs depending on outcome and detach accordingly.

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::blockjob::{self, CompletionMode};
use crate::error::{Error, Result};
use crate::migration::setup::PreparedMigration;
use crate::migration::RemoteNode;
use crate::qmp::{Peer, Qmp, QmpTransport};
use crate::version::{QemuVersion, ACTIVE_MIRROR_CHANGE};

#[allow(clippy::too_many_arguments)]
pub async fn cutover(
    qmp: &dyn QmpTransport,
    remote: &dyn RemoteNode,
    peer: &Peer,
    vmid: &str,
    target_uri: &str,
    prepared: &mut PreparedMigration,
    qemu_version: QemuVersion,
) -> Result<()> {
    let qmp = Qmp::new(qmp);

    if ACTIVE_MIRROR_CHANGE.satisfied_by(qemu_version) {
        for job in prepared.mirror_jobs.jobs_mut() {
            blockjob::switch_to_active_mode(&qmp, peer, &job.job_id).await?;
        }
    }

    qmp.cmd(peer, "migrate", Some(json!({ "uri": target_uri }))).await?;

    let status = poll_until_terminal(&qmp, peer).await?;
    match status.as_str() {
        "completed" => {
            for job in prepared.mirror_jobs.jobs_mut() {
                job.mode = CompletionMode::Complete;
            }
            prepared.mirror_jobs.run_to_completion(&qmp, peer).await?;
            remote.move_config_to_node(vmid).await?;
            // Source QEMU is torn down by the caller's lifecycle::destroy
            // without deactivating volumes already migrated.
            info!(vmid, "cutover completed, switched to target");
            Ok(())
        }
        other => {
            warn!(vmid, status = other, "migration did not complete, cancelling mirrors");
            cancel_mirrors_and_cleanup(&qmp, peer, prepared).await;
            Err(Error::MigrationFailed(format!("migration ended in status {other}")))
        }
    }
}

async fn poll_until_terminal(qmp: &Qmp<'_>, peer: &Peer) -> Result<String> {
    loop {
        let reply = qmp.cmd(peer, "query-migrate", None).await?;
        let status = reply
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        if matches!(status.as_str(), "completed" | "failed" | "cancelled") {
            return Ok(status);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn cancel_mirrors_and_cleanup(qmp: &Qmp<'_>, peer: &Peer, prepared: &mut PreparedMigration) {
    for job in prepared.mirror_jobs.jobs_mut() {
        job.mode = CompletionMode::Cancel;
    }
    let _ = prepared.mirror_jobs.run_to_completion(qmp, peer).await;
    // Target blockdev nodes and throttle groups are torn down as a side
    // effect of job cancellation above; the allocated volumes themselves
    // are freed by `rollback::rollback_after_cutover_failure` once the
    // caller knows which node to reach them on.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::precheck::MigrationPlan;
    use crate::qmp::mock::MockTransport;

    struct NoopRemote;
    #[async_trait::async_trait]
    impl RemoteNode for NoopRemote {
        async fn start_incoming(&self, _vmid: &str, _migratedfrom: &str, _incoming_uri: &str) -> Result<()> {
            Ok(())
        }
        async fn move_config_to_node(&self, _vmid: &str) -> Result<()> {
            Ok(())
        }
        async fn free_volume(&self, _volid: &str) -> Result<()> {
            Ok(())
        }
        async fn stop_vm(&self, _vmid: &str) -> Result<()> {
            Ok(())
        }
    }

    fn empty_prepared() -> PreparedMigration {
        PreparedMigration {
            plan: MigrationPlan::default(),
            mirror_jobs: crate::blockjob::BlockJobEngine::new(),
            allocated_target_volumes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn cutover_completes_on_migrate_status_completed() {
        let transport = MockTransport::default();
        transport.push_response("migrate", Ok(json!(null))).await;
        transport
            .push_response("query-migrate", Ok(json!({ "status": "completed" })))
            .await;
        let remote = NoopRemote;
        let peer = Peer::qmp("100");
        let mut prepared = empty_prepared();

        cutover(&transport, &remote, &peer, "100", "unix:/tmp/x", &mut prepared, QemuVersion::new(10, 0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cutover_cancels_mirrors_on_failed_status() {
        let transport = MockTransport::default();
        transport.push_response("migrate", Ok(json!(null))).await;
        transport
            .push_response("query-migrate", Ok(json!({ "status": "failed" })))
            .await;
        let remote = NoopRemote;
        let peer = Peer::qmp("100");
        let mut prepared = empty_prepared();

        let result = cutover(&transport, &remote, &peer, "100", "unix:/tmp/x", &mut prepared, QemuVersion::new(10, 0)).await;
        assert!(result.is_err());
    }
}
