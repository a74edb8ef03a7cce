//! Post-migration health check.
//! Confirms the VM actually came up responsive on the target before the
//! migration is reported complete to the caller.

use crate::error::{Error, Result};
use crate::qmp::{Peer, Qmp, QmpTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthResult {
    Passed,
    Failed,
}

/// Checks that the target QEMU instance answers `query-status` with
/// `running` — the one check this core can perform without guest-agent or
/// network plumbing, which remain the HTTP layer's job.
pub async fn check(qmp: &dyn QmpTransport, peer: &Peer) -> Result<HealthResult> {
    let qmp = Qmp::new(qmp);
    let status = qmp.cmd(peer, "query-status", None).await?;
    match status.get("status").and_then(|v| v.as_str()) {
        Some("running") => Ok(HealthResult::Passed),
        other => Err(Error::MigrationFailed(format!(
            "post-migration health check failed: status={:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qmp::mock::MockTransport;

    #[tokio::test]
    async fn passes_when_target_reports_running() {
        let transport = MockTransport::default();
        transport
            .push_response("query-status", Ok(serde_json::json!({ "status": "running" })))
            .await;
        let peer = Peer::qmp("100");
        assert_eq!(check(&transport, &peer).await.unwrap(), HealthResult::Passed);
    }

    #[tokio::test]
    async fn fails_when_target_reports_paused() {
        let transport = MockTransport::default();
        transport
            .push_response("query-status", Ok(serde_json::json!({ "status": "paused" })))
            .await;
        let peer = Peer::qmp("100");
        assert!(check(&transport, &peer).await.is_err());
    }
}
