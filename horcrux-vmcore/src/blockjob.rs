//! Drives `drive-mirror`/`blockdev-mirror`/`block-commit`/`block-stream`
//! with `auto-dismiss=false`, polling `query-block-jobs` once a second
//! until every tracked job concludes.
//!
//! A bounded polling loop rather than async/await combinators racing each
//! other: poll, parse, update a shared record, detect terminal state, same
//! shape as the migration job poller.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::blockdev;
use crate::error::{Error, Result};
use crate::qmp::{Peer, Qmp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Mirror,
    Commit,
    Stream,
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    Complete,
    Cancel,
    Skip,
    Auto,
}

#[derive(Debug, Clone)]
pub struct TrackedJob {
    pub job_id: String,
    pub device_id: String,
    pub kind: JobKind,
    pub source_node: String,
    pub target_node: Option<String>,
    pub detach_node: Option<String>,
    pub mode: CompletionMode,
    pub completion_requested: bool,
    pub ready: bool,
    pub progress: (u64, u64),
    pub complete_retries: u32,
}

impl TrackedJob {
    pub fn new(job_id: impl Into<String>, device_id: impl Into<String>, kind: JobKind, source_node: impl Into<String>, mode: CompletionMode) -> Self {
        Self {
            job_id: job_id.into(),
            device_id: device_id.into(),
            kind,
            source_node: source_node.into(),
            target_node: None,
            detach_node: None,
            mode,
            completion_requested: false,
            ready: false,
            progress: (0, 0),
            complete_retries: 0,
        }
    }
}

/// Polls every tracked job to completion, applying the protocol of spec
/// §4.5: absent + our completion accepted (or mode auto) => success; absent
/// otherwise => unexpected cancellation; `concluded` => dismiss, detach on
/// error, raise. Any exception cancels all remaining tracked jobs before
/// re-raising (failure policy).
pub struct BlockJobEngine {
    jobs: HashMap<String, TrackedJob>,
    poll_interval: Duration,
    complete_retry_budget: u32,
}

impl BlockJobEngine {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            poll_interval: Duration::from_secs(1),
            complete_retry_budget: 300,
        }
    }

    pub fn track(&mut self, job: TrackedJob) {
        self.jobs.insert(job.job_id.clone(), job);
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Mutable access to every tracked job, used by migration's cutover
    /// phase to flip `mode` from `Skip` to `Complete`/`Cancel` once the
    /// source has decided the outcome.
    pub fn jobs_mut(&mut self) -> impl Iterator<Item = &mut TrackedJob> {
        self.jobs.values_mut()
    }

    async fn query(&self, qmp: &Qmp<'_>, peer: &Peer) -> Result<Vec<Value>> {
        let reply = qmp.cmd(peer, "query-block-jobs", None).await?;
        Ok(reply.as_array().cloned().unwrap_or_default())
    }

    /// Runs the full monitor loop until every tracked job reaches a terminal
    /// state or `wait_for_ready_then` is used for cutover-style callers.
    pub async fn run_to_completion(&mut self, qmp: &Qmp<'_>, peer: &Peer) -> Result<()> {
        loop {
            if self.jobs.is_empty() {
                return Ok(());
            }
            match self.poll_once(qmp, peer).await {
                Ok(()) => {}
                Err(e) => {
                    self.cancel_all(qmp, peer).await;
                    return Err(e);
                }
            }
            if self.jobs.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Polls until every tracked job reports `ready=true`, without
    /// completing them — used by migration's cutover phase where completion
    /// is deferred to the moment the guest actually switches over.
    pub async fn wait_all_ready(&mut self, qmp: &Qmp<'_>, peer: &Peer) -> Result<()> {
        loop {
            self.refresh_progress(qmp, peer).await?;
            if self.jobs.values().all(|j| j.ready) {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn refresh_progress(&mut self, qmp: &Qmp<'_>, peer: &Peer) -> Result<()> {
        let reply = self.query(qmp, peer).await?;
        for job in self.jobs.values_mut() {
            if let Some(info) = reply.iter().find(|r| r.get("id").and_then(|v| v.as_str()) == Some(&job.job_id)) {
                job.ready = info.get("ready").and_then(|v| v.as_bool()).unwrap_or(false);
                let offset = info.get("offset").and_then(|v| v.as_u64()).unwrap_or(0);
                let len = info.get("len").and_then(|v| v.as_u64()).unwrap_or(0);
                job.progress = (offset, len);
            }
        }
        Ok(())
    }

    async fn poll_once(&mut self, qmp: &Qmp<'_>, peer: &Peer) -> Result<()> {
        let reply = self.query(qmp, peer).await?;
        let present: HashMap<&str, &Value> = reply
            .iter()
            .filter_map(|v| v.get("id").and_then(|i| i.as_str()).map(|id| (id, v)))
            .collect();

        let ids: Vec<String> = self.jobs.keys().cloned().collect();
        for id in ids {
            let job = self.jobs.get(&id).unwrap().clone();
            match present.get(id.as_str()) {
                None => {
                    if job.completion_requested || job.mode == CompletionMode::Auto {
                        info!(job_id = %id, "block job finished successfully");
                        self.jobs.remove(&id);
                    } else {
                        error!(job_id = %id, "block job disappeared unexpectedly");
                        self.jobs.remove(&id);
                        return Err(Error::JobFailed {
                            job_id: id,
                            reason: "job cancelled unexpectedly".to_string(),
                        });
                    }
                }
                Some(info) => {
                    let status = info.get("status").and_then(|v| v.as_str()).unwrap_or("");
                    if status == "concluded" {
                        self.conclude(qmp, peer, &id, info).await?;
                    } else {
                        self.update_progress(&id, info);
                        if !job.completion_requested {
                            self.maybe_complete(qmp, peer, &id).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn update_progress(&mut self, id: &str, info: &Value) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.ready = info.get("ready").and_then(|v| v.as_bool()).unwrap_or(job.ready);
            let offset = info.get("offset").and_then(|v| v.as_u64()).unwrap_or(job.progress.0);
            let len = info.get("len").and_then(|v| v.as_u64()).unwrap_or(job.progress.1);
            job.progress = (offset, len);
        }
    }

    async fn maybe_complete(&mut self, qmp: &Qmp<'_>, peer: &Peer, id: &str) -> Result<()> {
        let job = self.jobs.get(id).cloned().unwrap();
        if !job.ready {
            return Ok(());
        }
        match job.mode {
            CompletionMode::Skip | CompletionMode::Auto => {}
            CompletionMode::Complete => {
                match qmp.cmd(peer, "block-job-complete", Some(json!({ "device": id }))).await {
                    Ok(_) => {
                        if let Some(job) = self.jobs.get_mut(id) {
                            job.completion_requested = true;
                        }
                    }
                    Err(e) if e.to_string().contains("cannot be completed") => {
                        let retries = self.jobs.get(id).map(|j| j.complete_retries).unwrap_or(0) + 1;
                        if retries >= self.complete_retry_budget {
                            self.jobs.remove(id);
                            return Err(Error::Timeout(format!(
                                "block-job-complete retry budget exhausted for job {id}"
                            )));
                        }
                        if let Some(job) = self.jobs.get_mut(id) {
                            job.complete_retries = retries;
                        }
                        warn!(job_id = %id, retries, "completion not ready yet, will retry");
                    }
                    Err(e) => return Err(e),
                }
            }
            CompletionMode::Cancel => {
                qmp.cmd(peer, "block-job-cancel", Some(json!({ "device": id }))).await?;
                if let Some(job) = self.jobs.get_mut(id) {
                    job.completion_requested = true;
                }
            }
        }
        Ok(())
    }

    async fn conclude(&mut self, qmp: &Qmp<'_>, peer: &Peer, id: &str, info: &Value) -> Result<()> {
        let error_msg = info.get("error").and_then(|v| v.as_str()).map(str::to_string);
        qmp.cmd(peer, "job-dismiss", Some(json!({ "id": id }))).await?;

        let job = self.jobs.remove(id).unwrap();
        if let Some(reason) = error_msg {
            let detach_target = job.target_node.as_deref().unwrap_or(&job.source_node);
            if let Err(e) = blockdev::detach(qmp, peer, detach_target).await {
                warn!(job_id = %id, error = %e, "failed to detach node after job error");
            }
            return Err(Error::JobFailed { job_id: id.to_string(), reason });
        }

        // Mirror-specific: on a clean `complete`, the source node is what
        // must be torn down (writes now land on the target); on a clean
        // `cancel`, it's the target that's discarded and the source lives on.
        if job.kind == JobKind::Mirror {
            let detach_target = match job.mode {
                CompletionMode::Complete => Some(job.source_node.as_str()),
                CompletionMode::Cancel => job.target_node.as_deref(),
                CompletionMode::Skip | CompletionMode::Auto => None,
            };
            if let Some(node) = detach_target {
                if let Err(e) = blockdev::detach(qmp, peer, node).await {
                    warn!(job_id = %id, error = %e, "failed to detach node after mirror conclusion");
                }
            }
        }

        info!(job_id = %id, "block job concluded successfully");
        Ok(())
    }

    async fn cancel_all(&mut self, qmp: &Qmp<'_>, peer: &Peer) {
        for id in self.jobs.keys().cloned().collect::<Vec<_>>() {
            let _ = qmp.cmd(peer, "block-job-cancel", Some(json!({ "device": id }))).await;
        }
        self.jobs.clear();
    }
}

impl Default for BlockJobEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Transitions a running mirror to `write-blocking` mode (requires QEMU ≥
/// 8.2), then polls until `actively-synced=true`.
pub async fn switch_to_active_mode(qmp: &Qmp<'_>, peer: &Peer, job_id: &str) -> Result<()> {
    qmp.cmd(
        peer,
        "block-job-change",
        Some(json!({ "id": job_id, "type": "mirror", "copy-mode": "write-blocking" })),
    )
    .await?;
    loop {
        let jobs = qmp.cmd(peer, "query-block-jobs", None).await?;
        let synced = jobs
            .as_array()
            .unwrap_or(&Vec::new())
            .iter()
            .find(|j| j.get("id").and_then(|v| v.as_str()) == Some(job_id))
            .and_then(|j| j.get("actively-synced"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if synced {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qmp::mock::MockTransport;

    #[tokio::test]
    async fn job_absent_after_completion_is_success() {
        let transport = MockTransport::default();
        transport.push_response("query-block-jobs", Ok(json!([]))).await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");

        let mut engine = BlockJobEngine::new();
        let mut job = TrackedJob::new("commit-scsi0", "scsi0", JobKind::Commit, "fabc", CompletionMode::Auto);
        job.completion_requested = false;
        engine.track(job);

        engine.run_to_completion(&qmp, &peer).await.unwrap();
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn job_absent_without_completion_is_error() {
        let transport = MockTransport::default();
        transport.push_response("query-block-jobs", Ok(json!([]))).await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");

        let mut engine = BlockJobEngine::new();
        engine.track(TrackedJob::new("mirror-scsi0", "scsi0", JobKind::Mirror, "fabc", CompletionMode::Complete));

        let result = engine.run_to_completion(&qmp, &peer).await;
        assert!(matches!(result, Err(Error::JobFailed { .. })));
    }

    #[tokio::test]
    async fn concluded_with_error_dismisses_and_detaches() {
        let transport = MockTransport::default();
        transport
            .push_response(
                "query-block-jobs",
                Ok(json!([{ "id": "mirror-scsi0", "status": "concluded", "error": "io error" }])),
            )
            .await;
        transport
            .push_response("query-named-block-nodes", Ok(json!([])))
            .await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");

        let mut engine = BlockJobEngine::new();
        let mut job = TrackedJob::new("mirror-scsi0", "scsi0", JobKind::Mirror, "fsrc", CompletionMode::Complete);
        job.target_node = Some("ftarget".to_string());
        engine.track(job);

        let result = engine.run_to_completion(&qmp, &peer).await;
        assert!(matches!(result, Err(Error::JobFailed { .. })));
        let log = transport.call_log().await;
        assert!(log.iter().any(|(c, _)| c == "job-dismiss"));
    }

    #[tokio::test]
    async fn concluded_mirror_complete_detaches_source_node() {
        let transport = MockTransport::default();
        transport
            .push_response(
                "query-block-jobs",
                Ok(json!([{ "id": "mirror-scsi0", "status": "concluded" }])),
            )
            .await;
        transport
            .push_response("query-named-block-nodes", Ok(json!([{ "node-name": "fsrc" }])))
            .await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");

        let mut engine = BlockJobEngine::new();
        let mut job = TrackedJob::new("mirror-scsi0", "scsi0", JobKind::Mirror, "fsrc", CompletionMode::Complete);
        job.target_node = Some("ftarget".to_string());
        engine.track(job);

        engine.run_to_completion(&qmp, &peer).await.unwrap();
        let log = transport.call_log().await;
        assert!(log.iter().any(|(c, args)| c == "blockdev-del"
            && args.as_ref().and_then(|a| a.get("node-name")).and_then(|v| v.as_str()) == Some("fsrc")));
    }

    #[tokio::test]
    async fn concluded_mirror_cancel_detaches_target_node() {
        let transport = MockTransport::default();
        transport
            .push_response(
                "query-block-jobs",
                Ok(json!([{ "id": "mirror-scsi0", "status": "concluded" }])),
            )
            .await;
        transport
            .push_response("query-named-block-nodes", Ok(json!([{ "node-name": "ftarget" }])))
            .await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");

        let mut engine = BlockJobEngine::new();
        let mut job = TrackedJob::new("mirror-scsi0", "scsi0", JobKind::Mirror, "fsrc", CompletionMode::Cancel);
        job.target_node = Some("ftarget".to_string());
        engine.track(job);

        engine.run_to_completion(&qmp, &peer).await.unwrap();
        let log = transport.call_log().await;
        assert!(log.iter().any(|(c, args)| c == "blockdev-del"
            && args.as_ref().and_then(|a| a.get("node-name")).and_then(|v| v.as_str()) == Some("ftarget")));
    }

    #[tokio::test]
    async fn maybe_complete_fails_once_retry_budget_exhausted() {
        // Drives the counter straight to one below the budget rather than
        // looping 300 real poll/sleep cycles.
        let transport = MockTransport::default();
        transport
            .push_response(
                "block-job-complete",
                Err(Error::CommandError {
                    command: "block-job-complete".to_string(),
                    class: "GenericError".to_string(),
                    desc: "cannot be completed".to_string(),
                }),
            )
            .await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");

        let mut engine = BlockJobEngine::new();
        let mut job = TrackedJob::new("mirror-scsi0", "scsi0", JobKind::Mirror, "fsrc", CompletionMode::Complete);
        job.ready = true;
        job.complete_retries = engine.complete_retry_budget - 1;
        engine.track(job);

        let result = engine.maybe_complete(&qmp, &peer, "mirror-scsi0").await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(engine.jobs.get("mirror-scsi0").is_none());
    }

    #[tokio::test]
    async fn switch_to_active_mode_polls_until_synced() {
        let transport = MockTransport::default();
        transport
            .push_response("query-block-jobs", Ok(json!([{ "id": "j1", "actively-synced": true }])))
            .await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");
        switch_to_active_mode(&qmp, &peer, "j1").await.unwrap();
    }
}
