//! Error kinds shared by every component of the VM core.
//!
//! Every failure that crosses a component boundary carries the identifier
//! it failed on, never a bare string.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("vm {0} is not running locally")]
    NotRunning(String),

    #[error("vm {vmid} is locked ({lock})")]
    Locked { vmid: String, lock: String },

    #[error("checksum mismatch for vm {0}")]
    DigestMismatch(String),

    #[error("unsupported feature {feature} on storage {storage}")]
    UnsupportedFeature { feature: String, storage: String },

    #[error("timeout waiting on {0}")]
    Timeout(String),

    #[error("storage failure on volume {volid}: {reason}")]
    StorageFailure { volid: String, reason: String },

    #[error("block job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("partial commit on vm {vmid}, snapshot {snapshot}: {detail}")]
    PartialCommit {
        vmid: String,
        snapshot: String,
        detail: String,
    },

    #[error("failed to write config for vm {0}")]
    ConfigWrite(String),

    #[error("device {device} rejected hotplug: {reason}")]
    HotplugRefused { device: String, reason: String },

    #[error("qmp socket error for {peer}: {reason}")]
    SocketOpen { peer: String, reason: String },

    #[error("qmp protocol decode error from {peer}: {reason}")]
    ProtocolDecode { peer: String, reason: String },

    #[error("qmp command {command} failed: {class}: {desc}")]
    CommandError {
        command: String,
        class: String,
        desc: String,
    },

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("failed to add node {node}: {reason}")]
    AddFailed { node: String, reason: String },

    #[error("failed to delete node {node}: {reason}")]
    DelFailed { node: String, reason: String },

    #[error("failed to delete throttle-group object {0}")]
    ObjectDelFailed(String),

    #[error("invalid drive option string: {0}")]
    InvalidDrive(String),

    #[error("invalid config section: {0}")]
    InvalidConfig(String),

    #[error("snapshot {name} not found for vm {vmid}")]
    SnapshotNotFound { vmid: String, name: String },

    #[error("snapshot {name} already exists for vm {vmid}")]
    SnapshotExists { vmid: String, name: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("migration failed: {0}")]
    MigrationFailed(String),
}
