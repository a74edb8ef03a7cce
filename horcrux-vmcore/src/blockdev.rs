//! Builds `blockdev-add` trees (throttle → format → file), deterministic
//! node-name hashing, attach/detach/resize/change-medium, and throttle-group
//! lifecycle.
//!
//! Every QMP call here follows the same `tracing`-logged, `Result`-returning
//! shape used throughout the crate, and drive handling dispatches per
//! backend the same way the snapshot engine does.

use std::collections::HashMap;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::drive::{BandwidthLimits, Drive, DriveRole};
use crate::error::{Error, Result};
use crate::qmp::{Peer, Qmp};
use crate::storage::StorageDriver;

/// Node-name type prefixes: `f` format, `e` file, `a` alloc-track, `z` zeroinit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Format,
    File,
    AllocTrack,
    ZeroInit,
}

impl NodeKind {
    fn prefix(&self) -> char {
        match self {
            NodeKind::Format => 'f',
            NodeKind::File => 'e',
            NodeKind::AllocTrack => 'a',
            NodeKind::ZeroInit => 'z',
        }
    }
}

/// `node_name(fmt|file, drive, volid, snap)`: a stable SHA-256 hash of
/// `drive=<id>,snap=<s>?,volid=<v>` truncated to 30 hex chars, prefixed by
/// the node kind's type character.
pub fn node_name(kind: NodeKind, drive_id: &str, volid: &str, snap: Option<&str>) -> String {
    let mut input = format!("drive={drive_id}");
    if let Some(snap) = snap {
        input.push_str(&format!(",snap={snap}"));
    }
    input.push_str(&format!(",volid={volid}"));

    let digest = Sha256::digest(input.as_bytes());
    let hex = hex::encode(digest);
    format!("{}{}", kind.prefix(), &hex[..30])
}

pub fn throttle_group_name(drive_id: &str) -> String {
    format!("throttle-drive-{drive_id}")
}

pub fn top_node_name(drive_id: &str) -> String {
    format!("drive-{drive_id}")
}

/// Parses a top node name back into its drive id.
pub fn parse_top_node(node: &str) -> Option<&str> {
    node.strip_prefix("drive-")
}

#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    pub read_only: bool,
    pub size: Option<u64>,
    pub snapshot_name: Option<String>,
    pub zero_initialized: bool,
    pub no_throttle: bool,
    pub backing: Option<String>,
}

fn throttle_limits_json(limits: &BandwidthLimits) -> Value {
    let mut obj = serde_json::Map::new();
    let mut put = |key: &str, v: Option<f64>| {
        if let Some(v) = v {
            obj.insert(key.to_string(), json!((v * 1024.0 * 1024.0) as u64));
        }
    };
    put("bps-total", limits.mbps);
    put("bps-read", limits.mbps_rd);
    put("bps-write", limits.mbps_wr);
    put("bps-total-max", limits.mbps_max);
    put("bps-read-max", limits.mbps_rd_max);
    put("bps-write-max", limits.mbps_wr_max);
    if let Some(v) = limits.iops {
        obj.insert("iops-total".to_string(), json!(v));
    }
    if let Some(v) = limits.iops_rd {
        obj.insert("iops-read".to_string(), json!(v));
    }
    if let Some(v) = limits.iops_wr {
        obj.insert("iops-write".to_string(), json!(v));
    }
    if let Some(v) = limits.iops_max {
        obj.insert("iops-total-max".to_string(), json!(v));
    }
    if let Some(v) = limits.iops_rd_max {
        obj.insert("iops-read-max".to_string(), json!(v));
    }
    if let Some(v) = limits.iops_wr_max {
        obj.insert("iops-write-max".to_string(), json!(v));
    }
    Value::Object(obj)
}

fn file_driver_for(storeid: &str) -> &'static str {
    // Storage-type-dependent file driver selection; the core only needs the
    // common local/file-backed case plus the protocol drivers spec's file
    // node mentions (rbd/nbd handled by dedicated attach paths).
    let _ = storeid;
    "file"
}

/// Builds the `blockdev-add` arguments tree for a drive: throttle → format →
/// file, top-down.
pub async fn build_tree(
    drive_id: &str,
    drive: &Drive,
    volid: &str,
    path: &str,
    storage: &dyn StorageDriver,
    storeid: &str,
    opts: &AttachOptions,
) -> Result<Value> {
    let read_only = drive.effective_read_only(Some(opts.read_only));
    let format = drive.format.clone().unwrap_or_else(|| "raw".to_string());

    let direct_io = storage.supports_direct_io(storeid).await.unwrap_or(false);
    let aio = drive
        .aio
        .map(|a| a.as_str().to_string())
        .unwrap_or_else(|| if direct_io { "native".to_string() } else { "threads".to_string() });

    let file_node = node_name(NodeKind::File, drive_id, volid, opts.snapshot_name.as_deref());
    let format_node = node_name(NodeKind::Format, drive_id, volid, opts.snapshot_name.as_deref());

    // EFI disks on RBD force cache=writeback: read-modify-write on SPI flash.
    let cache_writeback = drive.role() == DriveRole::Efidisk && storeid.contains("rbd");
    let cache_direct = if cache_writeback {
        false
    } else {
        !matches!(drive.cache, crate::drive::CacheMode::None | crate::drive::CacheMode::WriteBack)
    };
    let cache_no_flush = matches!(drive.cache, crate::drive::CacheMode::Unsafe);

    let mut file_node_json = json!({
        "node-name": file_node,
        "driver": file_driver_for(storeid),
        "filename": path,
        "cache": { "direct": cache_direct, "no-flush": cache_no_flush },
        "discard": drive.discard.node_discard(),
        "read-only": read_only,
    });
    if matches!(format.as_str(), "raw" | "qcow2") {
        file_node_json["aio"] = json!(aio);
    }

    let mut format_node_json = json!({
        "node-name": format_node,
        "driver": format,
        "file": file_node_json,
        "read-only": read_only,
    });
    if let Some(size) = opts.size.filter(|_| format == "raw") {
        format_node_json["size"] = json!(size);
    }
    if format == "qcow2" && storage.snapshot_as_volume_chain(storeid).await.unwrap_or(false) {
        format_node_json["discard-no-unref"] = json!(true);
    }
    if let Some(backing) = &opts.backing {
        format_node_json["backing"] = json!(backing);
    } else if opts.snapshot_name.is_some() {
        format_node_json["backing"] = Value::Null;
    }

    if opts.no_throttle {
        return Ok(format_node_json);
    }

    Ok(json!({
        "node-name": top_node_name(drive_id),
        "driver": "throttle",
        "throttle-group": throttle_group_name(drive_id),
        "file": format_node_json,
    }))
}

/// `attach(vm, drive, opts) -> node_name`.
pub async fn attach(
    qmp: &Qmp<'_>,
    peer: &Peer,
    drive_id: &str,
    drive: &Drive,
    volid: &str,
    path: &str,
    storage: &dyn StorageDriver,
    storeid: &str,
    opts: &AttachOptions,
) -> Result<String> {
    let is_top = !opts.no_throttle && drive.role() != DriveRole::TpmState;

    if is_top {
        let group = throttle_group_name(drive_id);
        // Pre-clean any stale throttle-group with the same id.
        let _ = qmp
            .cmd(peer, "object-del", Some(json!({ "id": group })))
            .await;
        let props = throttle_limits_json(&drive.bandwidth);
        qmp.cmd(
            peer,
            "object-add",
            Some(json!({ "qom-type": "throttle-group", "id": group, "limits": props })),
        )
        .await
        .map_err(|e| Error::AddFailed {
            node: group.clone(),
            reason: e.to_string(),
        })?;
    }

    let tree = build_tree(drive_id, drive, volid, path, storage, storeid, opts).await?;
    let node_name = tree
        .get("node-name")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    match qmp.cmd(peer, "blockdev-add", Some(tree)).await {
        Ok(_) => {
            info!(drive_id, %node_name, "attached blockdev tree");
            Ok(node_name)
        }
        Err(e) => {
            if is_top {
                warn!(drive_id, "blockdev-add failed, rolling back throttle-group");
                let _ = qmp
                    .cmd(peer, "object-del", Some(json!({ "id": throttle_group_name(drive_id) })))
                    .await;
            }
            Err(Error::AddFailed {
                node: node_name,
                reason: e.to_string(),
            })
        }
    }
}

/// `detach(vm, node_name)`: query the live node graph, walk the `file` child
/// chain from `node_name` down, issuing `blockdev-del` per node, swallowing
/// "not found", then tear down the throttle-group if this was a top node.
pub async fn detach(qmp: &Qmp<'_>, peer: &Peer, node_name: &str) -> Result<()> {
    let named = qmp.cmd(peer, "query-named-block-nodes", None).await?;
    let by_name: HashMap<String, Value> = named
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|n| {
                    n.get("node-name")
                        .and_then(|v| v.as_str())
                        .map(|name| (name.to_string(), n.clone()))
                })
                .collect()
        })
        .unwrap_or_default();

    let mut current = Some(node_name.to_string());
    while let Some(name) = current.take() {
        let Some(info) = by_name.get(&name) else {
            debug!(node = %name, "blockdev already gone, skipping");
            break;
        };
        current = info
            .get("file")
            .and_then(|f| f.get("node-name"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        match qmp.cmd(peer, "blockdev-del", Some(json!({ "node-name": name }))).await {
            Ok(_) => debug!(node = %name, "blockdev-del ok"),
            Err(e) if e.to_string().contains("not found") => {
                debug!(node = %name, "blockdev-del: already gone");
            }
            Err(e) => {
                return Err(Error::DelFailed {
                    node: name,
                    reason: e.to_string(),
                })
            }
        }
    }

    if let Some(drive_id) = parse_top_node(node_name) {
        let group = throttle_group_name(drive_id);
        match qmp.cmd(peer, "object-del", Some(json!({ "id": group }))).await {
            Ok(_) => {}
            Err(e) if e.to_string().contains("not found") => {}
            Err(_) => return Err(Error::ObjectDelFailed(group)),
        }
    }
    Ok(())
}

/// `change-medium`: open tray → remove medium → detach → attach new (if any)
/// → insert → close tray.
pub async fn change_medium(
    qmp: &Qmp<'_>,
    peer: &Peer,
    device_id: &str,
    old_node: &str,
    new_attach: Option<Value>,
) -> Result<()> {
    qmp.cmd(
        peer,
        "blockdev-open-tray",
        Some(json!({ "id": device_id, "force": true })),
    )
    .await?;
    qmp.cmd(peer, "blockdev-remove-medium", Some(json!({ "id": device_id })))
        .await?;
    detach(qmp, peer, old_node).await?;

    if let Some(tree) = new_attach {
        let node_name = tree
            .get("node-name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        qmp.cmd(peer, "blockdev-add", Some(tree)).await?;
        qmp.cmd(
            peer,
            "blockdev-insert-medium",
            Some(json!({ "id": device_id, "node-name": node_name })),
        )
        .await?;
    }
    qmp.cmd(peer, "blockdev-close-tray", Some(json!({ "id": device_id })))
        .await?;
    Ok(())
}

/// Resize the top node (throttle), not the format node, so the new size
/// propagates.
pub async fn resize(qmp: &Qmp<'_>, peer: &Peer, drive_id: &str, new_size: u64) -> Result<()> {
    qmp.cmd(
        peer,
        "block_resize",
        Some(json!({ "node-name": top_node_name(drive_id), "size": new_size })),
    )
    .await?;
    Ok(())
}

/// `set_io_throttle` via `qom-set` on the throttle-group (new path) or
/// `block_set_io_throttle` (legacy path) depending on machine version.
pub async fn set_io_throttle(
    qmp: &Qmp<'_>,
    peer: &Peer,
    drive_id: &str,
    device_id: &str,
    limits: &BandwidthLimits,
    use_new_path: bool,
) -> Result<()> {
    if use_new_path {
        qmp.cmd(
            peer,
            "qom-set",
            Some(json!({
                "path": throttle_group_name(drive_id),
                "property": "limits",
                "value": throttle_limits_json(limits),
            })),
        )
        .await?;
    } else {
        let mut args = throttle_limits_json(limits);
        args["device"] = json!(device_id);
        qmp.cmd(peer, "block_set_io_throttle", Some(args)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{parse_drive, Interface};
    use crate::qmp::mock::MockTransport;

    #[test]
    fn node_name_is_deterministic() {
        let a = node_name(NodeKind::Format, "scsi0", "local:vm-100-disk-0", None);
        let b = node_name(NodeKind::Format, "scsi0", "local:vm-100-disk-0", None);
        assert_eq!(a, b);
        assert!(a.starts_with('f'));
        assert_eq!(a.len(), 31);
    }

    #[test]
    fn node_name_varies_with_snapshot() {
        let a = node_name(NodeKind::Format, "scsi0", "local:vm-100-disk-0", None);
        let b = node_name(NodeKind::Format, "scsi0", "local:vm-100-disk-0", Some("s1"));
        assert_ne!(a, b);
    }

    #[test]
    fn top_node_parses_back_to_drive_id() {
        assert_eq!(parse_top_node(&top_node_name("scsi0")), Some("scsi0"));
    }

    #[tokio::test]
    async fn attach_then_detach_leaves_no_trace() {
        let transport = MockTransport::default();
        let peer = Peer::qmp("100");
        let drive = parse_drive(Interface::Scsi, 0, "local:vm-100-disk-0").unwrap();
        let storage = crate::storage::directory::DirectoryDriver::new("/tmp");

        let top = top_node_name("scsi0");
        transport
            .push_response(
                "query-named-block-nodes",
                Ok(serde_json::json!([{ "node-name": top }])),
            )
            .await;

        let qmp = Qmp::new(&transport);
        let node = attach(
            &qmp,
            &peer,
            "scsi0",
            &drive,
            "local:vm-100-disk-0",
            "/tmp/vm-100-disk-0.qcow2",
            &storage,
            "local",
            &AttachOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(node, top_node_name("scsi0"));

        detach(&qmp, &peer, &node).await.unwrap();
        let log = transport.call_log().await;
        assert!(log.iter().any(|(c, _)| c == "blockdev-add"));
        assert!(log.iter().any(|(c, _)| c == "blockdev-del"));
        assert!(log.iter().any(|(c, _)| c == "object-del"));
    }
}
