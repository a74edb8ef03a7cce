//! Computes `max_mem` from CPU `phys-bits`, lays out hot-pluggable DIMMs
//! across NUMA nodes, allocates/frees hugepages, and scales vCPUs online.
//!
//! Numeric configuration is range-checked through a `check()` pass before
//! any QMP call is issued; QMP call shape and `tracing` density follow
//! `blockdev.rs`.

use serde_json::json;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::qmp::{Peer, Qmp};

pub const STATIC_FLOOR_MIB: u64 = 1024;
pub const MAX_MEM_CAP_MIB: u64 = 4 * 1024 * 1024; // 4 TiB in MiB
const DIMM_SLOTS_PER_BANK: u32 = 32;

/// `max_mem` derived from CPU `phys-bits`: `1 << (bits - 21)` MiB, capped at
/// 4 TiB.
pub fn max_mem_mib(phys_bits: u8) -> u64 {
    if phys_bits < 21 {
        return STATIC_FLOOR_MIB;
    }
    let mib = 1u64 << (phys_bits as u32 - 21);
    mib.min(MAX_MEM_CAP_MIB)
}

pub fn phys_bits_from_host_cpuinfo(cpuinfo: &str) -> Option<u8> {
    for line in cpuinfo.lines() {
        if let Some(rest) = line.strip_prefix("address sizes") {
            let bits = rest.split(':').nth(1)?.trim();
            let first_num = bits.split_whitespace().next()?;
            return first_num.parse().ok();
        }
    }
    None
}

#[derive(Debug, Clone, Copy)]
pub struct DimmSlot {
    pub bank: u32,
    pub slot: u32,
    pub size_mib: u64,
    pub numa_node: u32,
}

impl DimmSlot {
    pub fn dimm_id(&self, index: u32) -> String {
        format!("dimm{index}")
    }

    pub fn memdev_id(&self, index: u32) -> String {
        format!("mem-dimm{index}")
    }
}

/// Enumerates the DIMM layout used to grow memory from `current_mib` to
/// `target_mib`: doubling sizes per bank starting at 512 MiB, round-robin
/// across `numa_nodes`.
pub fn plan_dimms(current_mib: u64, target_mib: u64, numa_nodes: u32, first_index: u32) -> Result<Vec<(u32, DimmSlot)>> {
    if target_mib <= current_mib {
        return Ok(Vec::new());
    }
    let nodes = numa_nodes.max(1);
    let mut remaining = target_mib - current_mib;
    let mut plan = Vec::new();
    let mut index = first_index;
    let mut size_mib = 512u64;
    let mut in_bank = 0u32;
    let mut bank = 0u32;

    while remaining > 0 {
        let take = size_mib.min(remaining);
        if take < size_mib && take != remaining {
            return Err(Error::HotplugRefused {
                device: format!("dimm{index}"),
                reason: format!("target memory not reachable in dimm-quanta of {size_mib} MiB"),
            });
        }
        plan.push((
            index,
            DimmSlot {
                bank,
                slot: in_bank,
                size_mib: take,
                numa_node: index % nodes,
            },
        ));
        remaining -= take;
        index += 1;
        in_bank += 1;
        if in_bank >= DIMM_SLOTS_PER_BANK {
            in_bank = 0;
            bank += 1;
            size_mib *= 2;
        }
    }
    Ok(plan)
}

/// Adds one DIMM: `object-add memory-backend-ram` then `device_add pc-dimm`
///.
pub async fn add_dimm(qmp: &Qmp<'_>, peer: &Peer, index: u32, slot: &DimmSlot) -> Result<()> {
    let memdev = slot.memdev_id(index);
    let dimm = slot.dimm_id(index);

    qmp.cmd(
        peer,
        "object-add",
        Some(json!({
            "qom-type": "memory-backend-ram",
            "id": memdev,
            "size": slot.size_mib * 1024 * 1024,
        })),
    )
    .await
    .map_err(|e| Error::HotplugRefused {
        device: dimm.clone(),
        reason: e.to_string(),
    })?;

    match qmp
        .cmd(
            peer,
            "device_add",
            Some(json!({ "driver": "pc-dimm", "id": dimm, "memdev": memdev, "node": slot.numa_node })),
        )
        .await
    {
        Ok(_) => {
            info!(dimm = %slot.dimm_id(index), mib = slot.size_mib, "memory dimm added");
            Ok(())
        }
        Err(e) => {
            warn!(dimm = %slot.dimm_id(index), "device_add rejected, rolling back memdev");
            let _ = qmp.cmd(peer, "object-del", Some(json!({ "id": memdev }))).await;
            Err(Error::HotplugRefused {
                device: dimm,
                reason: e.to_string(),
            })
        }
    }
}

/// Removes the highest-numbered DIMM first: `device_del`, confirm via
/// `query-memory-devices` with retries, then `object-del` the memdev.
pub async fn remove_dimm(qmp: &Qmp<'_>, peer: &Peer, index: u32, max_retries: u32) -> Result<()> {
    let dimm = format!("dimm{index}");
    let memdev = format!("mem-dimm{index}");

    qmp.cmd(peer, "device_del", Some(json!({ "id": dimm }))).await?;

    for attempt in 0..max_retries {
        let devices = qmp.cmd(peer, "query-memory-devices", None).await?;
        let still_present = devices
            .as_array()
            .map(|arr| {
                arr.iter().any(|d| {
                    d.get("data")
                        .and_then(|data| data.get("id"))
                        .and_then(|v| v.as_str())
                        == Some(dimm.as_str())
                })
            })
            .unwrap_or(false);
        if !still_present {
            qmp.cmd(peer, "object-del", Some(json!({ "id": memdev }))).await?;
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let _ = attempt;
    }
    Err(Error::Timeout(format!("device_del confirmation for {dimm}")))
}

/// Scales `cores` online by adding vCPU devices up to `maxcpus`. Downscale
/// is not supported, matching the source contract.
pub async fn add_vcpu(qmp: &Qmp<'_>, peer: &Peer, vcpu_id: u32, socket_id: u32, core_id: u32) -> Result<()> {
    qmp.cmd(
        peer,
        "device_add",
        Some(json!({
            "driver": "qemu64-x86_64-cpu",
            "id": format!("cpu{vcpu_id}"),
            "socket-id": socket_id,
            "core-id": core_id,
        })),
    )
    .await
    .map_err(|e| Error::HotplugRefused {
        device: format!("cpu{vcpu_id}"),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Number of hugepages needed per host NUMA node for a given page size to
/// satisfy `mib` MiB of guest memory.
pub fn hugepages_needed(mib: u64, page_size_kib: u64) -> u64 {
    (mib * 1024).div_ceil(page_size_kib)
}

/// Allocates hugepages across the host topology under the global hugepage
/// lock: any failure partway through rolls back the pages
/// already bumped on prior nodes.
pub fn allocate_hugepages(lock_path: &std::path::Path, plan: &[(u32, u64, u64)]) -> Result<()> {
    let _lock = crate::lockfile::FileLock::try_acquire(lock_path)?;
    let mut applied = Vec::new();
    for &(numa_node, page_size_kib, count) in plan {
        match bump_nr_hugepages(numa_node, page_size_kib, count) {
            Ok(previous) => applied.push((numa_node, page_size_kib, previous)),
            Err(e) => {
                for (node, size, previous) in applied.into_iter().rev() {
                    let _ = bump_nr_hugepages(node, size, previous);
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

fn sysfs_path(numa_node: u32, page_size_kib: u64) -> std::path::PathBuf {
    std::path::PathBuf::from(format!(
        "/sys/devices/system/node/node{numa_node}/hugepages/hugepages-{page_size_kib}kB/nr_hugepages"
    ))
}

fn bump_nr_hugepages(numa_node: u32, page_size_kib: u64, count: u64) -> Result<u64> {
    let path = sysfs_path(numa_node, page_size_kib);
    let previous: u64 = std::fs::read_to_string(&path)
        .unwrap_or_else(|_| "0".to_string())
        .trim()
        .parse()
        .unwrap_or(0);
    std::fs::write(&path, count.to_string())?;
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qmp::mock::MockTransport;

    #[test]
    fn max_mem_caps_at_four_tib() {
        assert_eq!(max_mem_mib(64), MAX_MEM_CAP_MIB);
        assert_eq!(max_mem_mib(42), 1u64 << (42 - 21));
    }

    #[test]
    fn plan_dimms_reaches_target_exactly() {
        let plan = plan_dimms(2048, 3072, 1, 0).unwrap();
        let total: u64 = plan.iter().map(|(_, s)| s.size_mib).sum();
        assert_eq!(total, 1024);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].1.size_mib, 512);
        assert_eq!(plan[1].1.size_mib, 512);
    }

    #[test]
    fn plan_dimms_empty_when_target_not_above_current() {
        assert!(plan_dimms(4096, 4096, 1, 0).unwrap().is_empty());
    }

    #[test]
    fn hugepages_needed_rounds_up() {
        assert_eq!(hugepages_needed(1025, 1024), 2);
        assert_eq!(hugepages_needed(1024, 1024), 1);
    }

    #[test]
    fn phys_bits_parses_cpuinfo_line() {
        let cpuinfo = "model name : x\naddress sizes : 46 bits physical, 48 bits virtual\n";
        assert_eq!(phys_bits_from_host_cpuinfo(cpuinfo), Some(46));
    }

    #[tokio::test]
    async fn add_dimm_rolls_back_memdev_on_device_add_failure() {
        let transport = MockTransport::default();
        transport
            .push_response(
                "device_add",
                Err(Error::HotplugRefused { device: "dimm0".into(), reason: "guest refused".into() }),
            )
            .await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");
        let slot = DimmSlot { bank: 0, slot: 0, size_mib: 512, numa_node: 0 };

        let result = add_dimm(&qmp, &peer, 0, &slot).await;
        assert!(result.is_err());
        let log = transport.call_log().await;
        assert!(log.iter().any(|(c, _)| c == "object-del"));
    }
}
