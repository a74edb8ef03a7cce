//! VM start/stop/reset/suspend/resume/shutdown/sendkey/destroy, QEMU
//! command-line construction, PID-file-based process tracking,
//! SIGTERM-then-SIGKILL escalation.
//!
//! The command line is built from an arbitrary drive set (`drive.rs`), and
//! graceful lifecycle transitions go over QMP (`qmp.rs`) first, falling
//! back to a SIGTERM/SIGKILL escalation for a hard stop.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::drive::{Drive, VolRef};
use crate::error::{Error, Result};
use crate::hotplug;
use crate::qmp::{Peer, Qmp};
use crate::settings::VmCoreSettings;
use crate::storage::StorageDriver;
use crate::version::{QemuVersion, BLOCKDEV_CMDLINE};
use crate::vmconfig::Section;

/// One `-drive`-bearing device slot, resolved to an on-disk path by the
/// caller's storage layer before the command line is built.
pub struct DriveArg {
    pub drive: Drive,
    pub resolved_path: String,
}

/// NUMA topology to wire into the command line: even split of
/// `memory_mib` across `nodes` `memory-backend-ram` objects, and the
/// `slots`/`maxmem` a later `hotplug::add_dimm` call needs room for.
pub struct NumaPlan {
    pub nodes: u32,
    pub slots: u32,
    pub max_mem_mib: u64,
}

/// Builds the full `qemu-system-x86_64` argument vector for a VM: core
/// machine flags, NUMA/memory-object wiring when a topology is given, one
/// `-drive` or `-blockdev` per configured drive depending on
/// `qemu_version`, `-incoming defer` for a migration target, a QMP control
/// socket, and `-daemonize`/`-pidfile` so the parent can exit immediately
/// while the child is tracked by PID file.
#[allow(clippy::too_many_arguments)]
pub fn build_qemu_args(
    settings: &VmCoreSettings,
    vmid: &str,
    cores: u32,
    memory_mib: u64,
    drives: &[DriveArg],
    qemu_version: QemuVersion,
    numa: Option<&NumaPlan>,
    incoming_defer: bool,
) -> Vec<String> {
    let mut args = vec![
        "-id".to_string(),
        vmid.to_string(),
        "-name".to_string(),
        format!("vm-{vmid}"),
        "-smp".to_string(),
        cores.to_string(),
        "-enable-kvm".to_string(),
        "-nographic".to_string(),
        "-daemonize".to_string(),
        "-pidfile".to_string(),
        settings.pid_file(vmid).display().to_string(),
        "-qmp".to_string(),
        format!("unix:{},server,nowait", settings.qmp_socket(vmid).display()),
        "-chardev".to_string(),
        format!(
            "socket,id=qga0,path={},server=on,wait=off",
            settings.qga_socket(vmid).display()
        ),
        "-device".to_string(),
        "virtio-serial".to_string(),
        "-device".to_string(),
        "virtserialport,chardev=qga0,name=org.qemu.guest_agent.0".to_string(),
    ];

    match numa {
        Some(plan) => {
            args.push("-m".to_string());
            args.push(format!("size={memory_mib}M,slots={},maxmem={}M", plan.slots, plan.max_mem_mib));
            let nodes = plan.nodes.max(1);
            let per_node = memory_mib / nodes as u64;
            for node in 0..nodes {
                let memdev = format!("ram-node{node}");
                args.push("-object".to_string());
                args.push(format!("memory-backend-ram,id={memdev},size={per_node}M"));
                args.push("-numa".to_string());
                args.push(format!("node,nodeid={node},memdev={memdev}"));
            }
        }
        None => {
            args.push("-m".to_string());
            args.push(memory_mib.to_string());
        }
    }

    if incoming_defer {
        args.push("-incoming".to_string());
        args.push("defer".to_string());
    }

    let use_blockdev = BLOCKDEV_CMDLINE.satisfied_by(qemu_version);

    for (i, d) in drives.iter().enumerate() {
        if matches!(d.drive.file, VolRef::None) {
            continue;
        }
        let node = format!("drive-{}{}", d.drive.interface.as_str(), d.drive.index);
        if use_blockdev {
            let mut spec = format!("driver=file,node-name={node},filename={}", d.resolved_path);
            if d.drive.effective_read_only(None) {
                spec.push_str(",read-only=on");
            }
            args.push("-blockdev".to_string());
            args.push(spec);
        } else {
            let mut spec = format!("file={}", d.resolved_path);
            if let Some(fmt) = &d.drive.format {
                spec.push_str(&format!(",format={fmt}"));
            }
            spec.push_str(&format!(",if=none,id={node}"));
            if d.drive.effective_read_only(None) {
                spec.push_str(",readonly=on");
            }
            args.push("-drive".to_string());
            args.push(spec);
        }
        args.push("-device".to_string());
        args.push(format!("{},drive={node},id=virtio-disk{i}", virtio_device_for(&d.drive.interface)));
    }

    args
}

fn virtio_device_for(interface: &crate::drive::Interface) -> &'static str {
    match interface {
        crate::drive::Interface::Virtio => "virtio-blk-pci",
        crate::drive::Interface::Scsi => "scsi-hd",
        crate::drive::Interface::Sata | crate::drive::Interface::Ide => "ide-hd",
        crate::drive::Interface::Efidisk => "virtio-blk-pci",
        crate::drive::Interface::TpmState => "virtio-blk-pci",
    }
}

/// Reads the pid file and checks the process is alive via `kill(pid, 0)`.
pub fn is_running(settings: &VmCoreSettings, vmid: &str) -> bool {
    read_pid(settings, vmid).map(|pid| kill(pid, None).is_ok()).unwrap_or(false)
}

fn read_pid(settings: &VmCoreSettings, vmid: &str) -> Option<Pid> {
    let text = std::fs::read_to_string(settings.pid_file(vmid)).ok()?;
    let raw: i32 = text.trim().parse().ok()?;
    Some(Pid::from_raw(raw))
}

/// Starts QEMU as a daemonized child. `-pidfile` plus `-daemonize` means
/// QEMU itself forks and writes the pid file only once the monitor socket
/// is ready, so success here guarantees the QMP socket is dialable
/// immediately after.
pub async fn start(settings: &VmCoreSettings, vmid: &str, args: &[String]) -> Result<()> {
    if is_running(settings, vmid) {
        return Err(Error::InvalidConfig(format!("VM {vmid} is already running")));
    }
    std::fs::create_dir_all(&settings.run_dir)?;

    let mut cmd = Command::new(&settings.qemu_binary);
    cmd.args(args).stdout(Stdio::null()).stderr(Stdio::null());
    debug!(vmid, ?cmd, "launching qemu");

    let status = cmd.status().await?;
    if !status.success() {
        return Err(Error::InvalidConfig(format!("qemu exited with {status} while starting VM {vmid}")));
    }
    info!(vmid, "VM started");
    Ok(())
}

/// Graceful ACPI shutdown request; does not wait for the guest to
/// actually power off.
pub async fn shutdown(qmp: &Qmp<'_>, peer: &Peer) -> Result<()> {
    qmp.cmd(peer, "system_powerdown", None).await?;
    Ok(())
}

/// Cold reset: equivalent to power cycling the virtual hardware.
pub async fn reset(qmp: &Qmp<'_>, peer: &Peer) -> Result<()> {
    qmp.cmd(peer, "system_reset", None).await?;
    Ok(())
}

/// Pauses all vCPUs without tearing down device state.
pub async fn suspend(qmp: &Qmp<'_>, peer: &Peer) -> Result<()> {
    qmp.cmd(peer, "stop", None).await?;
    Ok(())
}

/// Resumes vCPUs paused by `suspend` or a completed migration/snapshot
/// load.
pub async fn resume(qmp: &Qmp<'_>, peer: &Peer) -> Result<()> {
    qmp.cmd(peer, "cont", None).await?;
    Ok(())
}

/// Tells a QEMU process started with `-incoming defer` which URI to listen
/// for the migration stream on. Issued by the target-node counterpart once
/// the process is up but before the source calls `migrate`.
pub async fn start_incoming(qmp: &Qmp<'_>, peer: &Peer, uri: &str) -> Result<()> {
    qmp.cmd(peer, "migrate-incoming", Some(serde_json::json!({ "uri": uri }))).await?;
    Ok(())
}

/// Suspends the VM to disk: stops vCPUs, writes full machine state to an
/// allocated volume via the same `savevm-start`/`query-savevm` poll a
/// snapshot's vmstate save uses, then tears the process down. The config
/// section's `lock` is set to `suspending` before anything else happens and
/// is only advanced to `suspended` on full success — a failure partway
/// through leaves it at `suspending` rather than clearing it, since the VM
/// is no longer in a state any other operation can safely assume, but the
/// partial state volume is freed and the `vmstate`/`runningmachine`/
/// `runningcpu` fields are stripped back out so a retry starts clean.
pub async fn suspend_to_disk(
    qmp: &Qmp<'_>,
    peer: &Peer,
    storage: &dyn StorageDriver,
    storeid: &str,
    vmid: &str,
    section: &mut Section,
    settings: &VmCoreSettings,
) -> Result<()> {
    section.set("lock", "suspending");
    qmp.cmd(peer, "stop", None).await?;

    let machine = qmp
        .cmd(peer, "query-machines", None)
        .await
        .ok()
        .and_then(|v| v.as_array().and_then(|a| a.first().cloned()))
        .and_then(|m| m.get("name").and_then(|n| n.as_str()).map(str::to_string))
        .unwrap_or_else(|| "pc".to_string());

    match crate::snapshot::save_vmstate(qmp, peer, storage, storeid, vmid, section, &machine).await {
        Ok(()) => {
            quit_or_kill(qmp, peer, settings, vmid).await?;
            section.set("lock", "suspended");
            Ok(())
        }
        Err(e) => {
            section.remove("vmstate");
            section.remove("runningmachine");
            section.remove("runningcpu");
            Err(e)
        }
    }
}

/// Grows memory from `current_mib` to `target_mib` by planning and adding
/// the DIMMs `hotplug::plan_dimms` lays out. A no-op if `target_mib` is not
/// above `current_mib`.
pub async fn update_memory(
    qmp: &Qmp<'_>,
    peer: &Peer,
    current_mib: u64,
    target_mib: u64,
    numa_nodes: u32,
    first_dimm_index: u32,
) -> Result<()> {
    let plan = hotplug::plan_dimms(current_mib, target_mib, numa_nodes, first_dimm_index)?;
    for (index, slot) in plan {
        hotplug::add_dimm(qmp, peer, index, &slot).await?;
    }
    Ok(())
}

/// Scales vCPUs from `current` to `target` online, one `device_add` per new
/// core spread flat across a single socket. Downscale is refused, matching
/// `hotplug::add_vcpu`'s own contract.
pub async fn update_vcpus(qmp: &Qmp<'_>, peer: &Peer, current: u32, target: u32) -> Result<()> {
    if target < current {
        return Err(Error::HotplugRefused {
            device: "cpu".to_string(),
            reason: "vCPU downscale is not supported".to_string(),
        });
    }
    for vcpu_id in current..target {
        hotplug::add_vcpu(qmp, peer, vcpu_id, 0, vcpu_id).await?;
    }
    Ok(())
}

/// Forwards a key combination to the guest via the HMP `sendkey` passthrough.
pub async fn sendkey(qmp: &Qmp<'_>, peer: &Peer, keys: &str) -> Result<()> {
    qmp.human_monitor_command(peer, &format!("sendkey {keys}")).await?;
    Ok(())
}

/// QMP `quit` first (lets QEMU flush disk state cleanly), falling back to
/// SIGTERM then SIGKILL if the process outlives a grace period. Shared by
/// `destroy` (hard stop) and `suspend_to_disk` (teardown after state save).
async fn quit_or_kill(qmp: &Qmp<'_>, peer: &Peer, settings: &VmCoreSettings, vmid: &str) -> Result<()> {
    let quit_failed = qmp.cmd_timeout(peer, "quit", None, Duration::from_secs(5)).await.is_err();
    if quit_failed {
        warn!(vmid, "qmp quit failed or timed out, escalating to signals");
        terminate_by_pid(settings, vmid).await?;
    } else if wait_for_exit(settings, vmid, Duration::from_secs(10)).await.is_err() {
        terminate_by_pid(settings, vmid).await?;
    }
    Ok(())
}

/// Hard stop: `quit_or_kill` then clears the PID/socket files this VM owns.
pub async fn destroy(qmp: &Qmp<'_>, peer: &Peer, settings: &VmCoreSettings, vmid: &str) -> Result<()> {
    quit_or_kill(qmp, peer, settings, vmid).await?;
    let _ = std::fs::remove_file(settings.pid_file(vmid));
    let _ = std::fs::remove_file(settings.qmp_socket(vmid));
    let _ = std::fs::remove_file(settings.qga_socket(vmid));
    info!(vmid, "VM destroyed");
    Ok(())
}

async fn wait_for_exit(settings: &VmCoreSettings, vmid: &str, budget: Duration) -> Result<()> {
    let step = Duration::from_millis(200);
    let mut waited = Duration::ZERO;
    while waited < budget {
        if !is_running(settings, vmid) {
            return Ok(());
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    Err(Error::Timeout(format!("VM {vmid} did not exit")))
}

/// SIGTERM, then SIGKILL after a grace period, for the case where QMP
/// `system_powerdown`/`quit` either isn't available or the guest never
/// responds to it.
async fn terminate_by_pid(settings: &VmCoreSettings, vmid: &str) -> Result<()> {
    let pid = read_pid(settings, vmid).ok_or_else(|| Error::NotRunning(vmid.to_string()))?;
    kill(pid, Signal::SIGTERM).map_err(|e| Error::InvalidConfig(format!("SIGTERM failed: {e}")))?;

    let step = Duration::from_millis(200);
    let mut waited = Duration::ZERO;
    while waited < Duration::from_secs(5) {
        if kill(pid, None).is_err() {
            return Ok(());
        }
        tokio::time::sleep(step).await;
        waited += step;
    }

    warn!(vmid, "process survived SIGTERM grace period, sending SIGKILL");
    kill(pid, Signal::SIGKILL).map_err(|e| Error::InvalidConfig(format!("SIGKILL failed: {e}")))?;
    Ok(())
}

/// Status snapshot combining process liveness with the QMP-reported guest
/// run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
    Paused,
}

pub async fn query_run_state(qmp: &Qmp<'_>, peer: &Peer, settings: &VmCoreSettings, vmid: &str) -> RunState {
    if !is_running(settings, vmid) {
        return RunState::Stopped;
    }
    match qmp.cmd(peer, "query-status", None).await {
        Ok(v) => match v.get("status").and_then(|s| s.as_str()) {
            Some("running") => RunState::Running,
            Some("paused") | Some("suspended") => RunState::Paused,
            _ => RunState::Running,
        },
        Err(_) => RunState::Running,
    }
}

/// `query-status` equivalent that also reports the current throttle
/// device listing, used to reconcile runtime state with persisted config
/// after an unexpected restart.
pub async fn query_block_devices(qmp: &Qmp<'_>, peer: &Peer) -> Result<serde_json::Value> {
    qmp.cmd(peer, "query-block", None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{parse_drive, Interface};
    use crate::qmp::mock::MockTransport;
    use serde_json::json;

    #[test]
    fn build_args_includes_core_flags_and_drives() {
        let settings = VmCoreSettings::default();
        let drive = parse_drive(Interface::Scsi, 0, "local-lvm:vm-100-disk-0,format=raw").unwrap();
        let drives = vec![DriveArg { drive, resolved_path: "/dev/local-lvm/vm-100-disk-0".to_string() }];
        let args = build_qemu_args(&settings, "100", 2, 2048, &drives, QemuVersion::new(8, 2), None, false);
        assert!(args.contains(&"-enable-kvm".to_string()));
        assert!(args.iter().any(|a| a.contains("file=/dev/local-lvm/vm-100-disk-0")));
        assert!(args.iter().any(|a| a == "scsi-hd"));
    }

    #[test]
    fn skips_empty_drive_slots() {
        let settings = VmCoreSettings::default();
        let drive = parse_drive(Interface::Ide, 2, "none,media=cdrom").unwrap();
        let drives = vec![DriveArg { drive, resolved_path: String::new() }];
        let args = build_qemu_args(&settings, "100", 1, 512, &drives, QemuVersion::new(8, 2), None, false);
        assert!(!args.iter().any(|a| a.starts_with("file=")));
    }

    #[tokio::test]
    async fn shutdown_sends_system_powerdown() {
        let transport = MockTransport::default();
        transport.push_response("system_powerdown", Ok(json!(null))).await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");
        shutdown(&qmp, &peer).await.unwrap();
        let log = transport.call_log().await;
        assert_eq!(log[0].0, "system_powerdown");
    }

    #[tokio::test]
    async fn sendkey_passes_through_human_monitor_command() {
        let transport = MockTransport::default();
        transport
            .push_response("human-monitor-command", Ok(json!("")))
            .await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");
        sendkey(&qmp, &peer, "ctrl-alt-delete").await.unwrap();
        let log = transport.call_log().await;
        assert_eq!(log[0].1.as_ref().unwrap()["command-line"], json!("sendkey ctrl-alt-delete"));
    }

    #[test]
    fn is_running_false_without_pid_file() {
        let mut settings = VmCoreSettings::default();
        let dir = tempfile::tempdir().unwrap();
        settings.run_dir = dir.path().to_path_buf();
        assert!(!is_running(&settings, "999"));
    }

    #[test]
    fn build_args_uses_blockdev_on_recent_qemu() {
        let settings = VmCoreSettings::default();
        let drive = parse_drive(Interface::Scsi, 0, "local-lvm:vm-100-disk-0,format=raw").unwrap();
        let drives = vec![DriveArg { drive, resolved_path: "/dev/local-lvm/vm-100-disk-0".to_string() }];
        let args = build_qemu_args(&settings, "100", 2, 2048, &drives, QemuVersion::new(10, 0), None, false);
        assert!(args.iter().any(|a| a.contains("driver=file,node-name=")));
        assert!(!args.iter().any(|a| a.starts_with("file=")));
    }

    #[test]
    fn build_args_wires_numa_memory_backends() {
        let settings = VmCoreSettings::default();
        let numa = NumaPlan { nodes: 2, slots: 4, max_mem_mib: 8192 };
        let args = build_qemu_args(&settings, "100", 2, 4096, &[], QemuVersion::new(8, 2), Some(&numa), false);
        assert!(args.iter().any(|a| a == "memory-backend-ram,id=ram-node0,size=2048M"));
        assert!(args.iter().any(|a| a == "node,nodeid=1,memdev=ram-node1"));
    }

    #[test]
    fn build_args_sets_incoming_defer() {
        let settings = VmCoreSettings::default();
        let args = build_qemu_args(&settings, "100", 1, 512, &[], QemuVersion::new(8, 2), None, true);
        assert!(args.windows(2).any(|w| w == ["-incoming".to_string(), "defer".to_string()]));
    }

    #[tokio::test]
    async fn update_memory_adds_planned_dimms() {
        let transport = MockTransport::default();
        transport.push_response("object-add", Ok(json!(null))).await;
        transport.push_response("device_add", Ok(json!(null))).await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");

        update_memory(&qmp, &peer, 2048, 2560, 1, 0).await.unwrap();
        let log = transport.call_log().await;
        assert!(log.iter().any(|(c, _)| c == "object-add"));
        assert!(log.iter().any(|(c, _)| c == "device_add"));
    }

    #[tokio::test]
    async fn update_vcpus_refuses_downscale() {
        let transport = MockTransport::default();
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");
        let result = update_vcpus(&qmp, &peer, 4, 2).await;
        assert!(matches!(result, Err(Error::HotplugRefused { .. })));
    }

    #[tokio::test]
    async fn update_vcpus_adds_one_device_per_new_core() {
        let transport = MockTransport::default();
        transport.push_response("device_add", Ok(json!(null))).await;
        transport.push_response("device_add", Ok(json!(null))).await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");
        update_vcpus(&qmp, &peer, 2, 4).await.unwrap();
        let log = transport.call_log().await;
        assert_eq!(log.iter().filter(|(c, _)| c == "device_add").count(), 2);
    }

    #[tokio::test]
    async fn start_incoming_sends_migrate_incoming_with_uri() {
        let transport = MockTransport::default();
        transport.push_response("migrate-incoming", Ok(json!(null))).await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");
        start_incoming(&qmp, &peer, "tcp:0:4444").await.unwrap();
        let log = transport.call_log().await;
        assert_eq!(log[0].1.as_ref().unwrap()["uri"], json!("tcp:0:4444"));
    }

    #[tokio::test]
    async fn suspend_to_disk_leaves_lock_set_on_failure_and_strips_partial_state() {
        use crate::storage::directory::DirectoryDriver;

        let storage = DirectoryDriver::new("/tmp/does-not-exist-horcrux-test");
        let transport = MockTransport::default();
        transport.push_response("stop", Ok(json!(null))).await;
        transport.push_response("query-machines", Ok(json!([{"name": "pc-q35-8.2"}]))).await;
        transport.push_response("savevm-start", Err(Error::Timeout("qmp closed".to_string()))).await;
        let qmp = Qmp::new(&transport);
        let peer = Peer::qmp("100");
        let settings = VmCoreSettings::default();
        let mut section = Section::default();

        let result =
            suspend_to_disk(&qmp, &peer, &storage, "local-dir", "100", &mut section, &settings).await;

        assert!(result.is_err());
        assert_eq!(section.lock(), Some(crate::vmconfig::Lock::Suspending));
        assert!(section.get("vmstate").is_none());
        assert!(section.get("runningmachine").is_none());
    }
}
