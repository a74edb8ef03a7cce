//! Parses and prints the drive property string format used in the persisted
//! VM configuration, and classifies drives by interface into a tagged enum
//! dispatched on at attach time rather than matched ad hoc at every call site.
//!
//! Grounded in `horcrux-api::vm::qemu::QemuVm` for the shape of a
//! drive-as-config-value (that struct only ever carries one fixed
//! `file=...,format=qcow2` drive; this module generalizes it into the full
//! key=value grammar) and in `horcrux-api::config`'s pattern of small,
//! independently-validated value types.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    Scsi,
    Sata,
    Ide,
    Virtio,
    Efidisk,
    TpmState,
}

impl Interface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interface::Scsi => "scsi",
            Interface::Sata => "sata",
            Interface::Ide => "ide",
            Interface::Virtio => "virtio",
            Interface::Efidisk => "efidisk",
            Interface::TpmState => "tpmstate",
        }
    }

    pub fn max_index(&self) -> u32 {
        match self {
            Interface::Scsi => 256,
            Interface::Sata => 5,
            Interface::Ide => 3,
            Interface::Virtio => 15,
            Interface::Efidisk | Interface::TpmState => 0,
        }
    }
}

/// Tag distinguishing drive flavors that behave differently in command-line
/// generation, read-only policy, and size override on mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveRole {
    Hd,
    Cdrom,
    Efidisk,
    TpmState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    None,
    WriteThrough,
    WriteBack,
    DirectSync,
    Unsafe,
}

impl CacheMode {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "none" => CacheMode::None,
            "writethrough" => CacheMode::WriteThrough,
            "writeback" => CacheMode::WriteBack,
            "directsync" => CacheMode::DirectSync,
            "unsafe" => CacheMode::Unsafe,
            _ => return None,
        })
    }

    fn as_str(&self) -> &'static str {
        match self {
            CacheMode::None => "none",
            CacheMode::WriteThrough => "writethrough",
            CacheMode::WriteBack => "writeback",
            CacheMode::DirectSync => "directsync",
            CacheMode::Unsafe => "unsafe",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioMode {
    IoUring,
    Native,
    Threads,
}

impl AioMode {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "io_uring" => AioMode::IoUring,
            "native" => AioMode::Native,
            "threads" => AioMode::Threads,
            _ => return None,
        })
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            AioMode::IoUring => "io_uring",
            AioMode::Native => "native",
            AioMode::Threads => "threads",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    On,
    Ignore,
}

/// File-node `discard` setting derived from the drive's `discard` option
///.
impl Discard {
    pub fn node_discard(&self) -> &'static str {
        match self {
            Discard::On => "unmap",
            Discard::Ignore => "ignore",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BandwidthLimits {
    pub mbps: Option<f64>,
    pub mbps_rd: Option<f64>,
    pub mbps_wr: Option<f64>,
    pub mbps_max: Option<f64>,
    pub mbps_rd_max: Option<f64>,
    pub mbps_wr_max: Option<f64>,
    pub iops: Option<u64>,
    pub iops_rd: Option<u64>,
    pub iops_wr: Option<u64>,
    pub iops_max: Option<u64>,
    pub iops_rd_max: Option<u64>,
    pub iops_wr_max: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum VolRef {
    Volume { storeid: String, name: String },
    Path(String),
    Cdrom,
    None,
}

impl fmt::Display for VolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolRef::Volume { storeid, name } => write!(f, "{storeid}:{name}"),
            VolRef::Path(p) => write!(f, "{p}"),
            VolRef::Cdrom => write!(f, "cdrom"),
            VolRef::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Drive {
    pub interface: Interface,
    pub index: u32,
    pub file: VolRef,
    pub format: Option<String>,
    pub media: Media,
    pub cache: CacheMode,
    pub aio: Option<AioMode>,
    pub discard: Discard,
    pub detect_zeroes: Option<String>,
    pub ssd: bool,
    pub ro: bool,
    pub iothread: bool,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub bandwidth: BandwidthLimits,
    pub size: Option<u64>,
}

impl Drive {
    pub fn role(&self) -> DriveRole {
        match (self.interface, self.media) {
            (Interface::Efidisk, _) => DriveRole::Efidisk,
            (Interface::TpmState, _) => DriveRole::TpmState,
            (_, Media::Cdrom) => DriveRole::Cdrom,
            _ => DriveRole::Hd,
        }
    }

    /// A drive is read-only from the guest's view iff `ro=on`, it's a
    /// cdrom, or the caller passed an explicit override. This
    /// value drives the `read-only` flag on every blockdev node in the
    /// chain built for this drive.
    pub fn effective_read_only(&self, override_ro: Option<bool>) -> bool {
        if let Some(o) = override_ro {
            return o;
        }
        self.ro || self.role() == DriveRole::Cdrom
    }

    /// `(bus, index)` key used to check uniqueness within a config section
    /// and to derive the option key, e.g. `scsi0`.
    pub fn bus_index_key(&self) -> String {
        format!("{}{}", self.interface.as_str(), self.index)
    }

    pub fn is_cdrom(file: &VolRef, media: Option<Media>, format: Option<&str>) -> bool {
        matches!(media, Some(Media::Cdrom))
            || matches!(file, VolRef::Cdrom)
            || format == Some("iso")
    }
}

/// Parses the option-key portion (`key=value` pairs after the vol ref) of a
/// drive string into a map, preserving unknown keys verbatim per the
/// persisted-config contract.
fn parse_options(rest: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for pair in rest.split(',').filter(|s| !s.is_empty()) {
        if let Some((k, v)) = pair.split_once('=') {
            map.insert(k.to_string(), v.to_string());
        } else {
            map.insert(pair.to_string(), "on".to_string());
        }
    }
    map
}

fn parse_bool(v: &str) -> bool {
    matches!(v, "1" | "on" | "true" | "yes")
}

/// Parses a drive property string, e.g.
/// `local-lvm:vm-100-disk-0,format=raw,cache=writeback,ssd=1`.
pub fn parse_drive(interface: Interface, index: u32, value: &str) -> Result<Drive> {
    let (vol_part, rest) = match value.split_once(',') {
        Some((v, r)) => (v, r),
        None => (value, ""),
    };
    let opts = parse_options(rest);

    let file = if vol_part == "cdrom" {
        VolRef::Cdrom
    } else if vol_part == "none" {
        VolRef::None
    } else if let Some((storeid, name)) = vol_part.split_once(':') {
        if vol_part.starts_with('/') {
            VolRef::Path(vol_part.to_string())
        } else {
            VolRef::Volume {
                storeid: storeid.to_string(),
                name: name.to_string(),
            }
        }
    } else if vol_part.starts_with('/') {
        VolRef::Path(vol_part.to_string())
    } else {
        return Err(Error::InvalidDrive(format!("unparseable volume reference: {vol_part}")));
    };

    let media = match opts.get("media").map(String::as_str) {
        Some("cdrom") => Media::Cdrom,
        Some("disk") => Media::Disk,
        Some(other) => {
            return Err(Error::InvalidDrive(format!("invalid media value: {other}")))
        }
        None if Drive::is_cdrom(&file, None, opts.get("format").map(String::as_str)) => Media::Cdrom,
        None => Media::Disk,
    };

    let cache = opts
        .get("cache")
        .map(|v| CacheMode::parse(v).ok_or_else(|| Error::InvalidDrive(format!("invalid cache: {v}"))))
        .transpose()?
        .unwrap_or(CacheMode::None);

    let aio = opts
        .get("aio")
        .map(|v| AioMode::parse(v).ok_or_else(|| Error::InvalidDrive(format!("invalid aio: {v}"))))
        .transpose()?;

    let discard = match opts.get("discard").map(String::as_str) {
        Some("on") => Discard::On,
        _ => Discard::Ignore,
    };

    if index >= interface.max_index() && interface.max_index() > 0 {
        return Err(Error::InvalidDrive(format!(
            "index {index} out of range for interface {:?}",
            interface
        )));
    }

    Ok(Drive {
        interface,
        index,
        file,
        format: opts.get("format").cloned(),
        media,
        cache,
        aio,
        discard,
        detect_zeroes: opts.get("detect-zeroes").cloned(),
        ssd: opts.get("ssd").map(|v| parse_bool(v)).unwrap_or(false),
        ro: opts.get("ro").map(|v| parse_bool(v)).unwrap_or(false),
        iothread: opts.get("iothread").map(|v| parse_bool(v)).unwrap_or(false),
        serial: opts.get("serial").cloned(),
        model: opts.get("model").cloned(),
        bandwidth: BandwidthLimits {
            mbps: opts.get("mbps").and_then(|v| v.parse().ok()),
            mbps_rd: opts.get("mbps_rd").and_then(|v| v.parse().ok()),
            mbps_wr: opts.get("mbps_wr").and_then(|v| v.parse().ok()),
            mbps_max: opts.get("mbps_max").and_then(|v| v.parse().ok()),
            mbps_rd_max: opts.get("mbps_rd_max").and_then(|v| v.parse().ok()),
            mbps_wr_max: opts.get("mbps_wr_max").and_then(|v| v.parse().ok()),
            iops: opts.get("iops").and_then(|v| v.parse().ok()),
            iops_rd: opts.get("iops_rd").and_then(|v| v.parse().ok()),
            iops_wr: opts.get("iops_wr").and_then(|v| v.parse().ok()),
            iops_max: opts.get("iops_max").and_then(|v| v.parse().ok()),
            iops_rd_max: opts.get("iops_rd_max").and_then(|v| v.parse().ok()),
            iops_wr_max: opts.get("iops_wr_max").and_then(|v| v.parse().ok()),
        },
        size: opts.get("size").and_then(|v| parse_size_suffix(v)),
    })
}

fn parse_size_suffix(v: &str) -> Option<u64> {
    if let Some(n) = v.strip_suffix('G') {
        n.parse::<u64>().ok().map(|n| n * 1024 * 1024 * 1024)
    } else if let Some(n) = v.strip_suffix('M') {
        n.parse::<u64>().ok().map(|n| n * 1024 * 1024)
    } else if let Some(n) = v.strip_suffix('K') {
        n.parse::<u64>().ok().map(|n| n * 1024)
    } else {
        v.parse().ok()
    }
}

/// Prints a drive back to its persisted string form, deterministically
/// (sorted keys, normalized booleans and numbers) so that
/// `parse_drive(print_drive(d))` round-trips on semantic fields.
pub fn print_drive(drive: &Drive) -> String {
    let mut out = drive.file.to_string();
    let mut opts: Vec<(String, String)> = Vec::new();

    if let Some(fmt) = &drive.format {
        opts.push(("format".to_string(), fmt.clone()));
    }
    if drive.media == Media::Cdrom {
        opts.push(("media".to_string(), "cdrom".to_string()));
    }
    if drive.cache != CacheMode::None {
        opts.push(("cache".to_string(), drive.cache.as_str().to_string()));
    }
    if let Some(aio) = drive.aio {
        opts.push(("aio".to_string(), aio.as_str().to_string()));
    }
    if drive.discard == Discard::On {
        opts.push(("discard".to_string(), "on".to_string()));
    }
    if let Some(dz) = &drive.detect_zeroes {
        opts.push(("detect-zeroes".to_string(), dz.clone()));
    }
    if drive.ssd {
        opts.push(("ssd".to_string(), "1".to_string()));
    }
    if drive.ro {
        opts.push(("ro".to_string(), "1".to_string()));
    }
    if drive.iothread {
        opts.push(("iothread".to_string(), "1".to_string()));
    }
    if let Some(serial) = &drive.serial {
        opts.push(("serial".to_string(), serial.clone()));
    }
    if let Some(model) = &drive.model {
        opts.push(("model".to_string(), model.clone()));
    }
    if let Some(size) = drive.size {
        opts.push(("size".to_string(), size.to_string()));
    }

    opts.sort_by(|a, b| a.0.cmp(&b.0));
    for (k, v) in opts {
        out.push(',');
        out.push_str(&k);
        out.push('=');
        out.push_str(&v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_volume_reference_with_options() {
        let drive = parse_drive(Interface::Scsi, 0, "local-lvm:vm-100-disk-0,cache=writeback,ssd=1").unwrap();
        assert!(matches!(drive.file, VolRef::Volume { ref storeid, ref name } if storeid == "local-lvm" && name == "vm-100-disk-0"));
        assert_eq!(drive.cache, CacheMode::WriteBack);
        assert!(drive.ssd);
        assert_eq!(drive.role(), DriveRole::Hd);
    }

    #[test]
    fn detects_cdrom_from_media_flag() {
        let drive = parse_drive(Interface::Ide, 2, "cdrom,media=cdrom").unwrap();
        assert_eq!(drive.role(), DriveRole::Cdrom);
        assert!(drive.effective_read_only(None));
    }

    #[test]
    fn discard_maps_to_unmap_node_setting() {
        let drive = parse_drive(Interface::Scsi, 0, "local-lvm:vm-100-disk-0,discard=on").unwrap();
        assert_eq!(drive.discard.node_discard(), "unmap");
        let drive = parse_drive(Interface::Scsi, 1, "local-lvm:vm-100-disk-1").unwrap();
        assert_eq!(drive.discard.node_discard(), "ignore");
    }

    #[test]
    fn rejects_index_out_of_range() {
        assert!(parse_drive(Interface::Sata, 6, "local:vm-100-disk-0").is_err());
    }

    #[test]
    fn print_drive_round_trips_semantic_fields() {
        let original = parse_drive(
            Interface::Scsi,
            0,
            "local-lvm:vm-100-disk-0,cache=writeback,discard=on,ssd=1,iothread=1",
        )
        .unwrap();
        let printed = print_drive(&original);
        let reparsed = parse_drive(Interface::Scsi, 0, &printed).unwrap();
        assert_eq!(reparsed.cache, original.cache);
        assert_eq!(reparsed.discard, original.discard);
        assert_eq!(reparsed.ssd, original.ssd);
        assert_eq!(reparsed.iothread, original.iothread);
    }

    #[test]
    fn size_suffix_parses_to_bytes() {
        let drive = parse_drive(Interface::Scsi, 0, "dir:100/vm-100-disk-0.raw,size=128K").unwrap();
        assert_eq!(drive.size, Some(128 * 1024));
    }
}
