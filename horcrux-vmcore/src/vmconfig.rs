//! The durable, sectioned VM configuration: load, write, digest-guarded
//! update, sectioned snapshots, cooperative file lock, `check_lock`.
//!
//! Parses a sectioned INI-like grammar rather than TOML, since the format
//! must stay line-diffable and round-trip unknown keys verbatim; the lock
//! itself is `lockfile::FileLock`.

use std::collections::BTreeMap;
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::lockfile::FileLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lock {
    Backup,
    Migrate,
    Snapshot,
    Suspending,
    Suspended,
    Clone,
    Rollback,
    Create,
    Destroyed,
}

impl Lock {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lock::Backup => "backup",
            Lock::Migrate => "migrate",
            Lock::Snapshot => "snapshot",
            Lock::Suspending => "suspending",
            Lock::Suspended => "suspended",
            Lock::Clone => "clone",
            Lock::Rollback => "rollback",
            Lock::Create => "create",
            Lock::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "backup" => Lock::Backup,
            "migrate" => Lock::Migrate,
            "snapshot" => Lock::Snapshot,
            "suspending" => Lock::Suspending,
            "suspended" => Lock::Suspended,
            "clone" => Lock::Clone,
            "rollback" => Lock::Rollback,
            "create" => Lock::Create,
            "destroyed" => Lock::Destroyed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapState {
    Prepare,
    Delete,
}

/// A single section: the "current" config or a named snapshot, a plain
/// key/value map. Unknown keys round-trip verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub fields: BTreeMap<String, String>,
}

impl Section {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.fields.remove(key)
    }

    pub fn lock(&self) -> Option<Lock> {
        self.get("lock").and_then(Lock::parse)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VmConfigFile {
    pub current: Section,
    /// Ordered: snapshots keep creation order, a section named "current" is
    /// forbidden among them.
    pub snapshots: Vec<(String, Section)>,
}

impl VmConfigFile {
    pub fn snapshot(&self, name: &str) -> Option<&Section> {
        self.snapshots.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn snapshot_mut(&mut self, name: &str) -> Option<&mut Section> {
        self.snapshots.iter_mut().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn remove_snapshot(&mut self, name: &str) -> Option<Section> {
        let idx = self.snapshots.iter().position(|(n, _)| n == name)?;
        Some(self.snapshots.remove(idx).1)
    }

    /// `digest: <hex sha1>` over the serialized current section.
    pub fn digest(&self) -> String {
        let serialized = serialize_section(&self.current);
        let mut hasher = Sha1::new();
        hasher.update(serialized.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn serialize_section(section: &Section) -> String {
    let mut out = String::new();
    for (k, v) in &section.fields {
        if k == "digest" {
            continue;
        }
        out.push_str(k);
        out.push_str(": ");
        out.push_str(v);
        out.push('\n');
    }
    out
}

/// Serializes the full config file: current section first, then
/// `[snapshotName]` sections in order.
pub fn write_string(cfg: &VmConfigFile) -> String {
    let mut out = serialize_section(&cfg.current);
    out.push_str("digest: ");
    out.push_str(&cfg.digest());
    out.push('\n');
    for (name, section) in &cfg.snapshots {
        out.push('\n');
        out.push('[');
        out.push_str(name);
        out.push_str("]\n");
        out.push_str(&serialize_section(section));
    }
    out
}

/// Parses the sectioned INI-like text format: `key: value` lines,
/// `[snapshotName]` headers starting subsequent sections.
pub fn parse_string(text: &str) -> Result<VmConfigFile> {
    let mut cfg = VmConfigFile::default();
    let mut current_section: Option<(String, Section)> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if header == "current" {
                return Err(Error::InvalidConfig("a snapshot section named 'current' is forbidden".to_string()));
            }
            if let Some((name, section)) = current_section.take() {
                cfg.snapshots.push((name, section));
            }
            current_section = Some((header.to_string(), Section::default()));
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidConfig(format!("malformed config line: {line}")))?;
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        match &mut current_section {
            Some((_, section)) => section.set(key, value),
            None => cfg.current.set(key, value),
        }
    }
    if let Some((name, section)) = current_section {
        cfg.snapshots.push((name, section));
    }
    Ok(cfg)
}

/// `lock_config(vmid, fn)`: acquires the cooperative file lock, runs `fn`,
/// guarantees release. The lock is held for the caller's full
/// critical section, not just the final write.
pub fn lock_config<F, T>(path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let _guard = FileLock::acquire_blocking(path)?;
    f()
}

/// `load_config(vmid)`: parses the file and computes `digest`.
pub fn load_config(path: &Path) -> Result<VmConfigFile> {
    let text = std::fs::read_to_string(path)?;
    let mut cfg = parse_string(&text)?;
    let digest = cfg.digest();
    cfg.current.set("digest", digest);
    Ok(cfg)
}

/// `write_config(vmid, cfg)`: serializes, atomic via rename. If `expected_digest`
/// is supplied and doesn't match the freshly-recomputed digest of the
/// pre-write file, aborts with a digest mismatch.
pub fn write_config(path: &Path, cfg: &VmConfigFile, expected_digest: Option<&str>) -> Result<()> {
    if let Some(expected) = expected_digest {
        if path.exists() {
            let on_disk = load_config(path)?;
            if on_disk.digest() != expected {
                return Err(Error::DigestMismatch(path.display().to_string()));
            }
        }
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, write_string(cfg)).map_err(|e| {
        Error::ConfigWrite(format!("{}: {e}", path.display()))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| Error::ConfigWrite(format!("{}: {e}", path.display())))?;
    Ok(())
}

/// `check_lock(cfg)`: errors if `cfg.lock` is set and the caller didn't
/// opt out via `skiplock` (reserved for root).
pub fn check_lock(cfg: &VmConfigFile, vmid: &str, skiplock: bool) -> Result<()> {
    if skiplock {
        return Ok(());
    }
    if let Some(lock) = cfg.current.lock() {
        return Err(Error::Locked {
            vmid: vmid.to_string(),
            lock: lock.as_str().to_string(),
        });
    }
    Ok(())
}

/// `__snapshot_prepare`: inside the lock, clone `current` into a new
/// section, mark `snapstate=prepare`.
pub fn snapshot_prepare(cfg: &mut VmConfigFile, name: &str, snaptime: Option<i64>) -> Result<()> {
    if name == "current" {
        return Err(Error::InvalidConfig("snapshot name 'current' is reserved".to_string()));
    }
    if cfg.snapshot(name).is_some() {
        return Err(Error::SnapshotExists {
            vmid: String::new(),
            name: name.to_string(),
        });
    }
    let mut section = cfg.current.clone();
    section.set("snapstate", "prepare");
    if let Some(t) = snaptime {
        section.set("snaptime", t.to_string());
    }
    cfg.snapshots.push((name.to_string(), section));
    Ok(())
}

/// `__snapshot_commit`: flips `snapstate` off, promoting the prepared
/// section to a real snapshot.
pub fn snapshot_commit(cfg: &mut VmConfigFile, name: &str) -> Result<()> {
    let section = cfg
        .snapshot_mut(name)
        .ok_or_else(|| Error::SnapshotNotFound { vmid: String::new(), name: name.to_string() })?;
    section.remove("snapstate");
    Ok(())
}

/// Drops a `snapstate=prepare` section that failed before commit.
pub fn snapshot_abort(cfg: &mut VmConfigFile, name: &str) {
    cfg.remove_snapshot(name);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_current() -> Section {
        let mut s = Section::default();
        s.set("cores", "2");
        s.set("memory", "2048");
        s
    }

    #[test]
    fn round_trips_through_write_and_parse() {
        let mut cfg = VmConfigFile::default();
        cfg.current = sample_current();
        let text = write_string(&cfg);
        let reparsed = parse_string(&text).unwrap();
        assert_eq!(reparsed.current.get("cores"), Some("2"));
        assert_eq!(reparsed.current.get("memory"), Some("2048"));
    }

    #[test]
    fn digest_is_stable_across_noop_cycle() {
        let mut cfg = VmConfigFile::default();
        cfg.current = sample_current();
        let d1 = cfg.digest();
        let text = write_string(&cfg);
        let reparsed = parse_string(&text).unwrap();
        assert_eq!(reparsed.digest(), d1);
    }

    #[test]
    fn rejects_snapshot_section_named_current() {
        let text = "cores: 2\n\n[current]\nmemory: 4096\n";
        assert!(parse_string(text).is_err());
    }

    #[test]
    fn check_lock_rejects_without_skiplock() {
        let mut cfg = VmConfigFile::default();
        cfg.current.set("lock", "backup");
        assert!(matches!(check_lock(&cfg, "100", false), Err(Error::Locked { .. })));
        assert!(check_lock(&cfg, "100", true).is_ok());
    }

    #[test]
    fn snapshot_lifecycle_prepare_then_commit() {
        let mut cfg = VmConfigFile::default();
        cfg.current = sample_current();
        snapshot_prepare(&mut cfg, "s1", Some(1000)).unwrap();
        assert_eq!(cfg.snapshot("s1").unwrap().get("snapstate"), Some("prepare"));
        snapshot_commit(&mut cfg, "s1").unwrap();
        assert_eq!(cfg.snapshot("s1").unwrap().get("snapstate"), None);
    }

    #[test]
    fn snapshot_prepare_rejects_duplicate_name() {
        let mut cfg = VmConfigFile::default();
        snapshot_prepare(&mut cfg, "s1", None).unwrap();
        assert!(snapshot_prepare(&mut cfg, "s1", None).is_err());
    }

    #[test]
    fn write_config_detects_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("100.conf");

        let mut cfg = VmConfigFile::default();
        cfg.current = sample_current();
        write_config(&path, &cfg, None).unwrap();

        let loaded = load_config(&path).unwrap();
        let stale_digest = loaded.digest();

        // Someone else updates memory, changing the on-disk digest.
        let mut other = load_config(&path).unwrap();
        other.current.set("memory", "8192");
        write_config(&path, &other, None).unwrap();

        let mut stale_writer = loaded.clone();
        stale_writer.current.set("memory", "16384");
        let result = write_config(&path, &stale_writer, Some(&stale_digest));
        assert!(matches!(result, Err(Error::DigestMismatch(_))));
    }
}
