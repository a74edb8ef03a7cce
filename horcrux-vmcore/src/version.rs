//! Parses QEMU machine version strings, compares versions, and exposes the
//! `VersionGuard` predicate used throughout `blockdev.rs` and `blockjob.rs`
//! to pick between old and new QMP surfaces.
//!
//! Shells out to `qemu-system-x86_64 --version` and parses the resulting
//! string into a structured, comparable version rather than handing the raw
//! text back to callers.

use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QemuVersion {
    pub major: u32,
    pub minor: u32,
}

impl QemuVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parses the `X.Y[.Z]` that leads `qemu-system-x86_64 --version`'s
    /// first line, e.g. "QEMU emulator version 8.2.1".
    pub fn parse(text: &str) -> Option<Self> {
        let digits = text
            .split_whitespace()
            .find(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
        let mut parts = digits.split('.');
        let major: u32 = parts.next()?.parse().ok()?;
        let minor: u32 = parts.next().unwrap_or("0").parse().unwrap_or(0);
        Some(Self { major, minor })
    }

    pub async fn detect(qemu_binary: &str) -> Result<Self> {
        let output = Command::new(qemu_binary)
            .arg("--version")
            .stdout(Stdio::piped())
            .output()
            .await?;
        let text = String::from_utf8_lossy(&output.stdout);
        Self::parse(&text).ok_or_else(|| Error::InvalidConfig(format!("unparseable qemu version: {text}")))
    }
}

/// A `(major, minor)` floor below which a feature is unavailable. The "pve"
/// field of the source's `VersionGuard(major, minor, pve)` is dropped here:
/// this core has no notion of a distribution patch revision distinct from
/// the QEMU version itself.
#[derive(Debug, Clone, Copy)]
pub struct VersionGuard {
    floor: QemuVersion,
}

impl VersionGuard {
    pub const fn at_least(major: u32, minor: u32) -> Self {
        Self {
            floor: QemuVersion::new(major, minor),
        }
    }

    pub fn satisfied_by(&self, version: QemuVersion) -> bool {
        version >= self.floor
    }
}

/// `-blockdev` replaces `-drive` on the command line from this version.
pub const BLOCKDEV_CMDLINE: VersionGuard = VersionGuard::at_least(10, 0);
/// `block-job-change` to active mirror mode requires this version.
pub const ACTIVE_MIRROR_CHANGE: VersionGuard = VersionGuard::at_least(8, 2);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_version_banner() {
        let v = QemuVersion::parse("QEMU emulator version 8.2.1 (qemu-8.2.1)").unwrap();
        assert_eq!(v, QemuVersion::new(8, 2));
    }

    #[test]
    fn parses_version_without_patch() {
        let v = QemuVersion::parse("QEMU emulator version 10").unwrap();
        assert_eq!(v, QemuVersion::new(10, 0));
    }

    #[test]
    fn ordering_matches_semantic_expectation() {
        assert!(QemuVersion::new(8, 2) < QemuVersion::new(10, 0));
        assert!(QemuVersion::new(8, 1) < QemuVersion::new(8, 2));
    }

    #[test]
    fn version_guard_respects_floor() {
        assert!(ACTIVE_MIRROR_CHANGE.satisfied_by(QemuVersion::new(8, 2)));
        assert!(!ACTIVE_MIRROR_CHANGE.satisfied_by(QemuVersion::new(7, 0)));
        assert!(!BLOCKDEV_CMDLINE.satisfied_by(QemuVersion::new(9, 9)));
    }
}
