//! Operational configuration for the VM core: socket/file path patterns, the
//! hugepage lock path, default migration bandwidth. Loaded the way
//! `horcrux-api::config::HorcruxConfig` is: built-in defaults, then an
//! optional TOML file, then environment variable overrides.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmCoreSettings {
    /// Directory holding per-VM runtime sockets and pid files.
    pub run_dir: PathBuf,
    /// `{vmid}` is substituted for the numeric/string VM id.
    pub qmp_socket_pattern: String,
    pub qga_socket_pattern: String,
    pub pid_file_pattern: String,
    pub migrate_socket_pattern: String,
    /// Directory the persisted VM configuration lives under.
    pub config_dir: PathBuf,
    /// File lock path serializing hugepage allocation across VM starts.
    pub hugepage_lock_path: PathBuf,
    /// Default migration bandwidth limit in bytes/sec, 0 = unlimited.
    pub default_migrate_bandwidth: u64,
    pub qemu_binary: String,
}

impl Default for VmCoreSettings {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("/var/run/horcrux/vmcore"),
            qmp_socket_pattern: "{vmid}.qmp".to_string(),
            qga_socket_pattern: "{vmid}.qga".to_string(),
            pid_file_pattern: "{vmid}.pid".to_string(),
            migrate_socket_pattern: "{vmid}.migrate".to_string(),
            config_dir: PathBuf::from("/etc/horcrux/vmcore/qemu-server"),
            hugepage_lock_path: PathBuf::from("/var/lock/hugepages.lck"),
            default_migrate_bandwidth: 0,
            qemu_binary: "qemu-system-x86_64".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {0}: {1}")]
    FileRead(PathBuf, String),
    #[error("failed to parse settings: {0}")]
    Parse(String),
    #[error("invalid settings: {0}")]
    Validation(String),
}

impl VmCoreSettings {
    pub fn load() -> Result<Self, SettingsError> {
        let mut cfg = Self::default();
        if let Some(path) = Self::find_config_file() {
            cfg = Self::load_from_file(&path)?;
        }
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("HORCRUX_VMCORE_CONFIG") {
            return Some(PathBuf::from(path));
        }
        for candidate in ["/etc/horcrux/vmcore.toml", "./vmcore.toml"] {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    fn load_from_file(path: &PathBuf) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::FileRead(path.clone(), e.to_string()))?;
        toml::from_str(&content).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("HORCRUX_VMCORE_RUN_DIR") {
            self.run_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("HORCRUX_VMCORE_CONFIG_DIR") {
            self.config_dir = PathBuf::from(dir);
        }
        if let Ok(bin) = std::env::var("HORCRUX_VMCORE_QEMU_BINARY") {
            self.qemu_binary = bin;
        }
        if let Ok(bw) = std::env::var("HORCRUX_VMCORE_MIGRATE_BANDWIDTH") {
            if let Ok(bw) = bw.parse() {
                self.default_migrate_bandwidth = bw;
            }
        }
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.qemu_binary.trim().is_empty() {
            return Err(SettingsError::Validation("qemu_binary must not be empty".into()));
        }
        if !self.qmp_socket_pattern.contains("{vmid}") {
            return Err(SettingsError::Validation(
                "qmp_socket_pattern must contain {vmid}".into(),
            ));
        }
        Ok(())
    }

    fn substitute(pattern: &str, vmid: &str) -> PathBuf {
        PathBuf::from(pattern.replace("{vmid}", vmid))
    }

    pub fn qmp_socket(&self, vmid: &str) -> PathBuf {
        self.run_dir.join(Self::substitute(&self.qmp_socket_pattern, vmid))
    }

    pub fn qga_socket(&self, vmid: &str) -> PathBuf {
        self.run_dir.join(Self::substitute(&self.qga_socket_pattern, vmid))
    }

    pub fn pid_file(&self, vmid: &str) -> PathBuf {
        self.run_dir.join(Self::substitute(&self.pid_file_pattern, vmid))
    }

    pub fn migrate_socket(&self, vmid: &str) -> PathBuf {
        self.run_dir
            .join(Self::substitute(&self.migrate_socket_pattern, vmid))
    }

    pub fn config_path(&self, vmid: &str) -> PathBuf {
        self.config_dir.join(format!("{vmid}.conf"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        assert!(VmCoreSettings::default().validate().is_ok());
    }

    #[test]
    fn rejects_pattern_without_placeholder() {
        let mut cfg = VmCoreSettings::default();
        cfg.qmp_socket_pattern = "fixed.qmp".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn socket_paths_substitute_vmid() {
        let cfg = VmCoreSettings::default();
        assert_eq!(
            cfg.qmp_socket("100"),
            PathBuf::from("/var/run/horcrux/vmcore/100.qmp")
        );
    }
}
