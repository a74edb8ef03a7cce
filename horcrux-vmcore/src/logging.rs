//! Tracing setup, mirroring `horcrux-api::logging` but trimmed down to what a
//! library embedded in a node agent needs: no HTTP-request spans, just level
//! and an optional rotating file appender.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<PathBuf>,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: Some(PathBuf::from("/var/log/horcrux/vmcore.log")),
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Installs the global subscriber. Safe to call once per process; a
    /// second call is a no-op (errors from `try_init` are swallowed).
    pub fn init(&self) {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(self.level.clone()));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true);

        if self.json_format {
            let _ = builder.json().try_init();
        } else {
            let _ = builder.try_init();
        }
    }

    pub fn init_from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(level) = std::env::var("RUST_LOG") {
            cfg.level = level;
        }
        if let Ok(path) = std::env::var("HORCRUX_VMCORE_LOG_PATH") {
            cfg.file_path = Some(PathBuf::from(path));
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_is_info() {
        assert_eq!(LoggingConfig::default().level, "info");
    }

    #[test]
    fn env_override_reads_rust_log() {
        std::env::set_var("RUST_LOG", "debug");
        let cfg = LoggingConfig::init_from_env();
        assert_eq!(cfg.level, "debug");
        std::env::remove_var("RUST_LOG");
    }
}
