//! Runtime configuration.
//!
//! Field set follows the listen/limits/recording inputs in the external
//! interfaces section: listening host and port, maximum concurrent clients,
//! an allowed-host regex, and the two optional recording paths consumed by
//! the callback bridge.

use serde::{Deserialize, Serialize};

/// Top level configuration for one `Runtime` instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub max_clients: usize,
    /// Regex matched against a connecting peer's address; connections from
    /// non-matching hosts are refused at accept time.
    pub allowed_host: String,
    /// Maximum accepted frame payload size, in bytes.
    pub max_frame_size: u32,
    /// Path to gzip-stream per-frame state snapshots to, if set.
    pub snapshot_record_path: Option<String>,
    /// Path to record raw inbound/outbound host traffic to, if set.
    pub traffic_record_path: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 9931,
            max_clients: 32,
            allowed_host: ".*".to_string(),
            max_frame_size: 4 * 1024 * 1024,
            snapshot_record_path: None,
            traffic_record_path: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any field the file omits.
    pub fn from_toml_str(s: &str) -> Result<RuntimeConfig, crate::Error> {
        toml::from_str(s).map_err(|e| crate::Error::Protocol(format!("invalid config: {e}")))
    }

    pub fn compiled_allowed_host(&self) -> Result<regex::Regex, crate::Error> {
        regex::Regex::new(&self.allowed_host)
            .map_err(|e| crate::Error::Protocol(format!("invalid allowed_host regex: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.listen_host, "127.0.0.1");
        assert!(cfg.snapshot_record_path.is_none());
    }

    #[test]
    fn parses_partial_toml() {
        let cfg = RuntimeConfig::from_toml_str("listen_port = 4000\n").unwrap();
        assert_eq!(cfg.listen_port, 4000);
        assert_eq!(cfg.listen_host, "127.0.0.1");
    }
}
