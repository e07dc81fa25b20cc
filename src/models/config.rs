use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_log_file_size")]
    pub max_log_file_size: u64,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_progress_persist_ms")]
    pub progress_persist_ms: u64,
    #[serde(default = "default_preview_timeout_secs")]
    pub preview_timeout_secs: u64,
    #[serde(default = "default_rsync_binary")]
    pub rsync_binary: String,
    #[serde(default = "default_rclone_binary")]
    pub rclone_binary: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8377
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_file_size() -> u64 {
    10_485_760 // 10MB
}

fn default_broadcast_capacity() -> usize {
    4096
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_secs() -> u64 {
    60
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_progress_persist_ms() -> u64 {
    2000
}

fn default_preview_timeout_secs() -> u64 {
    300
}

fn default_rsync_binary() -> String {
    "rsync".to_string()
}

fn default_rclone_binary() -> String {
    "rclone".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            log_level: default_log_level(),
            max_log_file_size: default_max_log_file_size(),
            broadcast_capacity: default_broadcast_capacity(),
            default_max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_secs: default_backoff_cap_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            progress_persist_ms: default_progress_persist_ms(),
            preview_timeout_secs: default_preview_timeout_secs(),
            rsync_binary: default_rsync_binary(),
            rclone_binary: default_rclone_binary(),
        }
    }
}

impl DaemonConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    pub fn progress_persist_interval(&self) -> Duration {
        Duration::from_millis(self.progress_persist_ms)
    }

    pub fn preview_timeout(&self) -> Duration {
        Duration::from_secs(self.preview_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8377);
        assert!(config.data_dir.is_none());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.max_log_file_size, 10_485_760);
        assert_eq!(config.default_max_retries, 5);
        assert_eq!(config.backoff_base_ms, 1000);
        assert_eq!(config.backoff_cap_secs, 60);
        assert_eq!(config.stop_grace_secs, 10);
        assert_eq!(config.progress_interval_ms, 1000);
        assert_eq!(config.rsync_binary, "rsync");
        assert_eq!(config.rclone_binary, "rclone");
    }

    #[test]
    fn test_daemon_config_partial_deserialization_empty() {
        let config: DaemonConfig = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8377);
        assert_eq!(config.default_max_retries, 5);
        assert_eq!(config.preview_timeout_secs, 300);
    }

    #[test]
    fn test_daemon_config_partial_deserialization_some_fields() {
        let json = r#"{"port": 9000, "backoff_base_ms": 10, "rclone_binary": "/opt/rclone"}"#;
        let config: DaemonConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.host, "127.0.0.1"); // default
        assert_eq!(config.port, 9000);
        assert_eq!(config.backoff_base_ms, 10);
        assert_eq!(config.backoff_cap_secs, 60); // default
        assert_eq!(config.rclone_binary, "/opt/rclone");
    }

    #[test]
    fn test_daemon_config_with_data_dir() {
        let json = r#"{"data_dir": "/custom/path"}"#;
        let config: DaemonConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.data_dir, Some(PathBuf::from("/custom/path")));
    }

    #[test]
    fn test_duration_helpers() {
        let config = DaemonConfig {
            stop_grace_secs: 3,
            progress_interval_ms: 0,
            ..DaemonConfig::default()
        };
        assert_eq!(config.stop_grace(), Duration::from_secs(3));
        assert_eq!(config.progress_interval(), Duration::from_millis(1));
        assert_eq!(config.preview_timeout(), Duration::from_secs(300));
    }
}
