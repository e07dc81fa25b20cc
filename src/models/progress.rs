use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PHASE_STARTING: &str = "starting";
pub const PHASE_SCANNING: &str = "scanning";
pub const PHASE_TRANSFERRING: &str = "transferring";
pub const PHASE_RETRYING: &str = "retrying";
pub const PHASE_PAUSED: &str = "paused";

/// Latest known progress of a running or paused job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// 0 to 100.
    pub percent: u8,
    pub bytes_transferred: u64,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub files_transferred: Option<u64>,
    #[serde(default)]
    pub files_total: Option<u64>,
    #[serde(default)]
    pub rate: Option<String>,
    #[serde(default)]
    pub eta: Option<String>,
    pub phase: String,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    pub fn starting() -> Self {
        Self {
            percent: 0,
            bytes_transferred: 0,
            total_bytes: None,
            files_transferred: None,
            files_total: None,
            rate: None,
            eta: None,
            phase: PHASE_STARTING.to_string(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_phase(mut self, phase: &str) -> Self {
        self.phase = phase.to_string();
        self.updated_at = Utc::now();
        self
    }
}
