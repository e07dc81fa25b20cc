use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dry-run estimate attached to a job awaiting operator approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPreview {
    pub command: Vec<String>,
    #[serde(default)]
    pub files: Option<u64>,
    #[serde(default)]
    pub bytes: Option<u64>,
    #[serde(default)]
    pub estimated_seconds: Option<u64>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Set when the dry run itself failed or timed out. The job can still be
    /// approved or cancelled.
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingPreview {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
