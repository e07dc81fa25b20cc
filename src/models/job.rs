use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::TrmError;
use crate::models::options::TransferSpec;
use crate::models::preview::PendingPreview;
use crate::models::progress::Progress;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_RETRIES_LIMIT: i64 = 100;
pub const RCLONE_DEFAULT_MAX_RETRIES: u32 = 3;

/// Destinations that are never accepted for a local transfer.
const PROTECTED_PATHS: &[&str] = &[
    "/",
    "/bin",
    "/sbin",
    "/usr",
    "/usr/bin",
    "/usr/sbin",
    "/etc",
    "/boot",
    "/sys",
    "/proc",
    "/dev",
    "/System",
    "/Library",
    "/Applications",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    PendingApproval,
    Running,
    Paused,
    Stopped,
    Failed,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::PendingApproval => "pending_approval",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Stopped => "stopped",
            JobStatus::Failed => "failed",
            JobStatus::Completed => "completed",
        }
    }

    /// Running or paused: a job that may own an execution unit.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    /// Reject `op` unless the state machine allows it from this status.
    pub fn check(self, op: LifecycleOp) -> Result<(), TrmError> {
        if op.allowed_from().contains(&self) {
            Ok(())
        } else {
            Err(TrmError::IllegalTransition {
                op: op.as_str(),
                from: self,
            })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator intents that move a job through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Start,
    Pause,
    Resume,
    Stop,
    Restart,
    Approve,
    Cancel,
    Delete,
}

impl LifecycleOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleOp::Start => "start",
            LifecycleOp::Pause => "pause",
            LifecycleOp::Resume => "resume",
            LifecycleOp::Stop => "stop",
            LifecycleOp::Restart => "restart",
            LifecycleOp::Approve => "approve",
            LifecycleOp::Cancel => "cancel",
            LifecycleOp::Delete => "delete",
        }
    }

    pub fn allowed_from(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            LifecycleOp::Start => &[Created, Stopped],
            LifecycleOp::Pause => &[Running],
            LifecycleOp::Resume => &[Paused],
            LifecycleOp::Stop => &[Running, Paused],
            LifecycleOp::Restart => &[Failed],
            LifecycleOp::Approve => &[PendingApproval],
            LifecycleOp::Cancel => &[PendingApproval],
            LifecycleOp::Delete => &[
                Created,
                PendingApproval,
                Running,
                Paused,
                Stopped,
                Failed,
                Completed,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub transfer: TransferSpec,
    pub max_retries: u32,
    #[serde(default)]
    pub retry_count: u32,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub preview: Option<PendingPreview>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh record from a validated creation request.
    pub fn from_new(new: NewJob, default_max_retries: u32, status: JobStatus) -> Self {
        let max_retries = new.resolved_max_retries(default_max_retries);
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: new.name.trim().to_string(),
            source: new.source.trim().to_string(),
            destination: new.destination.trim().to_string(),
            excludes: new.excludes,
            transfer: new.transfer,
            max_retries,
            retry_count: 0,
            status,
            progress: None,
            error_message: None,
            preview: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move to a terminal status, clearing progress.
    pub fn finish(&mut self, status: JobStatus, error_message: Option<String>) {
        self.status = status;
        self.progress = None;
        self.error_message = error_message;
        self.touch();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub transfer: TransferSpec,
    /// Signed so a negative request can be rejected rather than failing to parse.
    #[serde(default)]
    pub max_retries: Option<i64>,
}

impl NewJob {
    pub fn resolved_max_retries(&self, default_max_retries: u32) -> u32 {
        match self.max_retries {
            Some(n) => u32::try_from(n.clamp(0, MAX_RETRIES_LIMIT)).unwrap_or(0),
            None => match self.transfer {
                TransferSpec::Rclone { .. } => RCLONE_DEFAULT_MAX_RETRIES,
                TransferSpec::Rsync { .. } => default_max_retries,
            },
        }
    }
}

/// Validate a NewJob before creation.
pub fn validate_new_job(job: &NewJob) -> Result<(), TrmError> {
    let name = job.name.trim();
    if name.is_empty() {
        return Err(TrmError::Validation("Job name cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(TrmError::Validation(format!(
            "Job name cannot exceed {} characters",
            MAX_NAME_LEN
        )));
    }
    // Names double as CLI references, so they must not be mistaken for ids.
    if Uuid::parse_str(name).is_ok() {
        return Err(TrmError::Validation(
            "Job name cannot be a valid UUID".to_string(),
        ));
    }

    if let Some(n) = job.max_retries {
        if !(0..=MAX_RETRIES_LIMIT).contains(&n) {
            return Err(TrmError::Validation(format!(
                "max_retries must be between 0 and {}, got {}",
                MAX_RETRIES_LIMIT, n
            )));
        }
    }

    let source = validate_path(&job.source, "source")?;
    let destination = validate_path(&job.destination, "destination")?;

    if source == destination {
        return Err(TrmError::Validation(
            "Source and destination cannot be the same".to_string(),
        ));
    }

    if !is_remote(&destination) {
        if let Some(protected) = PROTECTED_PATHS
            .iter()
            .find(|p| destination == **p || destination.starts_with(&format!("{}/", p)))
        {
            return Err(TrmError::Validation(format!(
                "Destination '{}' is inside protected system directory '{}'",
                job.destination, protected
            )));
        }
        if !is_remote(&source) && destination.starts_with(&format!("{}/", source)) {
            return Err(TrmError::Validation(
                "Destination cannot be inside the source directory".to_string(),
            ));
        }
    }

    for pattern in job.excludes.iter().chain(job.transfer.includes()) {
        if pattern.trim().is_empty() {
            return Err(TrmError::Validation(
                "Filter patterns cannot be empty".to_string(),
            ));
        }
        if pattern.contains('\0') {
            return Err(TrmError::Validation(
                "Filter patterns cannot contain null bytes".to_string(),
            ));
        }
    }

    Ok(())
}

/// `remote:path` (rclone) or `host:path` (rsync over ssh). A single-letter
/// prefix is treated as a Windows drive.
pub fn is_remote(path: &str) -> bool {
    match (path.find(':'), path.find('/')) {
        (Some(colon), slash) => colon > 1 && slash.map_or(true, |s| colon < s),
        (None, _) => false,
    }
}

/// Check a path and return its normalized form (trimmed, trailing slashes removed).
fn validate_path(raw: &str, label: &str) -> Result<String, TrmError> {
    let path = raw.trim();
    if path.is_empty() {
        return Err(TrmError::Validation(format!("{} path is required", label)));
    }
    if path.contains('\0') {
        return Err(TrmError::Validation(format!(
            "{} path contains null bytes",
            label
        )));
    }
    if path.split(['/', '\\']).any(|part| part == "..") {
        return Err(TrmError::Validation(format!(
            "Path traversal detected in {} path: {}",
            label, raw
        )));
    }
    let trimmed = path.trim_end_matches('/');
    Ok(if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    })
}
