//! Closed, explicitly enumerated transfer options.
//!
//! Every field maps to exactly one command-line effect in
//! [`crate::command`]. Unknown fields are rejected at deserialization so a
//! misspelled option never silently does nothing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which tool runs the job, and with what options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum TransferSpec {
    Rsync {
        #[serde(default)]
        options: RsyncOptions,
    },
    Rclone {
        operation: OperationType,
        #[serde(default)]
        options: RcloneOptions,
    },
}

impl Default for TransferSpec {
    fn default() -> Self {
        TransferSpec::Rsync {
            options: RsyncOptions::default(),
        }
    }
}

impl TransferSpec {
    pub fn tool_name(&self) -> &'static str {
        match self {
            TransferSpec::Rsync { .. } => "rsync",
            TransferSpec::Rclone { .. } => "rclone",
        }
    }

    pub fn operation(&self) -> Option<OperationType> {
        match self {
            TransferSpec::Rsync { .. } => None,
            TransferSpec::Rclone { operation, .. } => Some(*operation),
        }
    }

    /// Bandwidth limit as configured, if any.
    pub fn bwlimit(&self) -> Option<&str> {
        match self {
            TransferSpec::Rsync { options } => options.bwlimit.as_deref(),
            TransferSpec::Rclone { options, .. } => options.bwlimit.as_deref(),
        }
    }

    pub fn includes(&self) -> &[String] {
        match self {
            TransferSpec::Rsync { .. } => &[],
            TransferSpec::Rclone { options, .. } => &options.includes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Copy,
    Sync,
    Move,
    Check,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Copy => "copy",
            OperationType::Sync => "sync",
            OperationType::Move => "move",
            OperationType::Check => "check",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy" => Ok(OperationType::Copy),
            "sync" => Ok(OperationType::Sync),
            "move" => Ok(OperationType::Move),
            "check" => Ok(OperationType::Check),
            other => Err(format!(
                "unknown operation '{}' (expected copy, sync, move or check)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RsyncOptions {
    pub archive: bool,
    pub verbose: bool,
    pub human_readable: bool,
    pub progress: bool,
    pub compress: bool,
    pub delete: bool,
    pub dry_run: bool,
    pub remove_source_files: bool,
    pub checksum: bool,
    pub stats: bool,
    pub itemize_changes: bool,
    pub inplace: bool,
    pub sparse: bool,
    pub whole_file: bool,
    pub update: bool,
    pub ignore_existing: bool,
    pub bwlimit: Option<String>,
    pub partial_dir: Option<String>,
}

impl Default for RsyncOptions {
    fn default() -> Self {
        Self {
            archive: true,
            verbose: true,
            human_readable: true,
            progress: true,
            compress: false,
            delete: false,
            dry_run: false,
            remove_source_files: false,
            checksum: false,
            stats: true,
            itemize_changes: false,
            inplace: false,
            sparse: false,
            whole_file: false,
            update: false,
            ignore_existing: false,
            bwlimit: None,
            partial_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RcloneOptions {
    pub verbose: bool,
    pub progress: bool,
    pub dry_run: bool,
    /// Only meaningful for `sync`.
    pub delete: bool,
    pub checksum: bool,
    pub ignore_times: bool,
    pub create_empty_src_dirs: bool,
    pub delete_empty_src_dirs: bool,
    pub transfers: Option<u32>,
    pub checkers: Option<u32>,
    pub bwlimit: Option<String>,
    pub update: bool,
    pub ignore_existing: bool,
    pub size_only: bool,
    pub retries: Option<u32>,
    pub low_level_retries: Option<u32>,
    pub timeout: Option<String>,
    pub contimeout: Option<String>,
    pub stats_interval: Option<String>,
    pub fast_list: bool,
    pub track_renames: bool,
    pub max_delete: Option<u64>,
    pub min_size: Option<String>,
    pub max_size: Option<String>,
    pub min_age: Option<String>,
    pub max_age: Option<String>,
    pub includes: Vec<String>,
}

impl Default for RcloneOptions {
    fn default() -> Self {
        Self {
            verbose: true,
            progress: true,
            dry_run: false,
            delete: false,
            checksum: false,
            ignore_times: false,
            create_empty_src_dirs: false,
            delete_empty_src_dirs: false,
            transfers: Some(4),
            checkers: Some(8),
            bwlimit: None,
            update: false,
            ignore_existing: false,
            size_only: false,
            retries: Some(3),
            low_level_retries: Some(10),
            timeout: None,
            contimeout: None,
            stats_interval: Some("1s".to_string()),
            fast_list: false,
            track_renames: false,
            max_delete: None,
            min_size: None,
            max_size: None,
            min_age: None,
            max_age: None,
            includes: Vec::new(),
        }
    }
}
