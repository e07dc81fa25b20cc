//! Turns a job's declared transfer into an argument vector plus operator
//! warnings. Pure: no state, no I/O.

pub mod rclone;
pub mod rsync;

use serde::Serialize;

use crate::models::{DaemonConfig, Job, NewJob, TransferSpec};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuiltCommand {
    pub argv: Vec<String>,
    pub warnings: Vec<String>,
}

impl BuiltCommand {
    /// Shell-style rendering for logs and previews.
    pub fn display(&self) -> String {
        self.argv
            .iter()
            .map(|arg| quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=./:,@%+*".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    /// A normal attempt.
    Run,
    /// Re-issued after a pause or retry: skip data that already arrived.
    Resume,
    /// Dry run producing statistics for a pending preview.
    Preview,
}

/// The parts of a job the builder reads.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    pub source: &'a str,
    pub destination: &'a str,
    pub excludes: &'a [String],
    pub transfer: &'a TransferSpec,
}

impl<'a> From<&'a Job> for TransferRequest<'a> {
    fn from(job: &'a Job) -> Self {
        Self {
            source: &job.source,
            destination: &job.destination,
            excludes: &job.excludes,
            transfer: &job.transfer,
        }
    }
}

impl<'a> From<&'a NewJob> for TransferRequest<'a> {
    fn from(job: &'a NewJob) -> Self {
        Self {
            source: job.source.trim(),
            destination: job.destination.trim(),
            excludes: &job.excludes,
            transfer: &job.transfer,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    rsync_binary: String,
    rclone_binary: String,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new("rsync", "rclone")
    }
}

impl CommandBuilder {
    pub fn new(rsync_binary: impl Into<String>, rclone_binary: impl Into<String>) -> Self {
        Self {
            rsync_binary: rsync_binary.into(),
            rclone_binary: rclone_binary.into(),
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(config.rsync_binary.clone(), config.rclone_binary.clone())
    }

    pub fn build<'a>(
        &self,
        request: impl Into<TransferRequest<'a>>,
        mode: CommandMode,
    ) -> BuiltCommand {
        let request = request.into();
        match request.transfer {
            TransferSpec::Rsync { options } => {
                rsync::build(&self.rsync_binary, &request, options, mode)
            }
            TransferSpec::Rclone { operation, options } => {
                rclone::build(&self.rclone_binary, &request, *operation, options, mode)
            }
        }
    }
}
