use thiserror::Error;

use crate::models::JobStatus;

#[derive(Debug, Error)]
pub enum TrmError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Illegal transition: cannot {op} a job that is {from}")]
    IllegalTransition { op: &'static str, from: JobStatus },

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Execution failed ({}): {tail}", failure_kind(.retryable))]
    Execution { retryable: bool, tail: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn failure_kind(retryable: &bool) -> &'static str {
    if *retryable {
        "retryable"
    } else {
        "fatal"
    }
}

impl TrmError {
    pub fn job_not_found(id: impl std::fmt::Display) -> Self {
        TrmError::NotFound(format!("Job with id '{}' not found", id))
    }

    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            TrmError::Validation(_) => "validation_error",
            TrmError::IllegalTransition { .. } => "illegal_transition",
            TrmError::AlreadyRunning(_) => "already_running",
            TrmError::NotFound(_) => "not_found",
            TrmError::Execution { .. } => "execution_failure",
            TrmError::Storage(_) => "storage_error",
            TrmError::Internal(_) => "internal_error",
        }
    }
}

impl From<std::io::Error> for TrmError {
    fn from(err: std::io::Error) -> Self {
        TrmError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for TrmError {
    fn from(err: serde_json::Error) -> Self {
        TrmError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for TrmError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<TrmError>() {
            Ok(typed) => typed,
            Err(other) => TrmError::Storage(format!("{:#}", other)),
        }
    }
}
