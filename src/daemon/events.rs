use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::JobStatus;

/// Custom serializer for Arc<str> that serializes as a plain string.
fn serialize_arc_str<S>(data: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(data)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    StatusChanged {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        timestamp: DateTime<Utc>,
    },
    RetryScheduled {
        job_id: Uuid,
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
    Output {
        job_id: Uuid,
        #[serde(serialize_with = "serialize_arc_str")]
        line: Arc<str>,
        timestamp: DateTime<Utc>,
    },
    JobAdded {
        job_id: Uuid,
        name: String,
        timestamp: DateTime<Utc>,
    },
    JobRemoved {
        job_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::StatusChanged { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. }
            | JobEvent::Output { job_id, .. }
            | JobEvent::JobAdded { job_id, .. }
            | JobEvent::JobRemoved { job_id, .. } => *job_id,
        }
    }
}

/// Publish without caring whether anyone is listening.
pub fn emit(tx: &broadcast::Sender<JobEvent>, event: JobEvent) {
    let _ = tx.send(event);
}

/// Status change event, skipped when nothing changed.
pub fn emit_status(
    tx: &broadcast::Sender<JobEvent>,
    job_id: Uuid,
    from: JobStatus,
    to: JobStatus,
) {
    if from != to {
        emit(
            tx,
            JobEvent::StatusChanged {
                job_id,
                from,
                to,
                timestamp: Utc::now(),
            },
        );
    }
}
