//! Public operation surface: validates intents against the job's current
//! status and hands execution to the [`Supervisor`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::command::{BuiltCommand, CommandBuilder, CommandMode};
use crate::daemon::broadcaster::ProgressBroadcaster;
use crate::daemon::events::{self, JobEvent};
use crate::daemon::parse::{self, PreviewStats};
use crate::daemon::supervisor::Supervisor;
use crate::errors::TrmError;
use crate::models::{
    validate_new_job, DaemonConfig, Job, JobStatus, LifecycleOp, NewJob, PendingPreview,
};
use crate::process::{OutputStream, ProcessSpawner};
use crate::storage::{JobStore, LogStore};

pub const INTERRUPTED_MESSAGE: &str = "interrupted: daemon restarted while job was active";

/// Per-job result of a bulk operation.
#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    pub job_id: Uuid,
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct JobController {
    store: Arc<dyn JobStore>,
    logs: Arc<dyn LogStore>,
    spawner: Arc<dyn ProcessSpawner>,
    supervisor: Arc<Supervisor>,
    broadcaster: Arc<ProgressBroadcaster>,
    builder: CommandBuilder,
    event_tx: broadcast::Sender<JobEvent>,
    default_max_retries: u32,
    preview_timeout: Duration,
}

impl JobController {
    pub fn new(
        store: Arc<dyn JobStore>,
        logs: Arc<dyn LogStore>,
        spawner: Arc<dyn ProcessSpawner>,
        broadcaster: Arc<ProgressBroadcaster>,
        event_tx: broadcast::Sender<JobEvent>,
        config: &DaemonConfig,
    ) -> Self {
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&store),
            Arc::clone(&logs),
            Arc::clone(&spawner),
            Arc::clone(&broadcaster),
            event_tx.clone(),
            config,
        ));
        Self {
            store,
            logs,
            spawner,
            supervisor,
            broadcaster,
            builder: CommandBuilder::from_config(config),
            event_tx,
            default_max_retries: config.default_max_retries,
            preview_timeout: config.preview_timeout(),
        }
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    pub fn store_load_error(&self) -> Option<String> {
        self.store.load_error()
    }

    pub async fn executing(&self) -> Vec<Uuid> {
        self.supervisor.executing().await
    }

    // --- queries ---

    pub async fn list(&self) -> Result<Vec<Job>, TrmError> {
        self.store.list().await
    }

    pub async fn list_failed(&self) -> Result<Vec<Job>, TrmError> {
        let jobs = self.store.list().await?;
        Ok(jobs
            .into_iter()
            .filter(|j| j.status == JobStatus::Failed)
            .collect())
    }

    pub async fn get(&self, id: Uuid) -> Result<Job, TrmError> {
        self.store.get(id).await
    }

    /// Look a job up by UUID or by its exact name.
    pub async fn resolve(&self, reference: &str) -> Result<Job, TrmError> {
        if let Ok(id) = Uuid::parse_str(reference) {
            return self.store.get(id).await;
        }
        self.store
            .find_by_name(reference)
            .await?
            .ok_or_else(|| TrmError::NotFound(format!("Job '{}' not found", reference)))
    }

    pub async fn read_log(&self, id: Uuid, tail: Option<usize>) -> Result<String, TrmError> {
        self.store.get(id).await?;
        self.logs.read(id, tail).await
    }

    /// Build the command a request would run without creating anything.
    pub fn preview_command(&self, new: &NewJob) -> Result<BuiltCommand, TrmError> {
        validate_new_job(new)?;
        Ok(self.builder.build(new, CommandMode::Run))
    }

    // --- creation ---

    pub async fn create(&self, new: NewJob) -> Result<Job, TrmError> {
        self.insert_new(new, JobStatus::Created).await
    }

    /// Create the job as `pending_approval` and attach a dry-run estimate.
    /// A failed dry run is recorded on the preview, not returned.
    pub async fn create_with_preview(&self, new: NewJob) -> Result<Job, TrmError> {
        let job = self.insert_new(new, JobStatus::PendingApproval).await?;
        let preview = self.run_preview(&job).await;
        if let Some(error) = &preview.error {
            tracing::warn!("Preview for job '{}' failed: {}", job.name, error);
        }
        self.store
            .modify(job.id, move |mut job| {
                if job.status == JobStatus::PendingApproval {
                    job.preview = Some(preview);
                }
                Ok(job)
            })
            .await
    }

    async fn insert_new(&self, new: NewJob, status: JobStatus) -> Result<Job, TrmError> {
        validate_new_job(&new)?;
        if self.store.find_by_name(new.name.trim()).await?.is_some() {
            return Err(TrmError::Validation(format!(
                "A job named '{}' already exists",
                new.name.trim()
            )));
        }
        let job = Job::from_new(new, self.default_max_retries, status);
        self.store.upsert(job.clone()).await?;
        self.log(job.id, &format!("Job '{}' created ({})", job.name, job.status))
            .await;
        events::emit(
            &self.event_tx,
            JobEvent::JobAdded {
                job_id: job.id,
                name: job.name.clone(),
                timestamp: Utc::now(),
            },
        );
        tracing::info!("Created job '{}' ({})", job.name, job.id);
        Ok(job)
    }

    async fn run_preview(&self, job: &Job) -> PendingPreview {
        let command = self.builder.build(job, CommandMode::Preview);
        self.log(job.id, &format!("Preview: {}", command.display()))
            .await;
        let mut preview = PendingPreview {
            command: command.argv.clone(),
            files: None,
            bytes: None,
            estimated_seconds: None,
            warnings: command.warnings.clone(),
            error: None,
            created_at: Utc::now(),
        };
        match tokio::time::timeout(self.preview_timeout, self.collect_preview(job, &command))
            .await
        {
            Ok(Ok(stats)) => {
                preview.files = stats.files();
                preview.bytes = stats.bytes;
                preview.estimated_seconds = stats
                    .bytes
                    .and_then(|bytes| parse::estimate_seconds(bytes, job.transfer.bwlimit()));
            }
            Ok(Err(e)) => preview.error = Some(e.to_string()),
            Err(_) => {
                preview.error = Some(format!(
                    "Preview timed out after {}s",
                    self.preview_timeout.as_secs()
                ))
            }
        }
        preview
    }

    async fn collect_preview(
        &self,
        job: &Job,
        command: &BuiltCommand,
    ) -> Result<PreviewStats, TrmError> {
        let mut process =
            self.spawner
                .spawn(&command.argv)
                .map_err(|e| TrmError::Execution {
                    retryable: false,
                    tail: format!("{:#}", e),
                })?;
        let mut stats = PreviewStats::default();
        let mut stderr: VecDeque<String> = VecDeque::new();
        while let Some(line) = process.next_line().await {
            stats.observe(&job.transfer, &line.text);
            if line.stream == OutputStream::Stderr {
                if stderr.len() == 20 {
                    stderr.pop_front();
                }
                stderr.push_back(line.text);
            }
        }
        let code = process.wait().await.map_err(|e| TrmError::Execution {
            retryable: false,
            tail: e.to_string(),
        })?;
        if code != 0 {
            let tail = if stderr.is_empty() {
                format!("exited with code {}", code)
            } else {
                Vec::from(stderr).join("\n")
            };
            return Err(TrmError::Execution {
                retryable: false,
                tail,
            });
        }
        Ok(stats)
    }

    // --- lifecycle ---

    pub async fn start(&self, id: Uuid) -> Result<Job, TrmError> {
        self.supervisor.start(id, LifecycleOp::Start).await
    }

    pub async fn restart(&self, id: Uuid) -> Result<Job, TrmError> {
        self.supervisor.start(id, LifecycleOp::Restart).await
    }

    pub async fn approve(&self, id: Uuid) -> Result<Job, TrmError> {
        self.supervisor.start(id, LifecycleOp::Approve).await
    }

    pub async fn pause(&self, id: Uuid) -> Result<Job, TrmError> {
        self.store.get(id).await?.status.check(LifecycleOp::Pause)?;
        self.supervisor.pause(id).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<Job, TrmError> {
        self.store.get(id).await?.status.check(LifecycleOp::Resume)?;
        self.supervisor.resume(id).await
    }

    pub async fn stop(&self, id: Uuid) -> Result<Job, TrmError> {
        self.store.get(id).await?.status.check(LifecycleOp::Stop)?;
        self.supervisor.stop(id).await
    }

    /// Discard a job that is waiting for approval.
    pub async fn cancel_preview(&self, id: Uuid) -> Result<(), TrmError> {
        let _idle = self.supervisor.lock_idle(id).await;
        self.store.get(id).await?.status.check(LifecycleOp::Cancel)?;
        self.remove(id).await
    }

    /// Stop any execution, then remove the job and its log.
    pub async fn delete(&self, id: Uuid) -> Result<(), TrmError> {
        self.store.get(id).await?;
        let _idle = self.supervisor.lock_idle(id).await;
        self.remove(id).await
    }

    async fn remove(&self, id: Uuid) -> Result<(), TrmError> {
        self.store.delete(id).await?;
        if let Err(e) = self.logs.remove(id).await {
            tracing::warn!("Failed to remove log for job {}: {}", id, e);
        }
        self.broadcaster.clear(id).await;
        events::emit(
            &self.event_tx,
            JobEvent::JobRemoved {
                job_id: id,
                timestamp: Utc::now(),
            },
        );
        tracing::info!("Deleted job {}", id);
        Ok(())
    }

    /// Restart every job that is failed right now. One job's rejection does
    /// not stop the others.
    pub async fn restart_failed(&self) -> Result<Vec<BulkOutcome>, TrmError> {
        let failed = self.list_failed().await?;
        let mut outcomes = Vec::with_capacity(failed.len());
        for job in failed {
            let outcome = match self.restart(job.id).await {
                Ok(restarted) => BulkOutcome {
                    job_id: job.id,
                    name: job.name,
                    ok: true,
                    status: Some(restarted.status),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!("Could not restart job '{}': {}", job.name, e);
                    BulkOutcome {
                        job_id: job.id,
                        name: job.name,
                        ok: false,
                        status: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Mark running jobs that have no execution unit as failed so
    /// `restart_failed` can pick them up. Paused jobs stay paused since
    /// `resume` re-issues their command. Returns the affected ids.
    pub async fn recover_interrupted(&self) -> Result<Vec<Uuid>, TrmError> {
        let mut recovered = Vec::new();
        for job in self.store.list().await? {
            if job.status != JobStatus::Running {
                continue;
            }
            let Some(_idle) = self.supervisor.try_idle(job.id).await else {
                continue;
            };
            let result = self
                .store
                .modify(job.id, |mut job| {
                    if job.status == JobStatus::Running {
                        job.finish(JobStatus::Failed, Some(INTERRUPTED_MESSAGE.to_string()));
                    }
                    Ok(job)
                })
                .await;
            match result {
                Ok(updated) if updated.status == JobStatus::Failed => {
                    events::emit_status(&self.event_tx, job.id, job.status, JobStatus::Failed);
                    self.broadcaster.clear(job.id).await;
                    self.log(job.id, INTERRUPTED_MESSAGE).await;
                    tracing::warn!("Job '{}' was interrupted, marked failed", job.name);
                    recovered.push(job.id);
                }
                Ok(_) | Err(TrmError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Delete log files whose job no longer exists.
    pub async fn remove_orphaned_logs(&self) -> Result<usize, TrmError> {
        let known: Vec<Uuid> = self.store.list().await?.iter().map(|j| j.id).collect();
        self.logs.remove_orphans(&known).await
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    async fn log(&self, id: Uuid, message: &str) {
        if let Err(e) = self.logs.append(id, message).await {
            tracing::warn!("Failed to write log for job {}: {}", id, e);
        }
    }
}
