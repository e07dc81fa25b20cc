//! Process supervision: one tokio task per active job, owning that job's
//! child process for its whole life including retries and backoff sleeps.
//!
//! The registry maps job ids to execution handles and is the single answer to
//! "is this job executing". Start checks and inserts under the registry lock;
//! a unit writes its terminal state and removes itself under the same lock,
//! so a job never has two units. While a unit exists it is the only writer of
//! the job's runtime status.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, MutexGuard};
use tokio::time::Instant;
use uuid::Uuid;

use crate::command::{CommandBuilder, CommandMode};
use crate::daemon::broadcaster::ProgressBroadcaster;
use crate::daemon::events::{self, JobEvent};
use crate::daemon::parse;
use crate::daemon::retry::{self, RetryPolicy};
use crate::errors::TrmError;
use crate::models::progress::{PHASE_PAUSED, PHASE_RETRYING, PHASE_STARTING, PHASE_TRANSFERRING};
use crate::models::{DaemonConfig, Job, JobStatus, LifecycleOp, Progress};
use crate::process::{OutputLine, OutputStream, ProcessSignal, ProcessSpawner, TransferProcess};
use crate::storage::{JobStore, LogStore};

const STDERR_TAIL_LINES: usize = 20;

pub const SHUTDOWN_MESSAGE: &str = "interrupted: daemon shut down while job was active";

enum Control {
    Stop,
    Shutdown,
    Pause(oneshot::Sender<PauseAck>),
    Resume(oneshot::Sender<()>),
}

enum PauseAck {
    Suspended,
    /// The child is being stopped; the unit ends with the job paused.
    Detaching,
}

struct ExecutionHandle {
    control_tx: mpsc::Sender<Control>,
    done_rx: watch::Receiver<bool>,
}

type Registry = HashMap<Uuid, ExecutionHandle>;

/// Holds the registry while a job is known to have no execution unit.
pub struct IdleGuard<'a> {
    _registry: MutexGuard<'a, Registry>,
}

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Completed,
    Failed(String),
    Stopped,
    /// Stop-and-remember pause: no process, progress kept.
    Paused,
    Interrupted,
}

enum AttemptEnd {
    Exited { code: i32, stderr_tail: Vec<String> },
    Ended(Outcome),
}

enum ProcessEvent {
    Line(OutputLine),
    Eof,
    Exited(i32),
}

pub struct Supervisor {
    store: Arc<dyn JobStore>,
    logs: Arc<dyn LogStore>,
    spawner: Arc<dyn ProcessSpawner>,
    builder: CommandBuilder,
    broadcaster: Arc<ProgressBroadcaster>,
    event_tx: broadcast::Sender<JobEvent>,
    policy: RetryPolicy,
    stop_grace: Duration,
    persist_interval: Duration,
    registry: Mutex<Registry>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn JobStore>,
        logs: Arc<dyn LogStore>,
        spawner: Arc<dyn ProcessSpawner>,
        broadcaster: Arc<ProgressBroadcaster>,
        event_tx: broadcast::Sender<JobEvent>,
        config: &DaemonConfig,
    ) -> Self {
        Self {
            store,
            logs,
            spawner,
            builder: CommandBuilder::from_config(config),
            broadcaster,
            event_tx,
            policy: RetryPolicy::from_config(config),
            stop_grace: config.stop_grace(),
            persist_interval: config.progress_persist_interval(),
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_executing(&self, job_id: Uuid) -> bool {
        self.registry.lock().await.contains_key(&job_id)
    }

    pub async fn executing(&self) -> Vec<Uuid> {
        self.registry.lock().await.keys().copied().collect()
    }

    /// Move the job to `running` through `op` and hand it to a new unit.
    /// `Resume` re-issues the command so already transferred data is skipped.
    pub async fn start(
        self: &Arc<Self>,
        job_id: Uuid,
        op: LifecycleOp,
    ) -> Result<Job, TrmError> {
        let mut registry = self.registry.lock().await;
        if registry.contains_key(&job_id) {
            return Err(TrmError::AlreadyRunning(format!(
                "Job '{}' already has an active execution",
                job_id
            )));
        }

        let before = self.store.get(job_id).await?.status;
        let job = self
            .store
            .modify(job_id, move |mut job| {
                job.status.check(op)?;
                job.status = JobStatus::Running;
                job.error_message = None;
                match op {
                    LifecycleOp::Restart => job.retry_count = 0,
                    LifecycleOp::Approve => job.preview = None,
                    _ => {}
                }
                job.progress = Some(match (op, job.progress.take()) {
                    (LifecycleOp::Resume, Some(previous)) => previous.with_phase(PHASE_STARTING),
                    _ => Progress::starting(),
                });
                Ok(job)
            })
            .await?;
        events::emit_status(&self.event_tx, job_id, before, JobStatus::Running);
        if let Some(progress) = job.progress.clone() {
            self.broadcaster.publish(job_id, progress).await;
        }

        let (control_tx, control_rx) = mpsc::channel(8);
        let (done_tx, done_rx) = watch::channel(false);
        let unit = Arc::clone(self);
        let mode = if op == LifecycleOp::Resume {
            CommandMode::Resume
        } else {
            CommandMode::Run
        };
        tokio::spawn(async move {
            let outcome = unit.drive(job_id, control_rx, mode).await;
            unit.finalize(job_id, outcome).await;
            let _ = done_tx.send(true);
        });
        registry.insert(
            job_id,
            ExecutionHandle {
                control_tx,
                done_rx,
            },
        );
        tracing::info!("Job {} started ({})", job_id, op.as_str());
        Ok(job)
    }

    /// Terminate the job's process, or settle a job that has none. Stop wins
    /// over any pending retry.
    pub async fn stop(&self, job_id: Uuid) -> Result<Job, TrmError> {
        if let Some((control_tx, mut done_rx)) = self.handle(job_id).await {
            self.log(job_id, "Stop requested").await;
            let _ = control_tx.send(Control::Stop).await;
            wait_done(&mut done_rx).await;
            return self.store.get(job_id).await;
        }

        let _idle = self.lock_idle(job_id).await;
        let before = self.store.get(job_id).await?.status;
        let job = self
            .store
            .modify(job_id, |mut job| {
                job.status.check(LifecycleOp::Stop)?;
                job.finish(JobStatus::Stopped, None);
                Ok(job)
            })
            .await?;
        self.broadcaster.clear(job_id).await;
        events::emit_status(&self.event_tx, job_id, before, JobStatus::Stopped);
        self.log(job_id, "Transfer stopped").await;
        Ok(job)
    }

    pub async fn pause(&self, job_id: Uuid) -> Result<Job, TrmError> {
        if let Some((control_tx, mut done_rx)) = self.handle(job_id).await {
            let (ack_tx, ack_rx) = oneshot::channel();
            if control_tx.send(Control::Pause(ack_tx)).await.is_ok() {
                match ack_rx.await {
                    Ok(PauseAck::Suspended) => {}
                    Ok(PauseAck::Detaching) | Err(_) => wait_done(&mut done_rx).await,
                }
                let job = self.store.get(job_id).await?;
                return match job.status {
                    JobStatus::Paused => Ok(job),
                    other => Err(TrmError::IllegalTransition {
                        op: LifecycleOp::Pause.as_str(),
                        from: other,
                    }),
                };
            }
        }

        // Running on record but nothing executing: remember progress only.
        let _idle = self.lock_idle(job_id).await;
        let before = self.store.get(job_id).await?.status;
        let job = self
            .store
            .modify(job_id, |mut job| {
                job.status.check(LifecycleOp::Pause)?;
                job.status = JobStatus::Paused;
                job.progress = Some(
                    job.progress
                        .take()
                        .unwrap_or_else(Progress::starting)
                        .with_phase(PHASE_PAUSED),
                );
                Ok(job)
            })
            .await?;
        events::emit_status(&self.event_tx, job_id, before, JobStatus::Paused);
        Ok(job)
    }

    pub async fn resume(self: &Arc<Self>, job_id: Uuid) -> Result<Job, TrmError> {
        if let Some((control_tx, _)) = self.handle(job_id).await {
            let (ack_tx, ack_rx) = oneshot::channel();
            if control_tx.send(Control::Resume(ack_tx)).await.is_ok() && ack_rx.await.is_ok() {
                return self.store.get(job_id).await;
            }
        }
        self.start(job_id, LifecycleOp::Resume).await
    }

    /// Stop any unit for `job_id` and hold the registry so none can start
    /// until the guard is dropped.
    pub async fn lock_idle(&self, job_id: Uuid) -> IdleGuard<'_> {
        loop {
            let registry = self.registry.lock().await;
            let Some(handle) = registry.get(&job_id) else {
                return IdleGuard {
                    _registry: registry,
                };
            };
            let control_tx = handle.control_tx.clone();
            let mut done_rx = handle.done_rx.clone();
            drop(registry);
            let _ = control_tx.send(Control::Stop).await;
            wait_done(&mut done_rx).await;
        }
    }

    /// Like `lock_idle` but never stops anything: `None` if a unit exists.
    pub async fn try_idle(&self, job_id: Uuid) -> Option<IdleGuard<'_>> {
        let registry = self.registry.lock().await;
        if registry.contains_key(&job_id) {
            return None;
        }
        Some(IdleGuard {
            _registry: registry,
        })
    }

    /// Interrupt every unit; their jobs end `failed` so they can be restarted.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self
            .registry
            .lock()
            .await
            .iter()
            .map(|(id, h)| (*id, h.control_tx.clone(), h.done_rx.clone()))
            .collect();
        if handles.is_empty() {
            return;
        }
        tracing::info!("Stopping {} active job(s)", handles.len());
        for (_, control_tx, _) in &handles {
            let _ = control_tx.send(Control::Shutdown).await;
        }
        let deadline = self.stop_grace + Duration::from_secs(5);
        for (job_id, _, mut done_rx) in handles {
            if tokio::time::timeout(deadline, wait_done(&mut done_rx))
                .await
                .is_err()
            {
                tracing::warn!("Job {} did not stop within {:?}", job_id, deadline);
            }
        }
    }

    async fn handle(
        &self,
        job_id: Uuid,
    ) -> Option<(mpsc::Sender<Control>, watch::Receiver<bool>)> {
        self.registry
            .lock()
            .await
            .get(&job_id)
            .map(|h| (h.control_tx.clone(), h.done_rx.clone()))
    }

    async fn log(&self, job_id: Uuid, message: &str) {
        if let Err(e) = self.logs.append(job_id, message).await {
            tracing::warn!("Failed to write log for job {}: {}", job_id, e);
        }
    }

    /// Attempt loop: spawn, watch, classify, back off, repeat.
    async fn drive(
        &self,
        job_id: Uuid,
        mut control_rx: mpsc::Receiver<Control>,
        mut mode: CommandMode,
    ) -> Outcome {
        loop {
            let job = match self.store.get(job_id).await {
                Ok(job) => job,
                Err(e) => return Outcome::Failed(e.to_string()),
            };
            let mut progress = job.progress.clone().unwrap_or_else(Progress::starting);
            let command = self.builder.build(&job, mode);
            self.log(
                job_id,
                &format!(
                    "Starting attempt {}: {}",
                    job.retry_count + 1,
                    command.display()
                ),
            )
            .await;
            for warning in &command.warnings {
                self.log(job_id, &format!("Warning: {}", warning)).await;
            }

            let mut process = match self.spawner.spawn(&command.argv) {
                Ok(process) => process,
                Err(e) => {
                    let message =
                        format!("Failed to start {}: {:#}", job.transfer.tool_name(), e);
                    self.log(job_id, &message).await;
                    return Outcome::Failed(message);
                }
            };

            let end = self
                .watch_attempt(&job, process.as_mut(), &mut control_rx, &mut progress)
                .await;
            let (code, stderr_tail) = match end {
                AttemptEnd::Ended(outcome) => return outcome,
                AttemptEnd::Exited { code, stderr_tail } => (code, stderr_tail),
            };
            if code == 0 {
                return Outcome::Completed;
            }

            let retryable = retry::is_retryable(&job.transfer, code, &stderr_tail);
            let message = if stderr_tail.is_empty() {
                format!("exited with code {}", code)
            } else {
                stderr_tail.join("\n")
            };
            let failure = TrmError::Execution {
                retryable,
                tail: message.clone(),
            };
            self.log(job_id, &format!("Exit code {}. {}", code, failure))
                .await;
            if !retryable {
                return Outcome::Failed(message);
            }
            if job.retry_count >= job.max_retries {
                self.log(
                    job_id,
                    &format!("Giving up after {} retries", job.retry_count),
                )
                .await;
                return Outcome::Failed(message);
            }

            let retrying = progress.with_phase(PHASE_RETRYING);
            let last_error = message.clone();
            let persisted = retrying.clone();
            let updated = match self
                .store
                .modify(job_id, move |mut job| {
                    job.retry_count += 1;
                    job.error_message = Some(last_error);
                    job.progress = Some(persisted);
                    Ok(job)
                })
                .await
            {
                Ok(job) => job,
                Err(e) => return Outcome::Failed(e.to_string()),
            };
            self.broadcaster.publish(job_id, retrying).await;

            let delay = self.policy.delay(updated.retry_count);
            self.log(
                job_id,
                &format!(
                    "Retrying in {}s (attempt {}/{})",
                    delay.as_secs_f64(),
                    updated.retry_count,
                    updated.max_retries
                ),
            )
            .await;
            events::emit(
                &self.event_tx,
                JobEvent::RetryScheduled {
                    job_id,
                    attempt: updated.retry_count,
                    max_retries: updated.max_retries,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    timestamp: Utc::now(),
                },
            );

            if let Some(outcome) = backoff(delay, &mut control_rx).await {
                return outcome;
            }
            mode = CommandMode::Resume;
        }
    }

    async fn watch_attempt(
        &self,
        job: &Job,
        process: &mut dyn TransferProcess,
        control_rx: &mut mpsc::Receiver<Control>,
        progress: &mut Progress,
    ) -> AttemptEnd {
        let job_id = job.id;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut last_persist: Option<Instant> = None;
        let mut output_done = false;
        let mut suspended = false;
        let mut control_open = true;
        let mut ending: Option<Outcome> = None;
        let mut kill_at: Option<Instant> = None;

        let code = loop {
            tokio::select! {
                event = next_event(process, output_done) => match event {
                    ProcessEvent::Line(line) => {
                        self.on_line(job, &line, progress, &mut last_persist).await;
                        if line.stream == OutputStream::Stderr {
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line.text);
                        }
                    }
                    ProcessEvent::Eof => output_done = true,
                    ProcessEvent::Exited(code) => break code,
                },
                control = control_rx.recv(), if control_open => match control {
                    Some(Control::Stop) => {
                        self.request_end(
                            process,
                            suspended,
                            &mut ending,
                            &mut kill_at,
                            Outcome::Stopped,
                        );
                    }
                    Some(Control::Shutdown) => {
                        self.request_end(
                            process,
                            suspended,
                            &mut ending,
                            &mut kill_at,
                            Outcome::Interrupted,
                        );
                    }
                    None => {
                        control_open = false;
                        self.request_end(
                            process,
                            suspended,
                            &mut ending,
                            &mut kill_at,
                            Outcome::Interrupted,
                        );
                    }
                    Some(Control::Pause(ack)) => {
                        if ending.is_some() {
                            let _ = ack.send(PauseAck::Detaching);
                        } else if suspended {
                            let _ = ack.send(PauseAck::Suspended);
                        } else if process.supports_suspend()
                            && process.signal(ProcessSignal::Suspend).is_ok()
                        {
                            suspended = true;
                            self.mark_suspended(job_id, progress).await;
                            let _ = ack.send(PauseAck::Suspended);
                        } else {
                            self.log(job_id, "Suspend unsupported, stopping the transfer instead").await;
                            self.request_end(
                                process,
                                suspended,
                                &mut ending,
                                &mut kill_at,
                                Outcome::Paused,
                            );
                            let _ = ack.send(PauseAck::Detaching);
                        }
                    }
                    Some(Control::Resume(ack)) => {
                        if suspended && ending.is_none() {
                            match process.signal(ProcessSignal::Resume) {
                                Ok(()) => {
                                    suspended = false;
                                    self.mark_resumed(job_id, progress).await;
                                }
                                Err(e) => tracing::warn!("Failed to continue job {}: {}", job_id, e),
                            }
                        }
                        let _ = ack.send(());
                    }
                },
                _ = tokio::time::sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() => {
                    let message = format!(
                        "Process did not exit within {}s, killing it",
                        self.stop_grace.as_secs()
                    );
                    self.log(job_id, &message).await;
                    if let Err(e) = process.signal(ProcessSignal::Kill) {
                        tracing::warn!("Failed to kill process for job {}: {}", job_id, e);
                    }
                    kill_at = None;
                }
            }
        };

        match ending {
            Some(outcome) => AttemptEnd::Ended(outcome),
            // A failed exit while suspended must not retry behind the pause.
            None if suspended && code != 0 => {
                self.log(job_id, &format!("Process exited with code {} while paused", code))
                    .await;
                AttemptEnd::Ended(Outcome::Paused)
            }
            None => AttemptEnd::Exited {
                code,
                stderr_tail: tail.into(),
            },
        }
    }

    fn request_end(
        &self,
        process: &mut dyn TransferProcess,
        suspended: bool,
        ending: &mut Option<Outcome>,
        kill_at: &mut Option<Instant>,
        outcome: Outcome,
    ) {
        let first = ending.is_none();
        if first || outcome == Outcome::Stopped {
            *ending = Some(outcome);
        }
        if !first {
            return;
        }
        if let Err(e) = process.signal(ProcessSignal::Terminate) {
            tracing::debug!("Terminate signal failed: {}", e);
        }
        if suspended {
            let _ = process.signal(ProcessSignal::Resume);
        }
        *kill_at = Some(Instant::now() + self.stop_grace);
    }

    async fn on_line(
        &self,
        job: &Job,
        line: &OutputLine,
        progress: &mut Progress,
        last_persist: &mut Option<Instant>,
    ) {
        self.log(job.id, &line.text).await;
        events::emit(
            &self.event_tx,
            JobEvent::Output {
                job_id: job.id,
                line: Arc::from(line.text.as_str()),
                timestamp: Utc::now(),
            },
        );

        let Some(update) = parse::parse_line(&job.transfer, &line.text) else {
            return;
        };
        update.apply(progress);
        self.broadcaster.publish(job.id, progress.clone()).await;

        if last_persist.is_some_and(|at| at.elapsed() < self.persist_interval) {
            return;
        }
        *last_persist = Some(Instant::now());
        let snapshot = progress.clone();
        let result = self
            .store
            .modify(job.id, move |mut job| {
                if job.status.is_active() {
                    job.progress = Some(snapshot);
                }
                Ok(job)
            })
            .await;
        if let Err(e) = result {
            tracing::warn!("Failed to persist progress for job {}: {}", job.id, e);
        }
    }

    async fn mark_suspended(&self, job_id: Uuid, progress: &Progress) {
        let paused = progress.clone().with_phase(PHASE_PAUSED);
        self.broadcaster.publish(job_id, paused.clone()).await;
        let result = self
            .store
            .modify(job_id, move |mut job| {
                job.status.check(LifecycleOp::Pause)?;
                job.status = JobStatus::Paused;
                job.progress = Some(paused);
                Ok(job)
            })
            .await;
        match result {
            Ok(_) => {
                events::emit_status(&self.event_tx, job_id, JobStatus::Running, JobStatus::Paused);
                self.log(job_id, "Transfer paused").await;
            }
            Err(e) => tracing::warn!("Failed to record pause for job {}: {}", job_id, e),
        }
    }

    async fn mark_resumed(&self, job_id: Uuid, progress: &mut Progress) {
        *progress = progress.clone().with_phase(PHASE_TRANSFERRING);
        self.broadcaster.publish(job_id, progress.clone()).await;
        let running = progress.clone();
        let result = self
            .store
            .modify(job_id, move |mut job| {
                job.status.check(LifecycleOp::Resume)?;
                job.status = JobStatus::Running;
                job.progress = Some(running);
                Ok(job)
            })
            .await;
        match result {
            Ok(_) => {
                events::emit_status(&self.event_tx, job_id, JobStatus::Paused, JobStatus::Running);
                self.log(job_id, "Transfer resumed").await;
            }
            Err(e) => tracing::warn!("Failed to record resume for job {}: {}", job_id, e),
        }
    }

    /// Write the terminal state and leave the registry.
    async fn finalize(&self, job_id: Uuid, outcome: Outcome) {
        let mut registry = self.registry.lock().await;
        let before = self.store.get(job_id).await.map(|job| job.status);

        let (status, message) = match &outcome {
            Outcome::Completed => (
                JobStatus::Completed,
                "Transfer completed successfully".to_string(),
            ),
            Outcome::Failed(error) => (JobStatus::Failed, format!("Transfer failed: {}", error)),
            Outcome::Stopped => (JobStatus::Stopped, "Transfer stopped".to_string()),
            Outcome::Paused => (JobStatus::Paused, "Transfer paused".to_string()),
            Outcome::Interrupted => (JobStatus::Failed, SHUTDOWN_MESSAGE.to_string()),
        };
        let write = outcome.clone();
        let result = self
            .store
            .modify(job_id, move |mut job| {
                match write {
                    Outcome::Completed => job.finish(JobStatus::Completed, None),
                    Outcome::Failed(error) => job.finish(JobStatus::Failed, Some(error)),
                    Outcome::Stopped => job.finish(JobStatus::Stopped, None),
                    Outcome::Interrupted => {
                        job.finish(JobStatus::Failed, Some(SHUTDOWN_MESSAGE.to_string()))
                    }
                    Outcome::Paused => {
                        job.status = JobStatus::Paused;
                        job.progress = Some(
                            job.progress
                                .take()
                                .unwrap_or_else(Progress::starting)
                                .with_phase(PHASE_PAUSED),
                        );
                    }
                }
                Ok(job)
            })
            .await;

        match result {
            Ok(job) => {
                if let Ok(before) = before {
                    events::emit_status(&self.event_tx, job_id, before, status);
                }
                match &job.progress {
                    Some(progress) => self.broadcaster.publish(job_id, progress.clone()).await,
                    None => self.broadcaster.clear(job_id).await,
                }
                tracing::info!("Job {} finished: {}", job_id, status);
            }
            Err(TrmError::NotFound(_)) => {
                tracing::debug!("Job {} was removed while executing", job_id);
                self.broadcaster.clear(job_id).await;
            }
            Err(e) => tracing::error!("Failed to record outcome for job {}: {}", job_id, e),
        }
        self.log(job_id, &message).await;
        registry.remove(&job_id);
    }
}

/// One cancel-safe step of a process: a line, end of output, or the exit.
async fn next_event(process: &mut dyn TransferProcess, output_done: bool) -> ProcessEvent {
    if output_done {
        return ProcessEvent::Exited(process.wait().await.unwrap_or_else(|e| {
            tracing::warn!("Failed to wait for process: {}", e);
            -1
        }));
    }
    match process.next_line().await {
        Some(line) => ProcessEvent::Line(line),
        None => ProcessEvent::Eof,
    }
}

/// Sleep between attempts. Returns early with the unit's outcome when the
/// operator intervenes.
async fn backoff(delay: Duration, control_rx: &mut mpsc::Receiver<Control>) -> Option<Outcome> {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return None,
            control = control_rx.recv() => match control {
                Some(Control::Stop) => return Some(Outcome::Stopped),
                Some(Control::Shutdown) | None => return Some(Outcome::Interrupted),
                Some(Control::Pause(ack)) => {
                    let _ = ack.send(PauseAck::Detaching);
                    return Some(Outcome::Paused);
                }
                Some(Control::Resume(ack)) => {
                    let _ = ack.send(());
                }
            },
        }
    }
}

async fn wait_done(done_rx: &mut watch::Receiver<bool>) {
    while !*done_rx.borrow_and_update() {
        if done_rx.changed().await.is_err() {
            break;
        }
    }
}
