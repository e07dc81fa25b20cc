pub mod jobs;
pub mod logs;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::TrmError;
use crate::models::Job;

/// Read-modify-write step applied under the store's exclusive lock.
/// Returning an error aborts the update and leaves the record untouched.
pub type Mutator = Box<dyn FnOnce(Job) -> Result<Job, TrmError> + Send>;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Snapshot of all jobs in insertion order.
    async fn list(&self) -> Result<Vec<Job>, TrmError>;
    async fn get(&self, id: Uuid) -> Result<Job, TrmError>;
    async fn find_by_name(&self, name: &str) -> Result<Option<Job>, TrmError>;
    async fn upsert(&self, job: Job) -> Result<(), TrmError>;
    async fn delete(&self, id: Uuid) -> Result<(), TrmError>;
    async fn update_atomic(&self, id: Uuid, mutator: Mutator) -> Result<Job, TrmError>;

    /// Error hit while loading the backing file, if the store started empty
    /// because of it.
    fn load_error(&self) -> Option<String> {
        None
    }
}

impl dyn JobStore {
    /// `update_atomic` without boxing at the call site.
    pub async fn modify<F>(&self, id: Uuid, f: F) -> Result<Job, TrmError>
    where
        F: FnOnce(Job) -> Result<Job, TrmError> + Send + 'static,
    {
        self.update_atomic(id, Box::new(f)).await
    }
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append one timestamped line to the job's log.
    async fn append(&self, job_id: Uuid, message: &str) -> Result<(), TrmError>;
    /// Full log text, or only the last `tail` lines. A job that never
    /// logged anything has an empty log.
    async fn read(&self, job_id: Uuid, tail: Option<usize>) -> Result<String, TrmError>;
    async fn remove(&self, job_id: Uuid) -> Result<(), TrmError>;
    /// Remove logs whose job no longer exists. Returns how many were removed.
    async fn remove_orphans(&self, known: &[Uuid]) -> Result<usize, TrmError>;
}
