use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Serialize, Serializer};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::TrmError;
use crate::models::Job;
use crate::storage::{JobStore, Mutator};

/// Job table persisted as one JSON object mapping id to job.
pub struct JsonJobStore {
    file_path: PathBuf,
    cache: RwLock<Vec<Job>>,
    load_error: Option<String>,
}

/// Serializes the cache as an id-keyed map without reordering it.
struct JobTable<'a>(&'a [Job]);

impl Serialize for JobTable<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|job| (job.id, job)))
    }
}

fn parse_table(content: &str) -> Result<Vec<Job>> {
    let table: HashMap<Uuid, Job> = serde_json::from_str(content)?;
    if let Some((key, job)) = table.iter().find(|(key, job)| **key != job.id) {
        anyhow::bail!("key '{}' does not match job id '{}'", key, job.id);
    }
    let mut jobs: Vec<Job> = table.into_values().collect();
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Ok(jobs)
}

impl JsonJobStore {
    /// Create a new JsonJobStore, loading existing data from disk if present.
    ///
    /// If `jobs.json` cannot be parsed the store fails closed: it copies the
    /// file to `jobs.json.bak`, starts with an empty table, and reports the
    /// problem through [`JobStore::load_error`].
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .context("Failed to create data directory")?;

        let file_path = data_dir.join("jobs.json");
        let mut load_error = None;

        let jobs = if file_path.exists() {
            let content = tokio::fs::read_to_string(&file_path)
                .await
                .context("Failed to read jobs.json")?;
            match parse_table(&content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::error!(
                        "jobs.json is corrupted ({:#}), creating backup and starting empty",
                        e
                    );
                    let backup_path = data_dir.join("jobs.json.bak");
                    if let Err(backup_err) = tokio::fs::copy(&file_path, &backup_path).await {
                        tracing::error!(
                            "Failed to create backup of corrupted jobs.json: {}",
                            backup_err
                        );
                    }
                    load_error = Some(format!("jobs.json could not be loaded: {:#}", e));
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        tracing::debug!("Loaded {} jobs from {}", jobs.len(), file_path.display());

        Ok(Self {
            file_path,
            cache: RwLock::new(jobs),
            load_error,
        })
    }

    /// Atomically write the jobs cache to disk.
    /// Writes and syncs a .tmp file first, then renames it over the table.
    async fn persist(&self, jobs: &[Job]) -> Result<()> {
        let tmp_path = self.file_path.with_extension("json.tmp");

        let json =
            serde_json::to_string_pretty(&JobTable(jobs)).context("Failed to serialize jobs")?;

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .context("Failed to create temporary jobs file")?;
        file.write_all(json.as_bytes())
            .await
            .context("Failed to write temporary jobs file")?;
        file.sync_all()
            .await
            .context("Failed to sync temporary jobs file")?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.file_path)
            .await
            .context("Failed to rename temporary jobs file")?;

        Ok(())
    }

    /// Persist `jobs`, logging failures before handing them back.
    async fn commit(&self, jobs: &[Job]) -> Result<(), TrmError> {
        self.persist(jobs).await.map_err(|e| {
            tracing::error!("Failed to persist job table: {:#}", e);
            TrmError::from(e)
        })
    }
}

#[async_trait]
impl JobStore for JsonJobStore {
    async fn list(&self) -> Result<Vec<Job>, TrmError> {
        let cache = self.cache.read().await;
        Ok(cache.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Job, TrmError> {
        let cache = self.cache.read().await;
        cache
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| TrmError::job_not_found(id))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Job>, TrmError> {
        let cache = self.cache.read().await;
        Ok(cache.iter().find(|j| j.name == name).cloned())
    }

    async fn upsert(&self, job: Job) -> Result<(), TrmError> {
        let mut cache = self.cache.write().await;
        let mut next = cache.clone();
        match next.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => next.push(job),
        }
        self.commit(&next).await?;
        *cache = next;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), TrmError> {
        let mut cache = self.cache.write().await;
        let idx = cache
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| TrmError::job_not_found(id))?;

        let mut next = cache.clone();
        next.remove(idx);
        self.commit(&next).await?;
        *cache = next;
        Ok(())
    }

    async fn update_atomic(&self, id: Uuid, mutator: Mutator) -> Result<Job, TrmError> {
        let mut cache = self.cache.write().await;
        let idx = cache
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| TrmError::job_not_found(id))?;

        let mut updated = mutator(cache[idx].clone())?;
        if updated.id != id {
            return Err(TrmError::Internal(format!(
                "update of job '{}' tried to change its id",
                id
            )));
        }
        updated.touch();

        let mut next = cache.clone();
        next[idx] = updated.clone();
        self.commit(&next).await?;
        *cache = next;
        Ok(updated)
    }

    fn load_error(&self) -> Option<String> {
        self.load_error.clone()
    }
}
