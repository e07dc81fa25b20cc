use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::TrmError;
use crate::storage::LogStore;

/// One append-only text log per job at `<data_dir>/logs/<job_id>.log`.
pub struct FsLogStore {
    logs_dir: PathBuf,
    max_size: u64,
    write_lock: Mutex<()>,
}

impl FsLogStore {
    /// Create a new FsLogStore rooted at data_dir/logs/.
    pub async fn new(data_dir: PathBuf, max_size: u64) -> Result<Self> {
        let logs_dir = data_dir.join("logs");
        tokio::fs::create_dir_all(&logs_dir)
            .await
            .context("Failed to create logs directory")?;
        Ok(Self {
            logs_dir,
            max_size,
            write_lock: Mutex::new(()),
        })
    }

    fn log_path(&self, job_id: Uuid) -> PathBuf {
        self.logs_dir.join(format!("{}.log", job_id))
    }

    async fn append_line(&self, job_id: Uuid, message: &str) -> Result<()> {
        let log_path = self.log_path(job_id);
        let line = format!(
            "[{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            message.trim_end_matches(['\r', '\n'])
        );

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .context("Failed to open log file for appending")?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to append to log file")?;
        file.flush().await.context("Failed to flush log file")?;

        let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        drop(file);
        if self.max_size > 0 && size >= self.max_size {
            truncate_oldest_quarter(&log_path).await?;
        }
        Ok(())
    }
}

/// Drop the oldest 25% of the file, cutting at the next line boundary.
async fn truncate_oldest_quarter(path: &Path) -> Result<()> {
    let content = tokio::fs::read(path)
        .await
        .context("Failed to read log file for truncation")?;
    let quarter = content.len() / 4;
    let cut_point = match content[quarter..].iter().position(|&b| b == b'\n') {
        Some(offset) => quarter + offset + 1,
        // A single very long line: keep it.
        None => return Ok(()),
    };

    let tmp_path = path.with_extension("log.tmp");
    tokio::fs::write(&tmp_path, &content[cut_point..])
        .await
        .context("Failed to write truncated log file")?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .context("Failed to replace truncated log file")?;
    Ok(())
}

#[async_trait]
impl LogStore for FsLogStore {
    async fn append(&self, job_id: Uuid, message: &str) -> Result<(), TrmError> {
        let _guard = self.write_lock.lock().await;
        self.append_line(job_id, message).await.map_err(Into::into)
    }

    async fn read(&self, job_id: Uuid, tail: Option<usize>) -> Result<String, TrmError> {
        let log_path = self.log_path(job_id);

        let content = match tokio::fs::read_to_string(&log_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };

        match tail {
            Some(n) => {
                let lines: Vec<&str> = content.lines().collect();
                let start = lines.len().saturating_sub(n);
                Ok(lines[start..].join("\n"))
            }
            None => Ok(content),
        }
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), TrmError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.log_path(job_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_orphans(&self, known: &[Uuid]) -> Result<usize, TrmError> {
        let _guard = self.write_lock.lock().await;
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.logs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".log"))
            else {
                continue;
            };
            let Ok(job_id) = Uuid::parse_str(stem) else {
                continue;
            };
            if !known.contains(&job_id) {
                tracing::info!("Removing orphaned log for job {}", job_id);
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_store(max_size: u64) -> (FsLogStore, TempDir, Uuid) {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let store = FsLogStore::new(tmp_dir.path().to_path_buf(), max_size)
            .await
            .expect("create store");
        (store, tmp_dir, Uuid::now_v7())
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let (store, tmp, job_id) = setup_store(0).await;
        store.append(job_id, "first line").await.expect("append");
        store.append(job_id, "second line\n").await.expect("append");

        assert!(tmp
            .path()
            .join("logs")
            .join(format!("{}.log", job_id))
            .exists());

        let content = store.read(job_id, None).await.expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] first line"));
        assert!(lines[1].ends_with("] second line"));
    }

    #[tokio::test]
    async fn test_read_tail() {
        let (store, _tmp, job_id) = setup_store(0).await;
        for i in 0..10 {
            store
                .append(job_id, &format!("line {}", i))
                .await
                .expect("append");
        }
        let tail = store.read(job_id, Some(3)).await.expect("read");
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("line 7"));
        assert!(lines[2].ends_with("line 9"));
    }

    #[tokio::test]
    async fn test_read_missing_log_is_empty() {
        let (store, _tmp, job_id) = setup_store(0).await;
        assert_eq!(store.read(job_id, None).await.expect("read"), "");
    }

    #[tokio::test]
    async fn test_remove() {
        let (store, _tmp, job_id) = setup_store(0).await;
        store.append(job_id, "hello").await.expect("append");
        store.remove(job_id).await.expect("remove");
        assert_eq!(store.read(job_id, None).await.expect("read"), "");
        store.remove(job_id).await.expect("removing twice is fine");
    }

    #[tokio::test]
    async fn test_size_cap_drops_oldest_lines() {
        let (store, _tmp, job_id) = setup_store(2048).await;
        for i in 0..200 {
            store
                .append(job_id, &format!("entry number {:04}", i))
                .await
                .expect("append");
        }
        let content = store.read(job_id, None).await.expect("read");
        assert!(content.len() < 2048);
        assert!(!content.contains("entry number 0000"));
        assert!(content.trim_end().ends_with("entry number 0199"));
        for line in content.lines() {
            assert!(line.starts_with('['), "partial line kept: {}", line);
        }
    }

    #[tokio::test]
    async fn test_remove_orphans() {
        let (store, tmp, keep) = setup_store(0).await;
        let orphan = Uuid::now_v7();
        store.append(keep, "keep").await.expect("append");
        store.append(orphan, "orphan").await.expect("append");
        tokio::fs::write(tmp.path().join("logs").join("notes.txt"), b"x")
            .await
            .expect("write stray file");

        let removed = store.remove_orphans(&[keep]).await.expect("cleanup");
        assert_eq!(removed, 1);
        assert!(!store.read(keep, None).await.expect("read").is_empty());
        assert!(store.read(orphan, None).await.expect("read").is_empty());
        assert!(tmp.path().join("logs").join("notes.txt").exists());
    }
}
