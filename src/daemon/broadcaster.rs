//! Latest progress per job, readable on demand or pushed to subscribers on a
//! fixed tick. Subscribers sit on a `watch` channel, so a stalled one only
//! ever sees the newest feed and never slows ingestion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::models::{Job, Progress};

/// One push to subscribers: the full map plus the ids that changed (or were
/// cleared) since the previous push.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressFeed {
    pub sequence: u64,
    pub jobs: HashMap<Uuid, Progress>,
    pub changed: Vec<Uuid>,
    pub emitted_at: DateTime<Utc>,
}

impl ProgressFeed {
    fn empty() -> Self {
        Self {
            sequence: 0,
            jobs: HashMap::new(),
            changed: Vec::new(),
            emitted_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct Snapshots {
    latest: HashMap<Uuid, Progress>,
    changed: HashSet<Uuid>,
    sequence: u64,
}

pub struct ProgressBroadcaster {
    snapshots: RwLock<Snapshots>,
    feed_tx: watch::Sender<Arc<ProgressFeed>>,
    interval: Duration,
}

impl ProgressBroadcaster {
    pub fn new(interval: Duration) -> Self {
        let (feed_tx, _) = watch::channel(Arc::new(ProgressFeed::empty()));
        Self {
            snapshots: RwLock::new(Snapshots::default()),
            feed_tx,
            interval,
        }
    }

    pub async fn publish(&self, job_id: Uuid, progress: Progress) {
        let mut snapshots = self.snapshots.write().await;
        snapshots.latest.insert(job_id, progress);
        snapshots.changed.insert(job_id);
    }

    pub async fn clear(&self, job_id: Uuid) {
        let mut snapshots = self.snapshots.write().await;
        if snapshots.latest.remove(&job_id).is_some() {
            snapshots.changed.insert(job_id);
        }
    }

    pub async fn get(&self, job_id: Uuid) -> Option<Progress> {
        self.snapshots.read().await.latest.get(&job_id).cloned()
    }

    /// Pull: the current map for every job with progress.
    pub async fn snapshot(&self) -> HashMap<Uuid, Progress> {
        self.snapshots.read().await.latest.clone()
    }

    /// Rebuild from persisted records.
    pub async fn seed(&self, jobs: &[Job]) {
        let mut snapshots = self.snapshots.write().await;
        for job in jobs {
            match &job.progress {
                Some(progress) if job.status.is_active() => {
                    snapshots.latest.insert(job.id, progress.clone());
                    snapshots.changed.insert(job.id);
                }
                _ => {}
            }
        }
    }

    /// Push subscription. Dropping it unsubscribes.
    pub fn subscribe(&self) -> ProgressSubscription {
        ProgressSubscription {
            rx: self.feed_tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed_tx.receiver_count()
    }

    /// Emit one feed if anyone is listening. Returns whether it did.
    pub async fn tick(&self) -> bool {
        let mut snapshots = self.snapshots.write().await;
        if self.feed_tx.receiver_count() == 0 {
            snapshots.changed.clear();
            return false;
        }
        snapshots.sequence += 1;
        let mut changed: Vec<Uuid> = snapshots.changed.drain().collect();
        changed.sort();
        let feed = ProgressFeed {
            sequence: snapshots.sequence,
            jobs: snapshots.latest.clone(),
            changed,
            emitted_at: Utc::now(),
        };
        self.feed_tx.send_replace(Arc::new(feed));
        true
    }

    /// Tick until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    tracing::debug!("Progress broadcaster stopping");
                    break;
                }
            }
        }
    }
}

pub struct ProgressSubscription {
    rx: watch::Receiver<Arc<ProgressFeed>>,
}

impl ProgressSubscription {
    /// Wait for the next feed. `None` once the broadcaster is gone.
    pub async fn next(&mut self) -> Option<Arc<ProgressFeed>> {
        self.rx.changed().await.ok()?;
        let feed = self.rx.borrow_and_update().clone();
        Some(feed)
    }

    pub fn into_receiver(self) -> watch::Receiver<Arc<ProgressFeed>> {
        self.rx
    }
}
