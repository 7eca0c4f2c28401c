//! Redemption Serializer
//!
//! Every state-changing operation on a code's cached usage goes through one
//! long-lived worker task. Callers enqueue a job on a bounded channel together
//! with a private reply channel and wait for the worker's answer, so the
//! read-check-write in [`GiftRepository::increase_used_count`] never
//! interleaves with another redemption or with a direct update.
//!
//! A full queue suspends the caller in `send` until a slot frees up.
//!
//! Shutdown stops intake and drains whatever was already queued; every
//! accepted job gets an answer.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::GiftError;
use crate::gift::Gift;
use crate::repository::GiftRepository;
use crate::traits::CacheCodec;

type Reply = oneshot::Sender<Result<Gift, GiftError>>;

enum Job {
    Redeem { code: String, reply: Reply },
    Update { gift: Gift, reply: Reply },
}

/// Worker statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializerStats {
    /// Redemptions counted
    pub redeemed: u64,
    /// Jobs rejected with a client fault (unknown code, limit reached, ...)
    pub rejected: u64,
    /// Jobs that failed on cache or store I/O
    pub failed: u64,
    /// Direct updates applied
    pub updates: u64,
    /// Answers nobody was waiting for any more
    pub abandoned_replies: u64,
}

#[derive(Debug, Default)]
struct AtomicSerializerStats {
    redeemed: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    updates: AtomicU64,
    abandoned_replies: AtomicU64,
}

impl AtomicSerializerStats {
    fn snapshot(&self) -> SerializerStats {
        SerializerStats {
            redeemed: self.redeemed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            abandoned_replies: self.abandoned_replies.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &Result<Gift, GiftError>) {
        match result {
            Ok(_) => {}
            Err(e) if e.is_client_fault() => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Handle to the single redemption worker
pub struct RedemptionSerializer {
    tx: mpsc::Sender<Job>,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<AtomicSerializerStats>,
}

impl RedemptionSerializer {
    /// Spawn the worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C: CacheCodec + 'static>(repo: Arc<GiftRepository<C>>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_rx = shutdown_tx.subscribe();
        let stats = Arc::new(AtomicSerializerStats::default());

        info!(capacity, "Starting redemption worker");
        let worker = tokio::spawn(run_worker(repo, rx, shutdown_rx, Arc::clone(&stats)));

        Self {
            tx,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
            stats,
        }
    }

    /// Count one redemption of `code` and return the gift as it now stands
    ///
    /// # Errors
    ///
    /// - [`GiftError::InvalidGiftCode`] / [`GiftError::UsageLimitReached`]
    /// - cache or store failures raised inside the worker
    /// - [`GiftError::WorkerStopped`] if the worker no longer accepts jobs
    pub async fn redeem(&self, code: &str) -> Result<Gift, GiftError> {
        let (reply, answer) = oneshot::channel();
        self.submit(Job::Redeem {
            code: code.to_string(),
            reply,
        })
        .await?;
        answer.await.map_err(|_| GiftError::WorkerStopped)?
    }

    /// Apply a full-row update without racing redemptions of the same gift
    ///
    /// # Errors
    ///
    /// See [`GiftRepository::update_direct`]; also [`GiftError::WorkerStopped`].
    pub async fn update(&self, gift: Gift) -> Result<Gift, GiftError> {
        let (reply, answer) = oneshot::channel();
        self.submit(Job::Update { gift, reply }).await?;
        answer.await.map_err(|_| GiftError::WorkerStopped)?
    }

    async fn submit(&self, job: Job) -> Result<(), GiftError> {
        self.tx.send(job).await.map_err(|_| GiftError::WorkerStopped)
    }

    /// Jobs waiting in the queue
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    #[must_use]
    pub fn stats(&self) -> SerializerStats {
        self.stats.snapshot()
    }

    /// Stop accepting jobs, finish the queued ones and wait for the worker
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Redemption worker ended abnormally");
            }
        }
    }
}

async fn run_worker<C: CacheCodec>(
    repo: Arc<GiftRepository<C>>,
    mut rx: mpsc::Receiver<Job>,
    mut shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<AtomicSerializerStats>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            job = rx.recv() => match job {
                Some(job) => process(&repo, job, &stats).await,
                None => {
                    info!("Redemption queue closed, worker exiting");
                    return;
                }
            },
        }
    }

    rx.close();
    let mut drained = 0usize;
    while let Some(job) = rx.recv().await {
        process(&repo, job, &stats).await;
        drained += 1;
    }
    info!(drained, "Redemption worker stopped");
}

async fn process<C: CacheCodec>(repo: &GiftRepository<C>, job: Job, stats: &AtomicSerializerStats) {
    let (result, reply) = match job {
        Job::Redeem { code, reply } => {
            let result = repo.increase_used_count(&code).await;
            if result.is_ok() {
                stats.redeemed.fetch_add(1, Ordering::Relaxed);
            }
            (result, reply)
        }
        Job::Update { gift, reply } => {
            let result = repo.update_direct(&gift).await;
            if result.is_ok() {
                stats.updates.fetch_add(1, Ordering::Relaxed);
            }
            (result, reply)
        }
    };
    stats.record(&result);

    if let Err(e) = &result {
        if !e.is_client_fault() {
            warn!(error = %e, "Redemption worker job failed");
        }
    }
    if reply.send(result).is_err() {
        // Caller gave up waiting; the outcome stands
        stats.abandoned_replies.fetch_add(1, Ordering::Relaxed);
        debug!("Dropped redemption answer for a departed caller");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::DashMapCache;
    use crate::store::MemoryGiftStore;
    use chrono::Utc;

    async fn setup(usage_limit: i64) -> Arc<GiftRepository> {
        let repo = Arc::new(GiftRepository::new(
            Arc::new(DashMapCache::new()),
            Arc::new(MemoryGiftStore::new()),
        ));
        repo.create(&Gift::new("CODE", 100, usage_limit, Utc::now(), Utc::now()))
            .await
            .unwrap();
        repo
    }

    #[tokio::test]
    async fn test_redeem_answers_each_caller() {
        let repo = setup(2).await;
        let serializer = RedemptionSerializer::start(Arc::clone(&repo), 4);

        assert_eq!(serializer.redeem("CODE").await.unwrap().used_count, 1);
        assert_eq!(serializer.redeem("CODE").await.unwrap().used_count, 2);
        assert!(matches!(
            serializer.redeem("CODE").await,
            Err(GiftError::UsageLimitReached(_))
        ));

        let stats = serializer.stats();
        assert_eq!((stats.redeemed, stats.rejected), (2, 1));
        serializer.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_reports_stopped_worker() {
        let repo = setup(0).await;
        let serializer = RedemptionSerializer::start(repo, 4);
        serializer.shutdown().await;
        serializer.shutdown().await;

        assert!(!serializer.is_running());
        assert!(matches!(
            serializer.redeem("CODE").await,
            Err(GiftError::WorkerStopped)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_drains_queued_jobs() {
        let repo = setup(0).await;
        let serializer = Arc::new(RedemptionSerializer::start(Arc::clone(&repo), 64));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let serializer = Arc::clone(&serializer);
            handles.push(tokio::spawn(async move { serializer.redeem("CODE").await }));
        }
        // Let every caller get its job into the queue
        while serializer.stats().redeemed + (serializer.queued() as u64) < 32 {
            tokio::task::yield_now().await;
        }
        serializer.shutdown().await;

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(repo.get_by_code("CODE").await.unwrap().used_count, 32);
    }
}
