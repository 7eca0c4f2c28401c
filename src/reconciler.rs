//! Background Reconciler
//!
//! Periodically copies dirty cache entries into the durable store so the
//! store converges on every confirmed redemption.
//!
//! A run scans the gift key prefix, flushes each dirty entry and records the
//! outcome. One failing key never stops the run; its entry stays dirty and is
//! picked up again next time. Runs are idempotent: with no new redemptions a
//! second run finds nothing to write.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::GiftError;
use crate::repository::{FlushOutcome, GiftRepository};
use crate::traits::CacheCodec;

/// Outcome of a single reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Keys seen under the gift prefix
    pub scanned: usize,
    /// Dirty entries written to the store and cleared
    pub flushed: usize,
    /// Written, but a newer redemption arrived meanwhile; still dirty
    pub superseded: usize,
    /// Dirty entries of gifts that no longer exist, dropped
    pub orphaned: usize,
    /// Keys that failed and stay dirty
    pub failed: usize,
    pub elapsed: Duration,
}

impl ReconcileReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.superseded == 0
    }
}

/// Lifetime totals across runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub runs: u64,
    /// Runs aborted because the key scan itself failed
    pub failed_runs: u64,
    pub flushed: u64,
    pub superseded: u64,
    pub orphaned: u64,
    pub failed_keys: u64,
}

#[derive(Debug, Default)]
struct AtomicReconcilerStats {
    runs: AtomicU64,
    failed_runs: AtomicU64,
    flushed: AtomicU64,
    superseded: AtomicU64,
    orphaned: AtomicU64,
    failed_keys: AtomicU64,
}

impl AtomicReconcilerStats {
    fn snapshot(&self) -> ReconcilerStats {
        ReconcilerStats {
            runs: self.runs.load(Ordering::Relaxed),
            failed_runs: self.failed_runs.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            failed_keys: self.failed_keys.load(Ordering::Relaxed),
        }
    }

    fn add(&self, report: &ReconcileReport) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.flushed.fetch_add(report.flushed as u64, Ordering::Relaxed);
        self.superseded.fetch_add(report.superseded as u64, Ordering::Relaxed);
        self.orphaned.fetch_add(report.orphaned as u64, Ordering::Relaxed);
        self.failed_keys.fetch_add(report.failed as u64, Ordering::Relaxed);
    }
}

/// Periodic flusher of dirty cache entries
pub struct Reconciler<C: CacheCodec + 'static = crate::codecs::JsonCodec> {
    repo: Arc<GiftRepository<C>>,
    interval: Duration,
    stats: Arc<AtomicReconcilerStats>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: CacheCodec + 'static> Reconciler<C> {
    pub fn new(repo: Arc<GiftRepository<C>>, interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            repo,
            interval,
            stats: Arc::new(AtomicReconcilerStats::default()),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn stats(&self) -> ReconcilerStats {
        self.stats.snapshot()
    }

    /// Run one reconciliation pass now
    ///
    /// # Errors
    ///
    /// Only a failed key scan aborts the run. Per-key failures are counted
    /// in the report instead.
    pub async fn run_once(&self) -> Result<ReconcileReport, GiftError> {
        run_pass(&self.repo, &self.stats).await
    }

    /// Start the periodic task. The first pass runs one interval after start.
    ///
    /// Starting an already running reconciler is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let repo = Arc::clone(&self.repo);
        let stats = Arc::clone(&self.stats);
        let period = self.interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(interval_secs = period.as_secs(), "Starting gift reconciler");
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = run_pass(&repo, &stats).await {
                            error!(error = %e, "Reconciliation run aborted");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Gift reconciler shutting down...");
                        break;
                    }
                }
            }
        }));
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the periodic task, letting an in-flight pass finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reconciler task ended abnormally");
            }
        }
    }
}

async fn run_pass<C: CacheCodec>(
    repo: &GiftRepository<C>,
    stats: &AtomicReconcilerStats,
) -> Result<ReconcileReport, GiftError> {
    let started = Instant::now();
    let keys = match repo.scan_keys().await {
        Ok(keys) => keys,
        Err(e) => {
            stats.failed_runs.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
    };

    let mut report = ReconcileReport {
        scanned: keys.len(),
        ..ReconcileReport::default()
    };

    for key in &keys {
        match repo.flush_key(key).await {
            Ok(FlushOutcome::Clean) => {}
            Ok(FlushOutcome::Flushed) => report.flushed += 1,
            Ok(FlushOutcome::Superseded) => report.superseded += 1,
            Ok(FlushOutcome::Orphaned) => report.orphaned += 1,
            Err(e) => {
                report.failed += 1;
                warn!(key = %key, error = %e, "Failed to flush dirty gift entry");
            }
        }
    }

    report.elapsed = started.elapsed();
    stats.add(&report);

    if report.flushed + report.superseded + report.orphaned + report.failed > 0 {
        info!(
            scanned = report.scanned,
            flushed = report.flushed,
            superseded = report.superseded,
            orphaned = report.orphaned,
            failed = report.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Reconciliation run finished"
        );
    } else {
        debug!(scanned = report.scanned, "Reconciliation run found nothing dirty");
    }
    Ok(report)
}
