//! Background consolidation loops.
//!
//! ```text
//!            ┌──────── every interval (first tick immediately) ────────┐
//!            ▼                                                          │
//!   documents_updated_since(now - window) ──► per-document work ──► CycleReport
//!                                               │ errors: log, count, continue
//!                                               └─ whole cycle bounded by cycle_timeout
//! ```
//!
//! [`SnapshotWorker`] folds each recently edited page's update log into a
//! new snapshot; [`IndexingWorker`] re-extracts search blocks from the
//! latest snapshot. They run on independent timers and never touch the
//! live hub.

pub mod indexing;
pub mod snapshot;

pub use indexing::{IndexOutcome, IndexingWorker};
pub use snapshot::{SnapshotOutcome, SnapshotWorker};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::EngineError;
use crate::storage::StoreError;

/// Timer settings for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Seconds between cycle starts
    pub interval_secs: u64,
    /// How far back `updated_at` is considered recent; wider than the interval
    pub window_secs: u64,
    /// A cycle running longer than this is abandoned
    pub cycle_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn snapshot_defaults() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            window_secs: 900,
            cycle_timeout_secs: 240,
        }
    }

    pub fn indexing_defaults() -> Self {
        Self {
            enabled: true,
            interval_secs: 120,
            window_secs: 600,
            cycle_timeout_secs: 100,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.window_secs).unwrap_or(i64::MAX / 1000))
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs.max(1))
    }
}

/// Tally of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Recently updated documents looked at
    pub examined: usize,
    /// Snapshots inserted or block sets replaced
    pub written: usize,
    /// Merged state identical to the latest snapshot
    pub unchanged: usize,
    /// Nothing to consolidate: no updates, or no snapshot yet
    pub empty: usize,
    pub failed: usize,
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined={} written={} unchanged={} empty={} failed={}",
            self.examined, self.written, self.unchanged, self.empty, self.failed
        )
    }
}

/// Per-document failure. The cycle logs it and moves on.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// One periodic consolidation job.
#[async_trait]
pub trait BackgroundJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Consolidate every recently updated document once.
    async fn run_cycle(&self) -> CycleReport;
}

/// Run `job` once immediately and then every `config.interval()`, until
/// `shutdown` becomes `true`. A cycle in flight when shutdown arrives is
/// dropped at its next await point.
pub fn spawn_worker<J: BackgroundJob>(
    job: Arc<J>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        log::info!(
            "{} worker started (interval {}s, window {}s)",
            job.name(),
            config.interval_secs,
            config.window_secs
        );

        loop {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                _ = ticker.tick() => {
                    let cycle = tokio::time::timeout(config.cycle_timeout(), job.run_cycle());
                    tokio::select! {
                        biased;
                        _ = shutdown.wait_for(|stop| *stop) => {
                            log::info!("{} cycle interrupted by shutdown", job.name());
                            break;
                        }
                        outcome = cycle => match outcome {
                            Ok(report) => log::info!("{} cycle: {report}", job.name()),
                            Err(_) => log::warn!(
                                "{} cycle exceeded {}s and was abandoned",
                                job.name(),
                                config.cycle_timeout_secs
                            ),
                        },
                    }
                }
            }
        }

        log::info!("{} worker stopped", job.name());
    })
}
