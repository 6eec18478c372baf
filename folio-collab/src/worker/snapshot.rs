//! Snapshot worker: update log → merged state → versioned snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::{BackgroundJob, CycleReport, WorkerConfig, WorkerError};
use crate::engine::MergeEngine;
use crate::storage::Repository;

/// What one document's snapshot pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// A new snapshot was stored with this version
    Written(u64),
    /// Merged state equals the latest snapshot byte for byte
    Unchanged(u64),
    /// The document has no updates yet
    NoUpdates,
}

pub struct SnapshotWorker {
    repo: Arc<dyn Repository>,
    engine: Arc<dyn MergeEngine>,
    config: WorkerConfig,
}

impl SnapshotWorker {
    pub fn new(repo: Arc<dyn Repository>, engine: Arc<dyn MergeEngine>, config: WorkerConfig) -> Self {
        Self { repo, engine, config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Snapshot every document updated at or after `since`.
    pub async fn run_since(&self, since: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();
        let documents = match self.repo.documents_updated_since(since) {
            Ok(docs) => docs,
            Err(e) => {
                log::error!("Snapshot cycle could not list recent pages: {e}");
                report.failed += 1;
                return report;
            }
        };

        for doc in documents {
            report.examined += 1;
            match self.snapshot_document(doc.id).await {
                Ok(SnapshotOutcome::Written(version)) => {
                    log::debug!("Page {} snapshot v{version} written", doc.id);
                    report.written += 1;
                }
                Ok(SnapshotOutcome::Unchanged(_)) => report.unchanged += 1,
                Ok(SnapshotOutcome::NoUpdates) => report.empty += 1,
                Err(e) => {
                    log::error!("Snapshot of page {} failed: {e}", doc.id);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Replay one document's full update log and store the result if it
    /// differs from the latest snapshot.
    pub async fn snapshot_document(&self, document_id: Uuid) -> Result<SnapshotOutcome, WorkerError> {
        let updates = self.repo.list_updates(document_id)?;
        if updates.is_empty() {
            return Ok(SnapshotOutcome::NoUpdates);
        }

        let deltas: Vec<Vec<u8>> = updates.into_iter().map(|u| u.delta).collect();
        let state = self.engine.apply(&deltas).await?;

        if let Some(latest) = self.repo.latest_snapshot(document_id)? {
            if latest.state == state {
                return Ok(SnapshotOutcome::Unchanged(latest.version));
            }
        }

        let snapshot = self.repo.insert_snapshot(document_id, &state)?;
        Ok(SnapshotOutcome::Written(snapshot.version))
    }
}

#[async_trait]
impl BackgroundJob for SnapshotWorker {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    async fn run_cycle(&self) -> CycleReport {
        self.run_since(Utc::now() - self.config.window()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, ExtractedBlock};
    use crate::storage::{DocumentRecord, DocumentStore, StoreConfig};
    use tempfile::TempDir;

    /// Concatenates deltas; rejects any delta starting with 0xFF.
    struct ConcatEngine;

    #[async_trait]
    impl MergeEngine for ConcatEngine {
        async fn apply(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
            let mut state = Vec::new();
            for (index, delta) in updates.iter().enumerate() {
                if delta.first() == Some(&0xFF) {
                    return Err(EngineError::MalformedDelta { index, reason: "poisoned".into() });
                }
                state.extend_from_slice(delta);
            }
            Ok(state)
        }

        async fn extract(&self, _state: &[u8]) -> Result<Vec<ExtractedBlock>, EngineError> {
            Ok(Vec::new())
        }
    }

    fn setup() -> (TempDir, Arc<DocumentStore>, SnapshotWorker) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let worker = SnapshotWorker::new(store.clone(), Arc::new(ConcatEngine), WorkerConfig::snapshot_defaults());
        (dir, store, worker)
    }

    fn page(store: &DocumentStore) -> Uuid {
        let doc = DocumentRecord::new(Uuid::new_v4(), "Page");
        store.put_document(&doc).unwrap();
        doc.id
    }

    #[tokio::test]
    async fn test_snapshot_written_then_unchanged() {
        let (_dir, store, worker) = setup();
        let doc = page(&store);
        store.append_update(doc, "alice", &[1, 2]).unwrap();
        store.append_update(doc, "bob", &[3]).unwrap();

        assert_eq!(worker.snapshot_document(doc).await.unwrap(), SnapshotOutcome::Written(1));
        assert_eq!(store.latest_snapshot(doc).unwrap().unwrap().state, vec![1, 2, 3]);

        assert_eq!(worker.snapshot_document(doc).await.unwrap(), SnapshotOutcome::Unchanged(1));
        assert_eq!(store.list_snapshots(doc).unwrap().len(), 1);

        store.append_update(doc, "alice", &[4]).unwrap();
        assert_eq!(worker.snapshot_document(doc).await.unwrap(), SnapshotOutcome::Written(2));
    }

    #[tokio::test]
    async fn test_no_updates_no_snapshot() {
        let (_dir, store, worker) = setup();
        let doc = page(&store);

        let report = worker.run_cycle().await;
        assert_eq!(report, CycleReport { examined: 1, empty: 1, ..CycleReport::default() });
        assert!(store.latest_snapshot(doc).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_skips_document_and_continues() {
        let (_dir, store, worker) = setup();
        let poisoned = page(&store);
        let healthy = page(&store);
        store.append_update(poisoned, "alice", &[0xFF]).unwrap();
        store.append_update(healthy, "alice", &[5]).unwrap();

        let report = worker.run_cycle().await;
        assert_eq!(report.examined, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.written, 1);
        assert!(store.latest_snapshot(poisoned).unwrap().is_none());
        assert_eq!(store.latest_snapshot(healthy).unwrap().unwrap().state, vec![5]);
        // the update log is untouched
        assert_eq!(store.list_updates(poisoned).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_documents_outside_window_skipped() {
        let (_dir, store, worker) = setup();
        let doc = page(&store);
        store.append_update(doc, "alice", &[1]).unwrap();

        let report = worker.run_since(Utc::now() + chrono::Duration::hours(1)).await;
        assert_eq!(report, CycleReport::default());
        assert!(store.latest_snapshot(doc).unwrap().is_none());
    }
}
