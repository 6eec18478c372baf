//! Indexing worker: latest snapshot → engine extraction → search blocks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::{BackgroundJob, CycleReport, WorkerConfig, WorkerError};
use crate::engine::MergeEngine;
use crate::storage::{ContentBlock, Repository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Blocks replaced from the given snapshot version
    Indexed { version: u64, blocks: usize },
    /// No snapshot exists yet
    NoSnapshot,
}

pub struct IndexingWorker {
    repo: Arc<dyn Repository>,
    engine: Arc<dyn MergeEngine>,
    config: WorkerConfig,
}

impl IndexingWorker {
    pub fn new(repo: Arc<dyn Repository>, engine: Arc<dyn MergeEngine>, config: WorkerConfig) -> Self {
        Self { repo, engine, config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Re-index every document updated at or after `since`, plus every
    /// document whose latest snapshot has not been indexed yet.
    ///
    /// Snapshots do not touch `updated_at`, so a page snapshotted after
    /// its edits left the window is only found through the second set.
    pub async fn run_since(&self, since: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();
        let listed = self
            .repo
            .documents_updated_since(since)
            .and_then(|recent| Ok((recent, self.repo.documents_pending_index()?)));
        let (recent, pending) = match listed {
            Ok(sets) => sets,
            Err(e) => {
                log::error!("Indexing cycle could not list pages: {e}");
                report.failed += 1;
                return report;
            }
        };

        let mut seen = HashSet::new();
        let documents = recent.into_iter().chain(pending).filter(|doc| seen.insert(doc.id));
        for doc in documents {
            report.examined += 1;
            match self.index_document(doc.id).await {
                Ok(IndexOutcome::Indexed { version, blocks }) => {
                    log::debug!("Page {} indexed from v{version}: {blocks} blocks", doc.id);
                    report.written += 1;
                }
                Ok(IndexOutcome::NoSnapshot) => report.empty += 1,
                Err(e) => {
                    log::error!("Indexing of page {} failed: {e}", doc.id);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Replace one document's blocks with those extracted from its latest
    /// snapshot. The old set stays in place if extraction fails.
    pub async fn index_document(&self, document_id: Uuid) -> Result<IndexOutcome, WorkerError> {
        let Some(snapshot) = self.repo.latest_snapshot(document_id)? else {
            return Ok(IndexOutcome::NoSnapshot);
        };

        let extracted = self.engine.extract(&snapshot.state).await?;
        let blocks: Vec<ContentBlock> = extracted
            .into_iter()
            .map(|block| block.into_content_block(document_id))
            .collect();
        let count = self.repo.replace_blocks(document_id, snapshot.version, &blocks)?;

        Ok(IndexOutcome::Indexed {
            version: snapshot.version,
            blocks: count,
        })
    }
}

#[async_trait]
impl BackgroundJob for IndexingWorker {
    fn name(&self) -> &'static str {
        "indexing"
    }

    async fn run_cycle(&self) -> CycleReport {
        self.run_since(Utc::now() - self.config.window()).await
    }
}
