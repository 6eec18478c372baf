//! Persistence pipeline integration tests.
//!
//! Verifies:
//! - Real Yrs deltas relayed by the server land in the update log
//! - Snapshot worker folds the log into versioned states
//! - Indexing worker turns the latest snapshot into search blocks
//! - The log survives a store restart
//! - Deleting a page cascades to everything derived from it

mod common;

use common::*;
use chrono::{DateTime, Utc};
use folio_collab::engine::{MergeEngine, YrsEngine};
use folio_collab::protocol::{decode_bytes, Envelope};
use folio_collab::search::SearchIndex;
use folio_collab::storage::{DocumentRecord, DocumentStore, Repository, StoreConfig};
use folio_collab::worker::{IndexOutcome, IndexingWorker, SnapshotOutcome, SnapshotWorker, WorkerConfig};
use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Append `insert` to the page body of `doc`, returning just that delta.
fn make_delta(doc: &Doc, insert: &str) -> Vec<u8> {
    let sv = doc.transact().state_vector().encode_v1();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        let len = text.get_string(&txn).len() as u32;
        text.insert(&mut txn, len, insert);
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::decode_v1(&sv).unwrap())
}

fn apply(doc: &Doc, delta: &[u8]) {
    let mut txn = doc.transact_mut();
    txn.apply_update(Update::decode_v1(delta).unwrap()).unwrap();
}

fn body(doc: &Doc) -> String {
    let txn = doc.transact();
    txn.get_text("content").map(|t| t.get_string(&txn)).unwrap_or_default()
}

fn workers(repo: Arc<dyn Repository>) -> (SnapshotWorker, IndexingWorker) {
    let engine: Arc<dyn MergeEngine> = Arc::new(YrsEngine::new());
    (
        SnapshotWorker::new(repo.clone(), engine.clone(), WorkerConfig::snapshot_defaults()),
        IndexingWorker::new(repo, engine, WorkerConfig::indexing_defaults()),
    )
}

// ─── Live edits to search ────────────────────────────────────────────────────

#[tokio::test]
async fn test_live_edits_flow_into_snapshot_and_search() {
    let server = start_test_server().await;
    let page = server.page("Handbook");

    let mut alice = server.connect("t-alice", page.id).await;
    let mut bob = server.connect("t-bob", page.id).await;
    sync(&mut alice, page.id).await;
    sync(&mut bob, page.id).await;

    let alice_doc = Doc::new();
    let bob_doc = Doc::new();

    let d1 = make_delta(&alice_doc, "# Install Guide\n\nDownload the installer first.\n");
    send(&mut alice, &Envelope::update(&d1)).await;
    let relayed = recv(&mut bob).await.update_payload().unwrap();
    apply(&bob_doc, &decode_bytes(&relayed.update).unwrap());

    let d2 = make_delta(&bob_doc, "\n## Troubleshooting\n\n- restart the daemon\n");
    send(&mut bob, &Envelope::update(&d2)).await;
    let relayed = recv(&mut alice).await.update_payload().unwrap();
    apply(&alice_doc, &decode_bytes(&relayed.update).unwrap());
    assert_eq!(body(&alice_doc), body(&bob_doc));

    // A fresh client rebuilds the same body from the log alone.
    let mut carol = server.connect("t-carol", page.id).await;
    let carol_doc = Doc::new();
    for delta in sync(&mut carol, page.id).await {
        apply(&carol_doc, &delta);
    }
    assert_eq!(body(&carol_doc), body(&alice_doc));

    let repo: Arc<dyn Repository> = server.store.clone();
    let (snapshots, indexer) = workers(repo.clone());

    let report = snapshots.run_since(DateTime::<Utc>::MIN_UTC).await;
    assert_eq!(report.written, 1);
    let snapshot = repo.latest_snapshot(page.id).unwrap().unwrap();
    assert_eq!(snapshot.version, 1);
    assert_eq!(YrsEngine::body_text(&snapshot.state).unwrap(), body(&alice_doc));

    let outcome = indexer.index_document(page.id).await.unwrap();
    assert!(matches!(outcome, IndexOutcome::Indexed { version: 1, .. }));

    let blocks = repo.list_blocks(page.id).unwrap();
    let types: Vec<&str> = blocks.iter().map(|b| b.block_type.as_str()).collect();
    assert_eq!(types, vec!["heading", "paragraph", "heading", "bulletListItem"]);
    assert_eq!(blocks[3].heading_path, vec!["Install Guide", "Troubleshooting"]);

    let search = SearchIndex::new(repo.clone());
    let hits = search.search("install", None, 10).unwrap();
    assert_eq!(hits[0].block_type, "heading");
    assert_eq!(hits[0].tier, 0);
    assert!(hits.iter().all(|h| h.document_id == page.id));

    let suggestions = search.suggest_headings("trou", 5).unwrap();
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].text, "Troubleshooting");
    assert_eq!(suggestions[0].level, 2);
}

#[tokio::test]
async fn test_unchanged_log_writes_no_new_snapshot() {
    let dir = tempdir().unwrap();
    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let repo: Arc<dyn Repository> = store.clone();
    let page = DocumentRecord::new(Uuid::new_v4(), "Stable");
    repo.put_document(&page).unwrap();

    let doc = Doc::new();
    repo.append_update(page.id, "alice", &make_delta(&doc, "# Stable\n")).unwrap();

    let (snapshots, _) = workers(repo.clone());
    assert_eq!(snapshots.snapshot_document(page.id).await.unwrap(), SnapshotOutcome::Written(1));
    assert_eq!(snapshots.snapshot_document(page.id).await.unwrap(), SnapshotOutcome::Unchanged(1));

    repo.append_update(page.id, "alice", &make_delta(&doc, "More text\n")).unwrap();
    assert_eq!(snapshots.snapshot_document(page.id).await.unwrap(), SnapshotOutcome::Written(2));
    assert_eq!(repo.list_snapshots(page.id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_reindex_replaces_previous_blocks() {
    let dir = tempdir().unwrap();
    let repo: Arc<dyn Repository> =
        Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let page = DocumentRecord::new(Uuid::new_v4(), "Changing");
    repo.put_document(&page).unwrap();
    let (snapshots, indexer) = workers(repo.clone());

    let doc = Doc::new();
    repo.append_update(page.id, "alice", &make_delta(&doc, "# Alpha\n")).unwrap();
    snapshots.snapshot_document(page.id).await.unwrap();
    indexer.index_document(page.id).await.unwrap();
    assert_eq!(repo.list_blocks(page.id).unwrap().len(), 1);

    repo.append_update(page.id, "alice", &make_delta(&doc, "\n# Beta\n\nbody\n")).unwrap();
    snapshots.snapshot_document(page.id).await.unwrap();
    indexer.index_document(page.id).await.unwrap();

    let blocks = repo.list_blocks(page.id).unwrap();
    let positions: Vec<u32> = blocks.iter().map(|b| b.position).collect();
    assert_eq!(positions, vec![0, 1, 2]);
    let search = SearchIndex::new(repo.clone());
    assert_eq!(search.search("alpha", None, 10).unwrap().len(), 1);
    let beta = search.search("beta", None, 10).unwrap();
    assert_eq!(beta[0].block_type, "heading");
    assert_eq!(beta[0].tier, 0);
}

// ─── Durability ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_update_log_survives_restart() {
    let dir = tempdir().unwrap();
    let page = DocumentRecord::new(Uuid::new_v4(), "Durable");
    let doc = Doc::new();
    let deltas: Vec<Vec<u8>> = ["one ", "two ", "three"].iter().map(|s| make_delta(&doc, s)).collect();

    {
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        store.put_document(&page).unwrap();
        for delta in &deltas {
            store.append_update(page.id, "alice", delta).unwrap();
        }
        store.flush().unwrap();
    }

    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let log: Vec<Vec<u8>> = store.list_updates(page.id).unwrap().into_iter().map(|u| u.delta).collect();
    assert_eq!(log, deltas);

    let merged = YrsEngine::new().apply(&log).await.unwrap();
    assert_eq!(YrsEngine::body_text(&merged).unwrap(), "one two three");

    // New appends continue after the recovered log.
    let next = store.append_update(page.id, "bob", &make_delta(&doc, "!")).unwrap();
    let ids: Vec<u64> = store.list_updates(page.id).unwrap().iter().map(|u| u.id).collect();
    assert_eq!(ids.last(), Some(&next.id));
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_delete_document_cascades() {
    let dir = tempdir().unwrap();
    let repo: Arc<dyn Repository> =
        Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let keep = DocumentRecord::new(Uuid::new_v4(), "Keep");
    let gone = DocumentRecord::new(keep.project_id, "Gone");
    repo.put_document(&keep).unwrap();
    repo.put_document(&gone).unwrap();
    let (snapshots, indexer) = workers(repo.clone());

    for (page, text) in [(&keep, "# Keep heading\n"), (&gone, "# Gone heading\n")] {
        let doc = Doc::new();
        repo.append_update(page.id, "alice", &make_delta(&doc, text)).unwrap();
        snapshots.snapshot_document(page.id).await.unwrap();
        indexer.index_document(page.id).await.unwrap();
    }

    repo.delete_document(gone.id).unwrap();

    assert!(repo.get_document(gone.id).unwrap().is_none());
    assert!(repo.list_updates(gone.id).unwrap().is_empty());
    assert!(repo.latest_snapshot(gone.id).unwrap().is_none());
    assert!(repo.list_blocks(gone.id).unwrap().is_empty());

    let search = SearchIndex::new(repo.clone());
    let hits = search.search("heading", None, 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, keep.id);
    assert_eq!(repo.list_updates(keep.id).unwrap().len(), 1);
}
