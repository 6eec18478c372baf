//! folio-server: live-editing server and maintenance commands.
//!
//! `serve` runs the WebSocket endpoint together with the snapshot and
//! indexing workers. The other subcommands run one piece of the pipeline
//! against the configured store and exit.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use folio_collab::{
    spawn_worker, AccessControl, Config, DocumentRecord, DocumentStore, IndexingWorker, MergeEngine, Repository,
    SearchIndex, SnapshotWorker, StaticAccess, SyncServer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "folio-server", version, about = "Collaborative page editing server")]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve WebSocket clients and run the background workers
    Serve,
    /// Run one snapshot pass
    Snapshot {
        /// Consider every page, not just the recent window
        #[arg(long)]
        all: bool,
    },
    /// Run one indexing pass
    Reindex {
        #[arg(long)]
        all: bool,
    },
    /// Search indexed blocks
    Search {
        query: String,
        /// Restrict to one project
        #[arg(long)]
        project: Option<Uuid>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Suggest headings by prefix instead
        #[arg(long)]
        headings: bool,
    },
    /// Register a page so clients can connect to it
    AddDocument {
        #[arg(long)]
        project: Uuid,
        #[arg(long)]
        title: String,
    },
    /// Delete a page and everything derived from it
    DeleteDocument { id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level)).init();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let store = Arc::new(
        DocumentStore::open(config.storage.clone())
            .with_context(|| format!("opening store at {}", config.storage.path.display()))?,
    );
    let repo: Arc<dyn Repository> = store.clone();

    match cli.command {
        Command::Serve => serve(config, repo).await?,

        Command::Snapshot { all } => {
            let engine = config.engine.build().context("building merge engine")?;
            let worker = SnapshotWorker::new(repo, engine, config.snapshot.clone());
            let since = since(all, config.snapshot.window());
            println!("{}", worker.run_since(since).await);
        }

        Command::Reindex { all } => {
            let engine = config.engine.build().context("building merge engine")?;
            let worker = IndexingWorker::new(repo, engine, config.indexing.clone());
            let since = since(all, config.indexing.window());
            println!("{}", worker.run_since(since).await);
        }

        Command::Search {
            query,
            project,
            limit,
            headings,
        } => {
            let index = SearchIndex::new(repo);
            if headings {
                for hit in index.suggest_headings(&query, limit)? {
                    println!("{}  h{}  {}", hit.document_id, hit.level, hit.text);
                }
            } else {
                let scope = project.map(|p| index.project_scope(p)).transpose()?;
                for hit in index.search(&query, scope.as_deref(), limit)? {
                    let path = hit.heading_path.join(" › ");
                    println!("{}  #{}  [{}]  {}  {}", hit.document_id, hit.position, hit.block_type, path, hit.snippet);
                }
            }
        }

        Command::AddDocument { project, title } => {
            let doc = DocumentRecord::new(project, title);
            repo.put_document(&doc)?;
            println!("{}", doc.id);
        }

        Command::DeleteDocument { id } => {
            if repo.get_document(id)?.is_none() {
                anyhow::bail!("page {id} does not exist");
            }
            repo.delete_document(id)?;
            log::info!("Deleted page {id}");
        }
    }

    store.flush()?;
    Ok(())
}

fn since(all: bool, window: chrono::Duration) -> DateTime<Utc> {
    if all {
        DateTime::<Utc>::MIN_UTC
    } else {
        Utc::now() - window
    }
}

async fn serve(config: Config, repo: Arc<dyn Repository>) -> anyhow::Result<()> {
    let engine: Arc<dyn MergeEngine> = config.engine.build().context("building merge engine")?;
    let access: Arc<dyn AccessControl> = Arc::new(StaticAccess::from_config(&config.access));
    if config.access.tokens.is_empty() {
        log::warn!("No access tokens configured; every connection will be refused");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut workers = Vec::new();
    if config.snapshot.enabled {
        let job = Arc::new(SnapshotWorker::new(repo.clone(), engine.clone(), config.snapshot.clone()));
        workers.push(spawn_worker(job, config.snapshot.clone(), stop_rx.clone()));
    }
    if config.indexing.enabled {
        let job = Arc::new(IndexingWorker::new(repo.clone(), engine.clone(), config.indexing.clone()));
        workers.push(spawn_worker(job, config.indexing.clone(), stop_rx.clone()));
    }

    let server = SyncServer::new(config.server.clone(), repo, access);
    let result = server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await;

    let _ = stop_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            log::warn!("Worker task ended abnormally: {e}");
        }
    }

    let stats = server.stats().await;
    log::info!(
        "Served {} connections ({} refused), {} frames",
        stats.total_connections,
        stats.rejected_handshakes,
        stats.total_messages
    );
    result.with_context(|| format!("serving on {}", server.bind_addr()))
}
