use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use sift_context::Chunker;
use sift_embed::{
    BackendKind, EmbedderFactory, EmbeddingProvider, ModelDownloadProgress, WorkerPool,
};
use sift_retriever::RetrieverConfig;
use sift_retriever::retrieval::{FileScanner, IndexOptions, Indexer, SearchOptions, Searcher};
use sift_retriever::sharded::{ShardedIndexer, ShardedSearcher, ShardedVectorStore};
use sift_retriever::storage::{SearchFilter, SearchResult, SqliteVectorStore, VectorStore};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Semantic code search over a local project.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Project root; config and index live in <root>/.sift
    #[arg(short, long, default_value = ".", global = true)]
    root: PathBuf,

    /// Log debug output to stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use the sharded store regardless of config
    #[arg(long, global = true)]
    sharded: bool,

    /// Force an embedding backend instead of probing
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index the project, or only the given files
    Index {
        /// Re-embed chunks that are already stored
        #[arg(long)]
        force: bool,
        files: Vec<PathBuf>,
    },
    /// Search the index
    Search {
        query: String,
        /// Number of results
        #[arg(short, long)]
        k: Option<usize>,
        /// Drop results scoring below this
        #[arg(long)]
        min_score: Option<f32>,
        /// Only files under this path
        #[arg(long)]
        path_prefix: Option<String>,
        /// Only these languages (repeatable)
        #[arg(long)]
        language: Vec<String>,
        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Drop a file from the index
    Remove { path: PathBuf },
    /// Show index statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Probe every embedding backend
    Backends,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Gpu,
    Cpu,
    Remote,
    Hash,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Gpu => BackendKind::Gpu,
            BackendArg::Cpu => BackendKind::Cpu,
            BackendArg::Remote => BackendKind::Remote,
            BackendArg::Hash => BackendKind::Hash,
        }
    }
}

enum Store {
    Single(Arc<SqliteVectorStore>),
    Sharded(Arc<ShardedVectorStore>),
}

impl Store {
    fn as_dyn(&self) -> Arc<dyn VectorStore> {
        match self {
            Store::Single(store) => store.clone() as Arc<dyn VectorStore>,
            Store::Sharded(store) => store.clone() as Arc<dyn VectorStore>,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "sift_retriever=debug,sift_embed=debug,sift_context=debug,info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let root = tokio::fs::canonicalize(&args.root)
        .await
        .with_context(|| format!("project root {} not found", args.root.display()))?;
    let mut config = RetrieverConfig::load(&root)
        .await
        .with_context(|| format!("failed to load {}", RetrieverConfig::config_path(&root).display()))?;
    if let Some(backend) = args.backend {
        config.embed.backend = Some(backend.into());
    }
    if args.sharded {
        config.store.sharded = true;
    }

    if let Commands::Backends = args.command {
        for report in EmbedderFactory::new(config.embed.clone()).probe_all() {
            let mark = if report.available { "available" } else { "unavailable" };
            println!("{:<8} {:<12} {}", report.kind.as_str(), mark, report.detail);
        }
        return Ok(());
    }

    let embedder = Arc::new(
        WorkerPool::from_factory(EmbedderFactory::new(config.embed.clone()))
            .context("no embedding backend could be started")?,
    );
    initialize(&embedder).await?;
    let store = open_store(&config, embedder.as_ref()).await?;

    let outcome = match args.command {
        Commands::Index { force, files } => index(&config, &root, &store, embedder.clone(), force, files).await,
        Commands::Search {
            query,
            k,
            min_score,
            path_prefix,
            language,
            json,
        } => {
            let options = SearchOptions {
                k: k.unwrap_or(config.search.k),
                min_score: min_score.or(config.search.min_score),
                filter: SearchFilter {
                    path_prefix,
                    languages: language,
                },
            };
            search(&config, &store, embedder.clone(), &query, &options, json).await
        }
        Commands::Remove { path } => {
            let scanner = FileScanner::new(&root, config.indexing.max_file_size);
            let absolute = if path.is_relative() {
                std::env::current_dir()?.join(&path)
            } else {
                path.clone()
            };
            let key = scanner
                .key_for(&absolute)
                .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
            let removed = store.as_dyn().delete_by_file(&key).await?;
            println!("Removed {removed} chunks of {key}");
            Ok(())
        }
        Commands::Stats { json } => stats(&store, json).await,
        Commands::Backends => Ok(()),
    };

    embedder.dispose().await?;
    outcome
}

async fn initialize(embedder: &WorkerPool) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ModelDownloadProgress::Started { model } => tracing::info!("Loading model {}", model),
                ModelDownloadProgress::FileStarted { file, index, total } => {
                    eprintln!("Downloading {file} ({}/{total})", index + 1)
                }
                ModelDownloadProgress::FileFinished { file, bytes, .. } => {
                    tracing::info!("Downloaded {} ({} bytes)", file, bytes)
                }
                ModelDownloadProgress::Finished { model } => tracing::info!("Model {} ready", model),
                ModelDownloadProgress::Failed { model, error } => {
                    tracing::error!("Model {} failed: {}", model, error)
                }
            }
        }
    });
    let result = embedder.initialize_with_progress(Some(tx)).await;
    reporter.await?;
    result.with_context(|| format!("failed to initialize {}", embedder.provider_name()))
}

async fn open_store(config: &RetrieverConfig, embedder: &dyn EmbeddingProvider) -> anyhow::Result<Store> {
    let dimension = embedder.embedding_dimension();
    let backend = embedder.provider_name();
    if config.store.sharded {
        let dir = config.shards_dir();
        let store = ShardedVectorStore::open(&dir, dimension, backend, config.store.max_chunks_per_shard)
            .await
            .with_context(|| format!("failed to open sharded index at {}", dir.display()))?;
        for (shard, reason) in store.unavailable_shards().await {
            eprintln!("warning: shard {shard} is unavailable: {reason}");
        }
        Ok(Store::Sharded(Arc::new(store)))
    } else {
        let path = config.index_db_path();
        let store = SqliteVectorStore::open(&path, dimension, backend)
            .await
            .with_context(|| format!("failed to open index at {}", path.display()))?;
        Ok(Store::Single(Arc::new(store)))
    }
}

async fn index(
    config: &RetrieverConfig,
    root: &Path,
    store: &Store,
    embedder: Arc<WorkerPool>,
    force: bool,
    files: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let chunker = Chunker::new(config.chunking);
    let scanner = FileScanner::new(root, config.indexing.max_file_size);
    let files: Vec<PathBuf> = files
        .into_iter()
        .map(|f| std::env::current_dir().map(|cwd| cwd.join(f)))
        .collect::<std::io::Result<_>>()?;

    match store {
        Store::Single(single) => {
            let indexer = Indexer::new(single.clone(), embedder, chunker, scanner)?
                .with_batch_size(config.indexing.batch_size);
            let mut run = indexer.index_directory(IndexOptions {
                force,
                batch_size: None,
                files: (!files.is_empty()).then_some(files),
            });

            let cancel = run.cancellation_token();
            let ctrl_c = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Cancelling after the current file...");
                    cancel.cancel();
                }
            });
            while let Some(progress) = run.next().await {
                eprint!(
                    "\r[{}/{}] {}\x1b[K",
                    progress.files_processed,
                    progress.total_files,
                    progress.current_file.as_deref().unwrap_or("")
                );
            }
            eprintln!();
            let summary = run.finish().await?;
            ctrl_c.abort();

            for failure in &summary.failures {
                eprintln!("failed: {}: {}", failure.path, failure.error);
            }
            println!(
                "Indexed {} files ({} failed): {} chunks added, {} removed, {} total in {:.1?}{}",
                summary.files_indexed,
                summary.files_failed,
                summary.chunks_added,
                summary.chunks_removed,
                summary.stats.total_chunks,
                summary.duration,
                if summary.cancelled { " (cancelled)" } else { "" }
            );
        }
        Store::Sharded(sharded) => {
            let indexer = ShardedIndexer::new(sharded.clone(), embedder, chunker, scanner)?
                .with_batch_size(config.indexing.batch_size);
            let results = if files.is_empty() {
                indexer.index_all(force).await?
            } else {
                indexer.index_files(files, force).await?
            };
            for result in &results {
                let shard = result
                    .shard_id
                    .map(|id| format!("shard {id}"))
                    .unwrap_or_else(|| "unroutable".to_string());
                println!(
                    "{shard}: {} indexed, {} failed, {} chunks added, {} removed",
                    result.files_succeeded, result.files_failed, result.chunks_added, result.chunks_removed
                );
                for failure in &result.failures {
                    eprintln!("failed: {}: {}", failure.path, failure.error);
                }
            }
        }
    }
    Ok(())
}

async fn search(
    config: &RetrieverConfig,
    store: &Store,
    embedder: Arc<WorkerPool>,
    query: &str,
    options: &SearchOptions,
    json: bool,
) -> anyhow::Result<()> {
    match store {
        Store::Single(single) => {
            let results = Searcher::new(single.clone(), embedder)?.search(query, options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
        }
        Store::Sharded(sharded) => {
            let response = ShardedSearcher::new(sharded.clone(), embedder)?
                .with_deadline(config.search.shard_deadline())
                .search(query, options)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_results(&response.results);
                if response.stats.partial {
                    let stats = &response.stats;
                    eprintln!(
                        "warning: partial results ({} of {} shards failed, {} skipped)",
                        stats.errors.len(),
                        stats.shards_queried,
                        stats.shards_skipped.len()
                    );
                }
            }
        }
    }
    Ok(())
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results");
    }
    for result in results {
        let chunk = &result.chunk;
        let symbol = chunk
            .symbol_name
            .as_deref()
            .map(|s| format!("  ({s})"))
            .unwrap_or_default();
        println!(
            "{:.3}  {}:{}-{}{}",
            result.score, chunk.file_path, chunk.start_line, chunk.end_line, symbol
        );
    }
}

async fn stats(store: &Store, json: bool) -> anyhow::Result<()> {
    let stats = store.as_dyn().stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("Chunks: {}", stats.total_chunks);
    println!("Files: {}", stats.total_files);
    println!("Size: {} bytes", stats.size_bytes);
    match stats.last_indexed_at {
        Some(at) => println!("Last indexed: {}", at.to_rfc3339()),
        None => println!("Last indexed: never"),
    }
    if let Store::Sharded(sharded) = store {
        let unavailable = sharded.unavailable_shards().await;
        for info in sharded.shard_infos().await {
            let state = unavailable
                .get(&info.shard_id)
                .map(|reason| format!("unavailable: {reason}"))
                .unwrap_or_else(|| "ok".to_string());
            println!(
                "  shard {}: {} chunks, {} bytes, {} prefixes, {}",
                info.shard_id,
                info.chunk_count,
                info.size_bytes,
                info.owned_path_prefixes.len(),
                state
            );
        }
    }
    Ok(())
}
