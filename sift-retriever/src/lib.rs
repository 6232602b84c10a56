//! sift-retriever: local semantic code search
//!
//! This crate turns a project's source files into embedded chunks, keeps them
//! in a persistent vector store and answers similarity queries over them. It
//! scales out by spreading files over several stores (shards) and searching
//! them in parallel.
//!
//! ## Key Modules
//!
//! - **[`storage`]**: the [`VectorStore`](storage::VectorStore) contract and its SQLite implementation
//! - **[`retrieval`]**: incremental [`Indexer`](retrieval::Indexer), change events and the [`Searcher`](retrieval::Searcher)
//! - **[`sharded`]**: shard store, meta-index, shard-routed indexing and fan-out search
//! - **[`config`]**: `.sift/config.toml` loading
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sift_context::Chunker;
//! use sift_embed::{EmbedConfig, EmbedderFactory, EmbeddingProvider, WorkerPool};
//! use sift_retriever::retrieval::{FileScanner, IndexOptions, Indexer, SearchOptions, Searcher};
//! use sift_retriever::storage::SqliteVectorStore;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let embedder = Arc::new(WorkerPool::from_factory(EmbedderFactory::new(EmbedConfig::default()))?);
//! embedder.initialize().await?;
//!
//! let store = Arc::new(
//!     SqliteVectorStore::open(
//!         Path::new(".sift/index.db"),
//!         embedder.embedding_dimension(),
//!         embedder.provider_name(),
//!     )
//!     .await?,
//! );
//! let indexer = Indexer::new(
//!     store.clone(),
//!     embedder.clone(),
//!     Chunker::default(),
//!     FileScanner::new(".", 1 << 20),
//! )?;
//! let summary = indexer.index_directory(IndexOptions::default()).finish().await?;
//! println!("indexed {} files", summary.files_indexed);
//!
//! let searcher = Searcher::new(store, embedder)?;
//! for hit in searcher.search("retry with backoff", &SearchOptions::default()).await? {
//!     println!("{:.3} {}:{}", hit.score, hit.chunk.file_path, hit.chunk.start_line);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! FileScanner / FileChangeEvent → Indexer → Chunker → WorkerPool (embed) → VectorStore
//!                                                                              ↑
//!                          query → Searcher → WorkerPool (embed) ──────────────┘
//! ```

pub mod config;
pub mod error;
pub mod retrieval;
pub mod sharded;
pub mod storage;

pub use config::RetrieverConfig;
pub use error::{Result, RetrieverError};
