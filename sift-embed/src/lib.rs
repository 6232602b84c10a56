//! # sift-embed
//!
//! Text embeddings for code search. One [`EmbeddingProvider`] trait covers
//! every backend:
//!
//! - **GPU / CPU**: fastembed ONNX models, built-in or downloaded from
//!   HuggingFace. The GPU backend needs the `cuda` feature.
//! - **Remote**: any OpenAI-compatible `/embeddings` endpoint.
//! - **Hash**: deterministic feature hashing, for offline use and tests.
//!
//! [`EmbedderFactory`] probes the backends in preference order (or honours an
//! override) and [`WorkerPool`] runs the chosen one on its own thread,
//! restarting it when it crashes or stalls.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sift_embed::{EmbedConfig, EmbedderFactory, EmbeddingProvider, WorkerPool};
//!
//! # async fn example() -> sift_embed::Result<()> {
//! let pool = WorkerPool::from_factory(EmbedderFactory::new(EmbedConfig::default()))?;
//! pool.initialize().await?;
//!
//! let texts = vec!["fn main() {}".to_string(), "def main(): pass".to_string()];
//! let result = pool.embed_texts(&texts).await?;
//! println!("{} embeddings of dimension {}", result.len(), result.dimension);
//! # Ok(())
//! # }
//! ```
//!
//! Every vector a provider returns is L2-normalized, so a dot product is a
//! cosine similarity.

pub mod backend;
pub mod config;
pub mod downloader;
pub mod error;
pub mod hashing;
pub mod provider;
pub mod remote;
pub mod status;
pub mod worker;

pub use backend::{AnyEmbedder, EmbedderFactory, ProbeReport};
pub use config::{BackendKind, EmbedConfig, QueueFullPolicy, RemoteConfig, WorkerPoolConfig};
pub use downloader::{ModelDownloadProgress, ModelDownloader, ProgressSender};
pub use error::{EmbedError, Result};
pub use hashing::HashEmbeddingProvider;
pub use provider::{EmbeddingProvider, EmbeddingResult, FastEmbedProvider};
pub use remote::RemoteEmbeddingProvider;
pub use status::EmbedderStatus;
pub use worker::{BackendBuilder, WorkerOutput, WorkerPool, WorkerResult, WorkerTaskKind};
