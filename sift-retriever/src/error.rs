//! Error types for indexing, storage and search

use crate::sharded::ShardId;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, RetrieverError>;

#[derive(Debug, thiserror::Error)]
pub enum RetrieverError {
    /// A vector or query whose length differs from the store's fixed dimension
    #[error("Vector dimension mismatch: store expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The store was built with a different embedding backend
    #[error("Embedding backend mismatch: store was built with {expected}, got {actual}")]
    BackendMismatch { expected: String, actual: String },

    /// The shard holding the data failed to open and is excluded
    #[error("Shard {shard} is unavailable: {reason}")]
    ShardUnavailable { shard: ShardId, reason: String },

    #[error("Unknown shard {shard}")]
    UnknownShard { shard: ShardId },

    #[error("Indexing run was cancelled")]
    Cancelled,

    /// Persisted data that cannot be decoded
    #[error("Corrupt store at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Config parse error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Embed {
        #[from]
        source: sift_embed::EmbedError,
    },

    #[error("Background task failed: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
}

impl RetrieverError {
    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
