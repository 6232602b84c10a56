//! Project configuration, read from `<root>/.sift/config.toml`.
//!
//! Every section is optional; missing keys take their defaults.
//!
//! ```toml
//! [chunking]
//! max_lines = 60
//!
//! [embed]
//! backend = "cpu"
//! model_name = "bge-small-en-v1.5"
//!
//! [store]
//! sharded = true
//! max_chunks_per_shard = 20000
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sift_context::ChunkOptions;
use sift_embed::EmbedConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory under the project root holding config, stores and models.
pub const SIFT_DIR: &str = ".sift";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Relative paths are resolved against the project root.
    pub dir: PathBuf,
    pub sharded: bool,
    /// Rollover threshold: a shard holding this many chunks takes no new files.
    pub max_chunks_per_shard: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(SIFT_DIR),
            sharded: false,
            max_chunks_per_shard: 50_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchDefaults {
    pub k: usize,
    pub min_score: Option<f32>,
    /// Global deadline for a sharded fan-out.
    pub shard_deadline_ms: u64,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            k: 10,
            min_score: None,
            shard_deadline_ms: 2_000,
        }
    }
}

impl SearchDefaults {
    pub fn shard_deadline(&self) -> Duration {
        Duration::from_millis(self.shard_deadline_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Files chunked together and embedded in one call.
    pub batch_size: usize,
    /// Larger files are skipped by the scanner.
    pub max_file_size: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            max_file_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub chunking: ChunkOptions,
    pub embed: EmbedConfig,
    pub store: StoreConfig,
    pub search: SearchDefaults,
    pub indexing: IndexingConfig,
}

impl RetrieverConfig {
    pub fn config_path(root: &Path) -> PathBuf {
        root.join(SIFT_DIR).join(CONFIG_FILE)
    }

    /// Load the project's config file, or defaults when there is none.
    ///
    /// Relative paths in the result are resolved against `root`.
    pub async fn load(root: &Path) -> Result<Self> {
        let path = Self::config_path(root);
        let mut config = match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                tracing::debug!("Loading config from {}", path.display());
                toml::from_str::<Self>(&text)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.resolve_paths(root);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, root: &Path) {
        if self.store.dir.is_relative() {
            self.store.dir = root.join(&self.store.dir);
        }
        if self.embed.model_base_path.is_relative() {
            self.embed.model_base_path = root.join(SIFT_DIR).join(&self.embed.model_base_path);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(e) = self.chunking.validate() {
            tracing::warn!("Chunking options will be clamped: {}", e);
        }
        self.embed.validate()?;
        if self.store.max_chunks_per_shard == 0 {
            return Err(crate::error::RetrieverError::invalid_config(
                "store.max_chunks_per_shard must be at least 1",
            ));
        }
        if self.indexing.batch_size == 0 {
            return Err(crate::error::RetrieverError::invalid_config(
                "indexing.batch_size must be at least 1",
            ));
        }
        Ok(())
    }

    /// Single-store database file.
    pub fn index_db_path(&self) -> PathBuf {
        self.store.dir.join("index.db")
    }

    /// Directory holding `meta.json` and the shard stores.
    pub fn shards_dir(&self) -> PathBuf {
        self.store.dir.join("shards")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_embed::BackendKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() -> Result<()> {
        let dir = tempdir()?;
        let config = RetrieverConfig::load(dir.path()).await?;
        assert_eq!(config.chunking, ChunkOptions::default());
        assert_eq!(config.store.dir, dir.path().join(".sift"));
        assert_eq!(config.index_db_path(), dir.path().join(".sift/index.db"));
        assert_eq!(
            config.embed.model_base_path,
            dir.path().join(".sift").join("models")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_file_overrides_defaults() -> Result<()> {
        let dir = tempdir()?;
        tokio::fs::create_dir_all(dir.path().join(SIFT_DIR)).await?;
        tokio::fs::write(
            RetrieverConfig::config_path(dir.path()),
            r#"
[chunking]
max_lines = 80

[embed]
backend = "hash"
hash_dimension = 64

[store]
sharded = true
max_chunks_per_shard = 100

[search]
k = 5
"#,
        )
        .await?;

        let config = RetrieverConfig::load(dir.path()).await?;
        assert_eq!(config.chunking.max_lines, 80);
        assert_eq!(config.chunking.overlap_lines, 10);
        assert_eq!(config.embed.backend, Some(BackendKind::Hash));
        assert_eq!(config.embed.hash_dimension, 64);
        assert!(config.store.sharded);
        assert_eq!(config.store.max_chunks_per_shard, 100);
        assert_eq!(config.search.k, 5);
        assert_eq!(config.search.shard_deadline(), Duration::from_secs(2));
        assert_eq!(config.indexing.batch_size, 16);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected() -> Result<()> {
        let dir = tempdir()?;
        tokio::fs::create_dir_all(dir.path().join(SIFT_DIR)).await?;
        tokio::fs::write(
            RetrieverConfig::config_path(dir.path()),
            "[store]\nmax_chunks_per_shard = 0\n",
        )
        .await?;
        assert!(RetrieverConfig::load(dir.path()).await.is_err());
        Ok(())
    }
}
