//! Indexing routed by shard: files are grouped by owning shard and every
//! group runs independently, so one broken shard fails only its own files.

use super::ShardId;
use super::store::ShardedVectorStore;
use crate::error::Result;
use crate::retrieval::indexer::Indexer;
use crate::retrieval::{FileFailure, FileScanner, ScannedFile};
use crate::storage::{VectorStore, ensure_compatible};
use futures::future::join_all;
use itertools::Itertools;
use serde::Serialize;
use sift_context::Chunker;
use sift_embed::EmbeddingProvider;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Counts for one shard's share of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexBatchResult {
    /// `None` for files that could not be routed to any shard.
    pub shard_id: Option<ShardId>,
    pub files_succeeded: usize,
    pub files_failed: usize,
    pub chunks_added: usize,
    pub chunks_removed: usize,
    pub failures: Vec<FileFailure>,
}

impl IndexBatchResult {
    fn for_shard(shard_id: Option<ShardId>) -> Self {
        Self {
            shard_id,
            ..Self::default()
        }
    }

    fn fail(&mut self, path: &str, error: impl ToString) {
        let error = error.to_string();
        tracing::warn!("Failed to index {}: {}", path, error);
        self.files_failed += 1;
        self.failures.push(FileFailure {
            path: path.to_string(),
            error,
        });
    }
}

pub struct ShardedIndexer {
    store: Arc<ShardedVectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    scanner: FileScanner,
    batch_size: usize,
    cancel: CancellationToken,
}

impl ShardedIndexer {
    pub fn new(
        store: Arc<ShardedVectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: Chunker,
        scanner: FileScanner,
    ) -> Result<Self> {
        ensure_compatible(store.as_ref(), embedder.as_ref())?;
        Ok(Self {
            store,
            embedder,
            chunker,
            scanner,
            batch_size: 16,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Runs stop between files once this token fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Arc<ShardedVectorStore> {
        &self.store
    }

    /// Index `files`, one result per shard touched, ordered by shard id.
    pub async fn index_files(&self, files: Vec<PathBuf>, force: bool) -> Result<Vec<IndexBatchResult>> {
        let mut unroutable = IndexBatchResult::for_shard(None);
        let mut routed: Vec<(ShardId, ScannedFile)> = Vec::with_capacity(files.len());

        for path in files {
            let path = if path.is_relative() {
                self.scanner.root().join(path)
            } else {
                path
            };
            let Some(key) = self.scanner.key_for(&path) else {
                unroutable.fail(&path.display().to_string(), "outside the indexed root");
                continue;
            };
            match self.route(&key, &path).await {
                Ok(shard_id) => routed.push((shard_id, ScannedFile { path, key })),
                Err(e) => unroutable.fail(&key, e),
            }
        }

        let groups = routed.into_iter().into_group_map();
        let runs = groups
            .into_iter()
            .sorted_by_key(|(shard_id, _)| *shard_id)
            .map(|(shard_id, files)| self.index_shard(shard_id, files, force));
        let mut results = join_all(runs).await;

        if unroutable.files_failed > 0 {
            results.push(unroutable);
        }
        Ok(results)
    }

    /// Re-embed every file under the root and drop files that are gone.
    pub async fn reindex_all(&self) -> Result<Vec<IndexBatchResult>> {
        self.index_all(true).await
    }

    /// Index every file the scanner finds and drop stored files that are gone.
    pub async fn index_all(&self, force: bool) -> Result<Vec<IndexBatchResult>> {
        let scanner = self.scanner.clone();
        let scanned = tokio::task::spawn_blocking(move || scanner.scan()).await?;

        let present: HashSet<&str> = scanned.iter().map(|f| f.key.as_str()).collect();
        for stored in self.store.files().await? {
            if !present.contains(stored.as_str()) {
                self.store.delete_by_file(&stored).await?;
            }
        }

        let paths = scanned.into_iter().map(|f| f.path).collect();
        self.index_files(paths, force).await
    }

    pub async fn remove_file(&self, path: &str) -> Result<usize> {
        self.store.delete_by_file(path).await
    }

    /// The owning shard, assigning new files by their chunk count.
    async fn route(&self, key: &str, path: &std::path::Path) -> Result<ShardId> {
        if let Some(shard_id) = self.store.shard_for(key).await {
            return Ok(shard_id);
        }
        let content = tokio::fs::read(path).await?;
        let estimate = self
            .chunker
            .chunk(key, &String::from_utf8_lossy(&content))
            .len();
        self.store.assign(key, estimate).await
    }

    async fn index_shard(&self, shard_id: ShardId, files: Vec<ScannedFile>, force: bool) -> IndexBatchResult {
        let mut result = IndexBatchResult::for_shard(Some(shard_id));

        let indexer = match self.shard_indexer(shard_id).await {
            Ok(indexer) => indexer,
            Err(e) => {
                let reason = e.to_string();
                for file in &files {
                    result.fail(&file.key, &reason);
                }
                return result;
            }
        };

        for batch in files.chunks(self.batch_size) {
            if self.cancel.is_cancelled() {
                break;
            }
            let outcome = indexer.index_batch(batch, force, &self.cancel).await;
            for (key, file_result) in outcome.results {
                match file_result {
                    Ok(r) if r.is_ok() => {
                        result.files_succeeded += 1;
                        result.chunks_added += r.added;
                        result.chunks_removed += r.removed;
                    }
                    Ok(r) => result.fail(&key, r.errors.join("; ")),
                    Err(e) => result.fail(&key, e),
                }
            }
            if outcome.cancelled {
                break;
            }
        }

        if let Err(e) = self.store.refresh_shard_info(shard_id).await {
            tracing::warn!("Failed to refresh shard {} usage: {}", shard_id, e);
        }
        tracing::info!(
            "Shard {}: {} files indexed, {} failed",
            shard_id,
            result.files_succeeded,
            result.files_failed
        );
        result
    }

    async fn shard_indexer(&self, shard_id: ShardId) -> Result<Indexer> {
        let shard: Arc<dyn VectorStore> = self.store.shard(shard_id).await?;
        Ok(Indexer::new(
            shard,
            self.embedder.clone(),
            self.chunker.clone(),
            self.scanner.clone(),
        )?
        .with_batch_size(self.batch_size))
    }
}
