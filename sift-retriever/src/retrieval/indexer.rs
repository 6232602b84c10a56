//! Chunk → embed → store orchestration for single files and whole trees.
//!
//! ## Pipeline Flow
//!
//! ```text
//! FileScanner → batches of files → Chunker → one embed call per batch → VectorStore::replace_file
//!                                                 │ (batch failed)
//!                                                 └→ retry each file alone
//! ```
//!
//! Re-indexing is incremental: a file's chunks are diffed by id against what
//! the store already holds, only new ids are embedded and ids the file no
//! longer produces are deleted in the same write.

use super::scanner::{FileScanner, ScannedFile};
use crate::error::{Result, RetrieverError};
use crate::storage::{ChunkId, IndexStats, VectorEntry, VectorStore, ensure_compatible};
use futures::Stream;
use serde::Serialize;
use sift_context::{Chunk, Chunker};
use sift_embed::EmbeddingProvider;
use std::collections::HashSet;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Outcome of indexing one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileIndexResult {
    /// Vectors written (all chunks when forced).
    pub added: usize,
    /// Stale vectors deleted.
    pub removed: usize,
    /// Chunks whose vectors were already stored.
    pub unchanged: usize,
    /// Failures that left the file as it was before the call.
    pub errors: Vec<String>,
}

impl FileIndexResult {
    fn failed(error: impl ToString) -> Self {
        Self {
            errors: vec![error.to_string()],
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Re-embed every chunk, not only new ones.
    pub force: bool,
    /// Overrides the indexer's batch size for this run.
    pub batch_size: Option<usize>,
    /// Explicit file list; the scanner walks the root when `None`.
    pub files: Option<Vec<PathBuf>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexProgress {
    pub files_processed: usize,
    pub total_files: usize,
    pub current_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub error: String,
}

/// Final report of a directory run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectorySummary {
    pub stats: IndexStats,
    pub files_indexed: usize,
    pub files_failed: usize,
    pub failures: Vec<FileFailure>,
    pub chunks_added: usize,
    pub chunks_removed: usize,
    pub cancelled: bool,
    pub duration: Duration,
}

/// Per-file outcomes of one batch, in input order.
pub(crate) struct BatchOutcome {
    pub results: Vec<(String, Result<FileIndexResult>)>,
    pub cancelled: bool,
}

struct PreparedFile {
    key: String,
    current: Vec<ChunkId>,
    fresh: Vec<Chunk>,
    unchanged: usize,
}

#[derive(Clone)]
pub struct Indexer {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    scanner: FileScanner,
    batch_size: usize,
}

impl Indexer {
    /// Fails when the embedder's vectors don't fit the store.
    pub fn new(
        store: Arc<dyn VectorStore>,
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
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn scanner(&self) -> &FileScanner {
        &self.scanner
    }

    /// Bring the stored chunks of `path` in line with `content`.
    ///
    /// Embedding failures are reported in the result and leave the file
    /// untouched; storage failures are returned as errors.
    pub async fn index_file(&self, path: &str, content: &str, force: bool) -> Result<FileIndexResult> {
        let prepared = self.prepare(path, content, force).await?;
        let texts: Vec<String> = prepared.fresh.iter().map(Chunk::embedding_text).collect();
        match self.embed(&texts).await {
            Ok(vectors) => self.commit(prepared, vectors).await,
            Err(e) => {
                tracing::warn!("Failed to embed {}: {}", path, e);
                Ok(FileIndexResult::failed(e))
            }
        }
    }

    /// Delete every vector of `path`. Returns how many were removed.
    pub async fn remove_file(&self, path: &str) -> Result<usize> {
        let removed = self.store.delete_by_file(path).await?;
        tracing::debug!("Removed {} chunks of {}", removed, path);
        Ok(removed)
    }

    /// Index a tree in the background.
    ///
    /// The returned run yields progress as files complete; `finish` waits for the summary.
    pub fn index_directory(&self, options: IndexOptions) -> IndexRun {
        self.index_directory_with_token(options, CancellationToken::new())
    }

    /// Like [`Indexer::index_directory`], stopping when `cancel` fires.
    pub fn index_directory_with_token(
        &self,
        options: IndexOptions,
        cancel: CancellationToken,
    ) -> IndexRun {
        let (tx, rx) = mpsc::channel(32);
        let indexer = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { indexer.run_directory(options, tx, token).await });
        IndexRun {
            progress: ReceiverStream::new(rx),
            cancel,
            handle,
        }
    }

    async fn run_directory(
        &self,
        options: IndexOptions,
        progress: mpsc::Sender<IndexProgress>,
        cancel: CancellationToken,
    ) -> Result<DirectorySummary> {
        let started = Instant::now();
        let mut summary = DirectorySummary::default();

        let files = match options.files {
            Some(paths) => self.resolve_files(paths, &mut summary),
            None => {
                let scanner = self.scanner.clone();
                let files = tokio::task::spawn_blocking(move || scanner.scan()).await?;
                summary.chunks_removed += self.prune_missing(&files).await?;
                files
            }
        };

        let total = files.len() + summary.files_failed;
        let batch_size = options.batch_size.unwrap_or(self.batch_size).max(1);
        tracing::info!(
            "Indexing {} files under {} (batch size {})",
            files.len(),
            self.scanner.root().display(),
            batch_size
        );

        let mut processed = summary.files_failed;
        for batch in files.chunks(batch_size) {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let outcome = self.index_batch(batch, options.force, &cancel).await;
            for (key, result) in outcome.results {
                processed += 1;
                match result {
                    Ok(result) if result.is_ok() => {
                        summary.files_indexed += 1;
                        summary.chunks_added += result.added;
                        summary.chunks_removed += result.removed;
                    }
                    Ok(result) => summary.record_failure(&key, result.errors.join("; ")),
                    Err(e) => summary.record_failure(&key, e.to_string()),
                }
                // A dropped receiver only means nobody is watching.
                let _ = progress
                    .send(IndexProgress {
                        files_processed: processed,
                        total_files: total,
                        current_file: Some(key),
                    })
                    .await;
            }
            if outcome.cancelled {
                summary.cancelled = true;
                break;
            }
        }

        summary.stats = self.store.stats().await?;
        summary.duration = started.elapsed();
        tracing::info!(
            "Indexed {} files ({} failed, {} chunks added, {} removed){} in {:?}",
            summary.files_indexed,
            summary.files_failed,
            summary.chunks_added,
            summary.chunks_removed,
            if summary.cancelled { ", cancelled" } else { "" },
            summary.duration
        );
        Ok(summary)
    }

    fn resolve_files(&self, paths: Vec<PathBuf>, summary: &mut DirectorySummary) -> Vec<ScannedFile> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let path = if path.is_relative() {
                self.scanner.root().join(path)
            } else {
                path
            };
            match self.scanner.key_for(&path) {
                Some(key) => files.push(ScannedFile { path, key }),
                None => summary.record_failure(
                    &path.display().to_string(),
                    "outside the indexed root".to_string(),
                ),
            }
        }
        files
    }

    /// Drop stored files the scan no longer finds.
    async fn prune_missing(&self, scanned: &[ScannedFile]) -> Result<usize> {
        let present: HashSet<&str> = scanned.iter().map(|f| f.key.as_str()).collect();
        let mut removed = 0;
        for stored in self.store.files().await? {
            if !present.contains(stored.as_str()) {
                tracing::debug!("Pruning {} (no longer on disk)", stored);
                removed += self.store.delete_by_file(&stored).await?;
            }
        }
        Ok(removed)
    }

    /// Read, chunk and embed `files` with one embed call, then commit them one by one.
    ///
    /// If the shared embed call fails every file is retried alone so only
    /// the faulty ones fail. `cancel` is checked after each commit.
    pub(crate) async fn index_batch(
        &self,
        files: &[ScannedFile],
        force: bool,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let mut slots: Vec<Option<Result<FileIndexResult>>> = Vec::with_capacity(files.len());
        let mut prepared: Vec<(usize, PreparedFile)> = Vec::new();

        for (idx, file) in files.iter().enumerate() {
            let content = match tokio::fs::read(&file.path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", file.path.display(), e);
                    slots.push(Some(Ok(FileIndexResult::failed(e))));
                    continue;
                }
            };
            match self.prepare(&file.key, &content, force).await {
                Ok(p) => {
                    slots.push(None);
                    prepared.push((idx, p));
                }
                Err(e) => slots.push(Some(Err(e))),
            }
        }

        let texts: Vec<String> = prepared
            .iter()
            .flat_map(|(_, p)| p.fresh.iter().map(Chunk::embedding_text))
            .collect();

        let mut embedded: Vec<(usize, PreparedFile, Vec<Vec<f32>>)> = Vec::new();
        match self.embed(&texts).await {
            Ok(vectors) => {
                let mut vectors = vectors.into_iter();
                for (idx, p) in prepared {
                    let own: Vec<Vec<f32>> = vectors.by_ref().take(p.fresh.len()).collect();
                    embedded.push((idx, p, own));
                }
            }
            Err(e) if prepared.len() > 1 => {
                tracing::debug!("Batch embedding failed ({}), retrying files one by one", e);
                for (idx, p) in prepared {
                    let texts: Vec<String> = p.fresh.iter().map(Chunk::embedding_text).collect();
                    match self.embed(&texts).await {
                        Ok(vectors) => embedded.push((idx, p, vectors)),
                        Err(e) => {
                            tracing::warn!("Failed to embed {}: {}", p.key, e);
                            slots[idx] = Some(Ok(FileIndexResult::failed(e)));
                        }
                    }
                }
            }
            Err(e) => {
                for (idx, p) in prepared {
                    tracing::warn!("Failed to embed {}: {}", p.key, e);
                    slots[idx] = Some(Ok(FileIndexResult::failed(&e)));
                }
            }
        }

        let mut cancelled = false;
        for (idx, p, vectors) in embedded {
            if cancelled {
                break;
            }
            slots[idx] = Some(self.commit(p, vectors).await);
            cancelled = cancel.is_cancelled();
        }

        // Files skipped by cancellation have no outcome and are left as they were.
        let results = files
            .iter()
            .zip(slots)
            .filter_map(|(file, slot)| slot.map(|result| (file.key.clone(), result)))
            .collect();
        BatchOutcome { results, cancelled }
    }

    async fn prepare(&self, key: &str, content: &str, force: bool) -> Result<PreparedFile> {
        let chunks = self.chunker.chunk(key, content);
        let stored: HashSet<ChunkId> = self
            .store
            .chunk_ids_for_file(key)
            .await?
            .into_iter()
            .collect();

        let current: Vec<ChunkId> = chunks.iter().map(|c| c.id.clone()).collect();
        let fresh: Vec<Chunk> = chunks
            .into_iter()
            .filter(|c| force || !stored.contains(&c.id))
            .collect();
        let unchanged = current.len() - fresh.len();
        Ok(PreparedFile {
            key: key.to_string(),
            current,
            fresh,
            unchanged,
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let result = self.embedder.embed_texts(texts).await?;
        if result.len() != texts.len() {
            return Err(RetrieverError::Embed {
                source: sift_embed::EmbedError::invalid_config(format!(
                    "backend returned {} vectors for {} texts",
                    result.len(),
                    texts.len()
                )),
            });
        }
        Ok(result.embeddings)
    }

    async fn commit(&self, prepared: PreparedFile, vectors: Vec<Vec<f32>>) -> Result<FileIndexResult> {
        let added = prepared.fresh.len();
        let entries: Vec<VectorEntry> = prepared
            .fresh
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorEntry {
                record: chunk.into(),
                vector,
            })
            .collect();
        let removed = self
            .store
            .replace_file(&prepared.key, &prepared.current, entries)
            .await?;
        tracing::debug!(
            "Indexed {}: {} added, {} removed, {} unchanged",
            prepared.key,
            added,
            removed,
            prepared.unchanged
        );
        Ok(FileIndexResult {
            added,
            removed,
            unchanged: prepared.unchanged,
            errors: Vec::new(),
        })
    }
}

impl DirectorySummary {
    fn record_failure(&mut self, path: &str, error: String) {
        tracing::warn!("Failed to index {}: {}", path, error);
        self.files_failed += 1;
        self.failures.push(FileFailure {
            path: path.to_string(),
            error,
        });
    }
}

/// A running directory index: a finite stream of progress events.
pub struct IndexRun {
    progress: ReceiverStream<IndexProgress>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<DirectorySummary>>,
}

impl IndexRun {
    /// Ask the run to stop after the file it is committing.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to end. Unread progress events are discarded.
    pub async fn finish(self) -> Result<DirectorySummary> {
        drop(self.progress);
        self.handle.await?
    }
}

impl Stream for IndexRun {
    type Item = IndexProgress;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.progress).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SearchFilter, SqliteVectorStore};
    use futures::StreamExt;
    use sift_context::ChunkOptions;
    use sift_embed::HashEmbeddingProvider;
    use tempfile::tempdir;

    const DIM: usize = 32;

    async fn indexer_at(root: &std::path::Path) -> Result<Indexer> {
        let embedder = HashEmbeddingProvider::new(DIM);
        embedder.initialize().await?;
        let store = SqliteVectorStore::open_memory(DIM, embedder.provider_name()).await?;
        let options = ChunkOptions {
            max_lines: 10,
            overlap_lines: 2,
            ..ChunkOptions::default()
        };
        Indexer::new(
            Arc::new(store),
            Arc::new(embedder),
            Chunker::new(options),
            FileScanner::new(root, 1024 * 1024),
        )
    }

    fn numbered(lines: usize, tag: &str) -> String {
        (1..=lines)
            .map(|i| format!("let {tag}_{i} = {i};\n"))
            .collect()
    }

    #[tokio::test]
    async fn test_index_file_is_incremental() -> Result<()> {
        let dir = tempdir()?;
        let indexer = indexer_at(dir.path()).await?;
        let content = numbered(25, "v");

        let first = indexer.index_file("src/a.rs", &content, false).await?;
        assert!(first.added > 0);
        assert_eq!(first.removed, 0);

        let again = indexer.index_file("src/a.rs", &content, false).await?;
        assert_eq!(again.added, 0);
        assert_eq!(again.removed, 0);
        assert_eq!(again.unchanged, first.added);

        let forced = indexer.index_file("src/a.rs", &content, true).await?;
        assert_eq!(forced.added, first.added);
        assert_eq!(forced.removed, 0);
        assert_eq!(indexer.store().stats().await?.total_chunks, first.added);
        Ok(())
    }

    #[tokio::test]
    async fn test_changed_content_drops_stale_chunks() -> Result<()> {
        let dir = tempdir()?;
        let indexer = indexer_at(dir.path()).await?;
        let before = indexer.index_file("a.rs", &numbered(25, "old"), false).await?;
        let after = indexer.index_file("a.rs", &numbered(5, "new"), false).await?;

        assert_eq!(after.added, 1);
        assert_eq!(after.removed, before.added);
        assert_eq!(indexer.store().stats().await?.total_chunks, 1);

        let emptied = indexer.index_file("a.rs", "", false).await?;
        assert_eq!(emptied.removed, 1);
        assert!(indexer.store().files().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_file() -> Result<()> {
        let dir = tempdir()?;
        let indexer = indexer_at(dir.path()).await?;
        let added = indexer.index_file("a.rs", &numbered(25, "a"), false).await?.added;
        indexer.index_file("b.rs", &numbered(5, "b"), false).await?;

        assert_eq!(indexer.remove_file("a.rs").await?, added);
        assert_eq!(indexer.remove_file("a.rs").await?, 0);
        let results = indexer
            .store()
            .search(&HashEmbeddingProvider::new(DIM).embed_sync("a_1"), 100, &SearchFilter::default())
            .await?;
        assert!(results.iter().all(|r| r.chunk.file_path == "b.rs"));
        Ok(())
    }

    #[tokio::test]
    async fn test_index_directory_reports_progress_and_prunes() -> Result<()> {
        let dir = tempdir()?;
        std::fs::create_dir_all(dir.path().join("src"))?;
        std::fs::write(dir.path().join("src/a.rs"), numbered(12, "a"))?;
        std::fs::write(dir.path().join("src/b.py"), numbered(3, "b"))?;
        std::fs::write(dir.path().join("README.md"), "# Title\n\nSome words.\n")?;

        let indexer = indexer_at(dir.path()).await?;
        indexer.index_file("deleted.rs", &numbered(4, "gone"), false).await?;

        let mut run = indexer.index_directory(IndexOptions {
            batch_size: Some(2),
            ..IndexOptions::default()
        });
        let mut events = Vec::new();
        while let Some(progress) = run.next().await {
            events.push(progress);
        }
        let summary = run.finish().await?;

        assert_eq!(events.len(), 3);
        assert_eq!(events.last().map(|e| e.files_processed), Some(3));
        assert!(events.iter().all(|e| e.total_files == 3));
        assert_eq!(summary.files_indexed, 3);
        assert_eq!(summary.files_failed, 0);
        assert_eq!(summary.chunks_removed, 1);
        assert!(!summary.cancelled);
        assert_eq!(summary.stats.total_files, 3);
        assert_eq!(
            indexer.store().files().await?,
            vec!["README.md", "src/a.rs", "src/b.py"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_explicit_files_outside_root_fail() -> Result<()> {
        let dir = tempdir()?;
        let other = tempdir()?;
        std::fs::write(dir.path().join("a.rs"), numbered(3, "a"))?;
        std::fs::write(other.path().join("b.rs"), numbered(3, "b"))?;

        let indexer = indexer_at(dir.path()).await?;
        let summary = indexer
            .index_directory(IndexOptions {
                files: Some(vec![PathBuf::from("a.rs"), other.path().join("b.rs")]),
                ..IndexOptions::default()
            })
            .finish()
            .await?;
        assert_eq!(summary.files_indexed, 1);
        assert_eq!(summary.files_failed, 1);
        assert!(summary.failures[0].error.contains("outside"));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_before_start() -> Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("a.rs"), numbered(3, "a"))?;
        let indexer = indexer_at(dir.path()).await?;

        let run = indexer.index_directory(IndexOptions::default());
        run.cancel();
        let summary = run.finish().await?;
        assert!(summary.cancelled);
        assert_eq!(summary.files_indexed, 0);
        assert_eq!(summary.stats.total_chunks, 0);
        Ok(())
    }
}
