//! Vector storage for embedded chunks
//!
//! A [`VectorStore`] maps chunk ids to a unit-length vector plus the chunk's
//! metadata and answers top-k similarity queries. Vectors are normalized, so
//! similarity is a plain dot product.
//!
//! ## Key Components
//!
//! - **VectorStore**: the storage contract, implemented by
//!   [`SqliteVectorStore`] and by the sharded store
//! - **SearchFilter**: metadata predicates applied before ranking
//! - **rank_order**: the single total order every result list uses

use crate::error::{Result, RetrieverError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use half::f16;
use serde::{Deserialize, Serialize};
use sift_context::Chunk;
use sift_embed::EmbeddingProvider;
use std::cmp::Ordering;

pub mod sqlite_store;

pub use sqlite_store::SqliteVectorStore;

/// Hex blake3 id produced by the chunker.
pub type ChunkId = String;

/// Everything stored next to a vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: ChunkId,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub symbol_name: Option<String>,
    pub language: String,
    pub content: String,
    pub content_hash: String,
}

impl From<Chunk> for ChunkRecord {
    fn from(chunk: Chunk) -> Self {
        Self {
            chunk_id: chunk.id,
            file_path: chunk.file_path,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            symbol_name: chunk.symbol_name,
            language: chunk.language,
            content: chunk.content,
            content_hash: chunk.content_hash,
        }
    }
}

/// A vector ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub record: ChunkRecord,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk: ChunkRecord,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
    /// Set when the result came through the sharded layer.
    pub shard_id: Option<crate::sharded::ShardId>,
}

/// Derived counts, recomputable from store contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_chunks: usize,
    pub total_files: usize,
    /// Chunk text plus stored vector bytes.
    pub size_bytes: u64,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

impl IndexStats {
    /// Sum of per-shard stats.
    pub fn combine(stats: impl IntoIterator<Item = IndexStats>) -> Self {
        stats.into_iter().fold(Self::default(), |acc, s| Self {
            total_chunks: acc.total_chunks + s.total_chunks,
            total_files: acc.total_files + s.total_files,
            size_bytes: acc.size_bytes + s.size_bytes,
            last_indexed_at: acc.last_indexed_at.max(s.last_indexed_at),
        })
    }
}

/// Metadata predicate. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub path_prefix: Option<String>,
    /// Language names as produced by the chunker; empty means any.
    pub languages: Vec<String>,
}

impl SearchFilter {
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.languages.push(language.into());
        self
    }

    pub fn matches(&self, record: &ChunkRecord) -> bool {
        if let Some(prefix) = &self.path_prefix {
            if !record.file_path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.languages.is_empty()
            || self
                .languages
                .iter()
                .any(|l| l.eq_ignore_ascii_case(&record.language))
    }
}

/// Result order: score descending, then shorter path, then lower start
/// line, then path and chunk id so the order is total.
pub fn rank_order(a: &SearchResult, b: &SearchResult) -> Ordering {
    rank_records((a.score, &a.chunk), (b.score, &b.chunk))
}

/// [`rank_order`] over borrowed records, for ranking before anything is cloned.
pub(crate) fn rank_records(a: (f32, &ChunkRecord), b: (f32, &ChunkRecord)) -> Ordering {
    let ((a_score, a), (b_score, b)) = (a, b);
    b_score
        .total_cmp(&a_score)
        .then_with(|| a.file_path.len().cmp(&b.file_path.len()))
        .then_with(|| a.start_line.cmp(&b.start_line))
        .then_with(|| a.file_path.cmp(&b.file_path))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Persistent chunk-id → vector mapping with similarity search.
///
/// Writes are serialized per store and each call is atomic: readers see the
/// state before or after it, never part of it.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Fixed at creation.
    fn dimension(&self) -> usize;

    /// Embedding backend the vectors came from.
    fn backend_id(&self) -> &str;

    /// Insert or replace the entry with the same chunk id.
    async fn upsert(&self, entry: VectorEntry) -> Result<()> {
        self.upsert_batch(vec![entry]).await
    }

    async fn upsert_batch(&self, entries: Vec<VectorEntry>) -> Result<()>;

    /// Returns whether the id existed.
    async fn delete_by_id(&self, chunk_id: &str) -> Result<bool>;

    /// Returns the number of vectors removed.
    async fn delete_by_file(&self, file_path: &str) -> Result<usize>;

    /// Make `current` the complete chunk set of `file_path` in one write:
    /// stored ids for the file that are not in `current` are deleted and
    /// `entries` are upserted. Returns the number of vectors removed.
    async fn replace_file(
        &self,
        file_path: &str,
        current: &[ChunkId],
        entries: Vec<VectorEntry>,
    ) -> Result<usize>;

    async fn chunk_ids_for_file(&self, file_path: &str) -> Result<Vec<ChunkId>>;

    /// Top `k` entries passing `filter`, in [`rank_order`].
    async fn search(&self, query: &[f32], k: usize, filter: &SearchFilter)
    -> Result<Vec<SearchResult>>;

    async fn stats(&self) -> Result<IndexStats>;

    /// Every file with at least one vector, sorted.
    async fn files(&self) -> Result<Vec<String>>;
}

/// Fail unless `embedder` produces vectors this store accepts.
pub fn ensure_compatible(store: &dyn VectorStore, embedder: &dyn EmbeddingProvider) -> Result<()> {
    if store.dimension() != embedder.embedding_dimension() {
        return Err(RetrieverError::DimensionMismatch {
            expected: store.dimension(),
            actual: embedder.embedding_dimension(),
        });
    }
    if store.backend_id() != embedder.provider_name() {
        return Err(RetrieverError::BackendMismatch {
            expected: store.backend_id().to_string(),
            actual: embedder.provider_name().to_string(),
        });
    }
    Ok(())
}

pub(crate) fn check_dimension(expected: usize, vector: &[f32]) -> Result<()> {
    if vector.len() != expected {
        return Err(RetrieverError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// f16 little-endian bytes, as stored in the `embedding` column.
pub(crate) fn encode_vector(values: &[f32]) -> Vec<u8> {
    let halves: Vec<f16> = values.iter().copied().map(f16::from_f32).collect();
    bytemuck::cast_slice::<f16, u8>(&halves).to_vec()
}

pub(crate) fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    let halves: Vec<f16> = bytemuck::pod_collect_to_vec(bytes);
    halves.into_iter().map(f16::to_f32).collect()
}

/// The value a vector reads back as after a round trip through storage.
pub(crate) fn quantize(values: &[f32]) -> Vec<f32> {
    values
        .iter()
        .map(|v| f16::from_f32(*v).to_f32())
        .collect()
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(path: &str, start: usize, score: f32) -> SearchResult {
        SearchResult {
            chunk: ChunkRecord {
                chunk_id: format!("{path}:{start}"),
                file_path: path.to_string(),
                start_line: start,
                end_line: start + 9,
                symbol_name: None,
                language: "rust".to_string(),
                content: String::new(),
                content_hash: String::new(),
            },
            score,
            shard_id: None,
        }
    }

    #[test]
    fn test_rank_order_tie_breaks() {
        let mut results = vec![
            result("src/long_name.rs", 1, 0.5),
            result("src/a.rs", 20, 0.5),
            result("src/b.rs", 1, 0.9),
            result("src/a.rs", 5, 0.5),
            result("src/c.rs", 5, 0.5),
        ];
        results.sort_by(rank_order);
        let order: Vec<&str> = results.iter().map(|r| r.chunk.chunk_id.as_str()).collect();
        assert_eq!(
            order,
            vec![
                "src/b.rs:1",
                "src/a.rs:5",
                "src/c.rs:5",
                "src/a.rs:20",
                "src/long_name.rs:1"
            ]
        );
    }

    #[test]
    fn test_filter_matches() {
        let r = result("src/storage/mod.rs", 1, 0.0).chunk;
        assert!(SearchFilter::default().matches(&r));
        assert!(SearchFilter::default().with_path_prefix("src/").matches(&r));
        assert!(!SearchFilter::default().with_path_prefix("tests/").matches(&r));
        assert!(SearchFilter::default().with_language("Rust").matches(&r));
        assert!(!SearchFilter::default().with_language("python").matches(&r));
    }

    #[test]
    fn test_vector_codec_is_half_precision() {
        let values = vec![0.1f32, -0.5, 0.333];
        let bytes = encode_vector(&values);
        assert_eq!(bytes.len(), 6);
        assert_eq!(decode_vector(&bytes), quantize(&values));
        assert!((decode_vector(&bytes)[1] + 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_stats_combine() {
        let a = IndexStats {
            total_chunks: 3,
            total_files: 1,
            size_bytes: 100,
            last_indexed_at: None,
        };
        let b = IndexStats {
            total_chunks: 2,
            total_files: 2,
            size_bytes: 50,
            last_indexed_at: Some(Utc::now()),
        };
        let combined = IndexStats::combine([a, b.clone()]);
        assert_eq!(combined.total_chunks, 5);
        assert_eq!(combined.total_files, 3);
        assert_eq!(combined.size_bytes, 150);
        assert_eq!(combined.last_indexed_at, b.last_indexed_at);
    }
}
