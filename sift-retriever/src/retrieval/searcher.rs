//! Query text → embedding → ranked results.

use crate::error::Result;
use crate::storage::{SearchFilter, SearchResult, VectorStore, check_dimension, ensure_compatible};
use serde::{Deserialize, Serialize};
use sift_embed::EmbeddingProvider;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub k: usize,
    /// Results scoring below this are dropped.
    pub min_score: Option<f32>,
    pub filter: SearchFilter,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            k: 10,
            min_score: None,
            filter: SearchFilter::default(),
        }
    }
}

impl SearchOptions {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub(crate) fn apply_threshold(&self, results: &mut Vec<SearchResult>) {
        if let Some(min) = self.min_score {
            results.retain(|r| r.score >= min);
        }
    }
}

#[derive(Clone)]
pub struct Searcher {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Searcher {
    /// Fails when the embedder's vectors don't fit the store.
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        ensure_compatible(store.as_ref(), embedder.as_ref())?;
        Ok(Self { store, embedder })
    }

    /// Results in rank order: score descending, ties by shorter path then lower start line.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() || options.k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed_text(query).await?;
        check_dimension(self.store.dimension(), &vector)?;

        let mut results = self.store.search(&vector, options.k, &options.filter).await?;
        options.apply_threshold(&mut results);
        tracing::debug!("Query {:?} returned {} results", query, results.len());
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetrieverError;
    use crate::storage::{ChunkRecord, SqliteVectorStore, VectorEntry};
    use sift_embed::HashEmbeddingProvider;

    async fn seeded() -> Result<Searcher> {
        let embedder = HashEmbeddingProvider::new(64);
        embedder.initialize().await?;
        let store = SqliteVectorStore::open_memory(64, embedder.provider_name()).await?;
        let docs = [
            ("src/parser.rs", "parse tokens into an expression tree"),
            ("src/net/http.rs", "send http request with retry and backoff"),
            ("docs/parser.md", "the parser turns tokens into an expression tree"),
        ];
        let entries = docs
            .iter()
            .map(|(path, text)| VectorEntry {
                record: ChunkRecord {
                    chunk_id: path.to_string(),
                    file_path: path.to_string(),
                    start_line: 1,
                    end_line: 1,
                    symbol_name: None,
                    language: if path.ends_with(".md") { "markdown" } else { "rust" }.to_string(),
                    content: text.to_string(),
                    content_hash: text.to_string(),
                },
                vector: embedder.embed_sync(text),
            })
            .collect();
        store.upsert_batch(entries).await?;

        let query_embedder = HashEmbeddingProvider::new(64);
        query_embedder.initialize().await?;
        Searcher::new(Arc::new(store), Arc::new(query_embedder))
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity() -> Result<()> {
        let searcher = seeded().await?;
        let results = searcher
            .search("http request retry", &SearchOptions::default())
            .await?;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].chunk.file_path, "src/net/http.rs");
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        Ok(())
    }

    #[tokio::test]
    async fn test_search_options() -> Result<()> {
        let searcher = seeded().await?;

        let top1 = searcher
            .search("expression tree", &SearchOptions::default().with_k(1))
            .await?;
        assert_eq!(top1.len(), 1);

        let rust_only = searcher
            .search(
                "expression tree",
                &SearchOptions::default().with_filter(SearchFilter::default().with_language("rust")),
            )
            .await?;
        assert!(rust_only.iter().all(|r| r.chunk.language == "rust"));
        assert_eq!(rust_only[0].chunk.file_path, "src/parser.rs");

        let strict = searcher
            .search("expression tree", &SearchOptions::default().with_min_score(0.99))
            .await?;
        assert!(strict.is_empty());

        assert!(searcher.search("   ", &SearchOptions::default()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_mismatched_embedder_is_rejected() -> Result<()> {
        let store = SqliteVectorStore::open_memory(64, "hash:v1:64").await?;
        let embedder = HashEmbeddingProvider::new(32);
        let err = Searcher::new(Arc::new(store), Arc::new(embedder))
            .err()
            .map(|e| e.to_string());
        assert_eq!(
            err,
            Some(
                RetrieverError::DimensionMismatch {
                    expected: 64,
                    actual: 32
                }
                .to_string()
            )
        );
        Ok(())
    }
}
