//! Parallel fan-out search with progressive, deadline-bounded merging.
//!
//! Every available shard is queried on its own task. Each shard's local top-k
//! is merged into a bounded heap as it arrives and the caller sees the merged
//! set after every shard. Shards that error or miss the global deadline are
//! left out of the merge and reported in [`SearchStats`].

use super::ShardId;
use super::store::ShardSet;
use crate::error::{Result, RetrieverError};
use crate::retrieval::SearchOptions;
use crate::storage::{SearchResult, check_dimension, rank_order};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use sift_embed::EmbeddingProvider;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct SearchProgress {
    /// Best results so far, in rank order.
    pub merged: Vec<SearchResult>,
    pub shards_completed: usize,
    pub shards_total: usize,
    pub is_final: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchStats {
    pub shards_queried: usize,
    /// Unavailable shards that were never queried.
    pub shards_skipped: Vec<ShardId>,
    pub latencies: BTreeMap<ShardId, Duration>,
    /// Shard failures, including deadline misses.
    pub errors: BTreeMap<ShardId, String>,
    pub timed_out: bool,
    /// Some part of the corpus is missing from the results.
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardedSearchResponse {
    pub results: Vec<SearchResult>,
    pub stats: SearchStats,
}

/// Heap entry ordered by [`rank_order`]: the greatest is the worst-ranked.
struct Ranked(SearchResult);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        rank_order(&self.0, &other.0)
    }
}

/// Global top-k, fed one shard list at a time.
struct TopK {
    k: usize,
    heap: BinaryHeap<Ranked>,
}

impl TopK {
    fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    fn extend(&mut self, results: Vec<SearchResult>) {
        for result in results {
            self.heap.push(Ranked(result));
            if self.heap.len() > self.k {
                self.heap.pop();
            }
        }
    }

    fn sorted(&self) -> Vec<SearchResult> {
        let mut results: Vec<SearchResult> = self.heap.iter().map(|r| r.0.clone()).collect();
        results.sort_by(rank_order);
        results
    }
}

pub struct ShardedSearcher {
    shards: Arc<dyn ShardSet>,
    embedder: Arc<dyn EmbeddingProvider>,
    deadline: Duration,
}

impl ShardedSearcher {
    pub fn new(shards: Arc<dyn ShardSet>, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        if shards.expected_dimension() != embedder.embedding_dimension() {
            return Err(RetrieverError::DimensionMismatch {
                expected: shards.expected_dimension(),
                actual: embedder.embedding_dimension(),
            });
        }
        if shards.expected_backend() != embedder.provider_name() {
            return Err(RetrieverError::BackendMismatch {
                expected: shards.expected_backend().to_string(),
                actual: embedder.provider_name().to_string(),
            });
        }
        Ok(Self {
            shards,
            embedder,
            deadline: Duration::from_secs(2),
        })
    }

    /// Global time budget for one search, query embedding included.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<ShardedSearchResponse> {
        self.search_with_progress(query, options, |_| {}).await
    }

    /// Search every available shard, calling `on_progress` after each shard
    /// lands and once more with the final merge.
    pub async fn search_with_progress<F>(
        &self,
        query: &str,
        options: &SearchOptions,
        mut on_progress: F,
    ) -> Result<ShardedSearchResponse>
    where
        F: FnMut(&SearchProgress),
    {
        let snapshot = self.shards.snapshot().await;
        let mut stats = SearchStats {
            shards_skipped: snapshot.skipped.clone(),
            ..SearchStats::default()
        };
        let shards_total = snapshot.live.len();

        if query.trim().is_empty() || options.k == 0 {
            stats.partial = !stats.shards_skipped.is_empty();
            on_progress(&SearchProgress {
                merged: Vec::new(),
                shards_completed: 0,
                shards_total,
                is_final: true,
            });
            return Ok(ShardedSearchResponse {
                results: Vec::new(),
                stats,
            });
        }

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.deadline;
        let vector = match tokio::time::timeout_at(deadline, self.embedder.embed_text(query)).await {
            Ok(vector) => vector?,
            Err(_) => {
                tracing::warn!(
                    "Query embedding missed the {:?} search deadline",
                    self.deadline
                );
                stats.timed_out = true;
                stats.partial = true;
                on_progress(&SearchProgress {
                    merged: Vec::new(),
                    shards_completed: 0,
                    shards_total,
                    is_final: true,
                });
                return Ok(ShardedSearchResponse {
                    results: Vec::new(),
                    stats,
                });
            }
        };
        check_dimension(self.shards.expected_dimension(), &vector)?;
        let vector = Arc::new(vector);

        let mut pending = FuturesUnordered::new();
        let mut aborts = BTreeMap::new();
        for (shard_id, store) in snapshot.live {
            let vector = vector.clone();
            let k = options.k;
            let filter = options.filter.clone();
            let handle = tokio::spawn(async move {
                let begun = Instant::now();
                let result = store.search(&vector, k, &filter).await;
                (result, begun.elapsed())
            });
            aborts.insert(shard_id, handle.abort_handle());
            pending.push(async move { (shard_id, handle.await) });
        }
        stats.shards_queried = shards_total;

        let mut top = TopK::new(options.k);
        let mut completed = 0;
        loop {
            let next = match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => {
                    stats.timed_out = true;
                    break;
                }
            };
            let (shard_id, joined) = next;
            aborts.remove(&shard_id);
            completed += 1;
            match joined {
                Ok((Ok(mut results), latency)) => {
                    for result in &mut results {
                        result.shard_id = Some(shard_id);
                    }
                    stats.latencies.insert(shard_id, latency);
                    top.extend(results);
                }
                Ok((Err(e), latency)) => {
                    tracing::warn!("Shard {} search failed: {}", shard_id, e);
                    stats.latencies.insert(shard_id, latency);
                    stats.errors.insert(shard_id, e.to_string());
                }
                Err(e) => {
                    tracing::warn!("Shard {} search task failed: {}", shard_id, e);
                    stats.errors.insert(shard_id, e.to_string());
                }
            }

            let mut merged = top.sorted();
            options.apply_threshold(&mut merged);
            on_progress(&SearchProgress {
                merged,
                shards_completed: completed,
                shards_total,
                is_final: false,
            });
        }

        for (shard_id, abort) in aborts {
            abort.abort();
            tracing::warn!("Shard {} missed the {:?} search deadline", shard_id, self.deadline);
            stats.errors.insert(shard_id, "timed out".to_string());
        }
        stats.partial =
            stats.timed_out || !stats.errors.is_empty() || !stats.shards_skipped.is_empty();

        let mut results = top.sorted();
        options.apply_threshold(&mut results);
        on_progress(&SearchProgress {
            merged: results.clone(),
            shards_completed: completed,
            shards_total,
            is_final: true,
        });
        tracing::debug!(
            "Sharded query {:?}: {} results from {}/{} shards in {:?}{}",
            query,
            results.len(),
            completed,
            shards_total,
            started.elapsed(),
            if stats.partial { " (partial)" } else { "" }
        );
        Ok(ShardedSearchResponse { results, stats })
    }
}
