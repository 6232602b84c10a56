//! Sharded indexing and fan-out search against a real on-disk shard directory.

use anyhow::Result;
use sift_context::{ChunkOptions, Chunker};
use sift_embed::{EmbeddingProvider, HashEmbeddingProvider};
use sift_retriever::retrieval::{FileScanner, IndexOptions, Indexer, SearchOptions, Searcher};
use sift_retriever::sharded::{ShardId, ShardedIndexer, ShardedSearcher, ShardedVectorStore};
use sift_retriever::storage::{SearchResult, SqliteVectorStore, VectorStore};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

const DIM: usize = 128;

const FILES: [(&str, &str); 6] = [
    ("alpha.txt", "token bucket rate limiter refills every second"),
    ("beta.txt", "exponential backoff retry for flaky requests"),
    ("gamma.txt", "bloom filter answers membership with false positives"),
    ("delta.txt", "rate limiter rejects bursts above the bucket size"),
    ("epsilon.txt", "write ahead log replays entries after a crash"),
    ("zeta.txt", "retry budget caps the number of backoff attempts"),
];

struct Fixture {
    root: TempDir,
    index: TempDir,
    embedder: Arc<HashEmbeddingProvider>,
}

impl Fixture {
    async fn new() -> Result<Self> {
        let root = tempdir()?;
        for (name, content) in FILES {
            std::fs::write(root.path().join(name), format!("{content}\n"))?;
        }
        let embedder = HashEmbeddingProvider::new(DIM);
        embedder.initialize().await?;
        Ok(Self {
            root,
            index: tempdir()?,
            embedder: Arc::new(embedder),
        })
    }

    fn chunker() -> Chunker {
        Chunker::new(ChunkOptions {
            structure_aware: false,
            ..ChunkOptions::default()
        })
    }

    fn scanner(&self) -> FileScanner {
        FileScanner::new(self.root.path(), 1 << 20)
    }

    async fn sharded(&self, max_chunks: usize) -> Result<(Arc<ShardedVectorStore>, ShardedIndexer)> {
        let store = Arc::new(
            ShardedVectorStore::open(
                self.index.path(),
                DIM,
                self.embedder.provider_name(),
                max_chunks,
            )
            .await?,
        );
        let indexer = ShardedIndexer::new(
            store.clone(),
            self.embedder.clone(),
            Self::chunker(),
            self.scanner(),
        )?;
        Ok((store, indexer))
    }

    fn searcher(&self, store: &Arc<ShardedVectorStore>) -> Result<ShardedSearcher> {
        Ok(ShardedSearcher::new(store.clone(), self.embedder.clone())?)
    }
}

fn ranking(results: &[SearchResult]) -> Vec<(String, usize, f32)> {
    results
        .iter()
        .map(|r| (r.chunk.file_path.clone(), r.chunk.start_line, r.score))
        .collect()
}

fn all_paths() -> Vec<std::path::PathBuf> {
    FILES.iter().map(|(name, _)| name.into()).collect()
}

#[tokio::test]
async fn test_merged_top_k_matches_single_store() -> Result<()> {
    let fixture = Fixture::new().await?;
    let (sharded, indexer) = fixture.sharded(2).await?;
    indexer.index_files(all_paths(), false).await?;
    assert_eq!(sharded.shard_infos().await.len(), 3);

    let single = Arc::new(SqliteVectorStore::open_memory(DIM, fixture.embedder.provider_name()).await?);
    Indexer::new(
        single.clone(),
        fixture.embedder.clone(),
        Fixture::chunker(),
        fixture.scanner(),
    )?
    .index_directory(IndexOptions::default())
    .finish()
    .await?;

    let flat = Searcher::new(single, fixture.embedder.clone())?;
    let fanned = fixture.searcher(&sharded)?;
    for query in ["rate limiter bucket", "retry with backoff", "crash recovery log"] {
        for k in [1, 3, 6] {
            let options = SearchOptions::default().with_k(k);
            let expected = flat.search(query, &options).await?;
            let response = fanned.search(query, &options).await?;
            assert_eq!(ranking(&response.results), ranking(&expected), "{query:?} k={k}");
            assert!(!response.stats.partial);
            assert_eq!(response.stats.shards_queried, 3);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_rollover_and_stable_assignment() -> Result<()> {
    let fixture = Fixture::new().await?;
    let (store, indexer) = fixture.sharded(2).await?;
    let results = indexer.index_files(all_paths(), false).await?;

    let shard_ids: Vec<Option<ShardId>> = results.iter().map(|r| r.shard_id).collect();
    assert_eq!(shard_ids, vec![Some(0), Some(1), Some(2)]);
    assert!(results.iter().all(|r| r.files_succeeded == 2 && r.files_failed == 0));
    for info in store.shard_infos().await {
        assert_eq!(info.chunk_count, 2);
    }

    let before = store.shard_for("gamma.txt").await;
    std::fs::write(
        fixture.root.path().join("gamma.txt"),
        "bloom filter answers membership\nwith tunable false positive rate\n",
    )?;
    indexer.index_files(vec!["gamma.txt".into()], false).await?;
    assert_eq!(store.shard_for("gamma.txt").await, before);

    indexer.remove_file("alpha.txt").await?;
    assert_eq!(store.shard_for("alpha.txt").await, None);

    std::fs::write(fixture.root.path().join("eta.txt"), "consistent hashing ring\n")?;
    indexer.index_files(vec!["eta.txt".into()], false).await?;
    assert_eq!(store.shard_for("eta.txt").await, Some(0));
    Ok(())
}

#[tokio::test]
async fn test_reopen_restores_layout_and_results() -> Result<()> {
    let fixture = Fixture::new().await?;
    let (store, indexer) = fixture.sharded(2).await?;
    indexer.index_files(all_paths(), false).await?;

    let options = SearchOptions::default().with_k(4);
    let before = fixture.searcher(&store)?.search("retry backoff", &options).await?;
    let infos = store.shard_infos().await;
    let stats = store.stats().await?;
    store.close().await;
    drop(indexer);
    drop(store);

    let reopened = Arc::new(ShardedVectorStore::open_existing(fixture.index.path()).await?);
    assert!(reopened.unavailable_shards().await.is_empty());
    assert_eq!(reopened.shard_infos().await, infos);
    assert_eq!(reopened.stats().await?.total_chunks, stats.total_chunks);
    for (name, _) in FILES {
        assert!(reopened.shard_for(name).await.is_some(), "{name} lost its shard");
    }
    let after = fixture.searcher(&reopened)?.search("retry backoff", &options).await?;
    assert_eq!(ranking(&after.results), ranking(&before.results));
    Ok(())
}

#[tokio::test]
async fn test_unavailable_shard_is_excluded_not_fatal() -> Result<()> {
    let fixture = Fixture::new().await?;
    let (store, indexer) = fixture.sharded(2).await?;
    indexer.index_files(all_paths(), false).await?;
    let lost: Vec<String> = {
        let mut files = Vec::new();
        for (name, _) in FILES {
            if store.shard_for(name).await == Some(1) {
                files.push(name.to_string());
            }
        }
        files
    };
    assert_eq!(lost.len(), 2);
    store.close().await;
    drop(indexer);
    drop(store);

    std::fs::write(fixture.index.path().join("shard-0001.db"), vec![0x5a_u8; 8192])?;
    let store = Arc::new(ShardedVectorStore::open_existing(fixture.index.path()).await?);
    assert!(store.unavailable_shards().await.contains_key(&1));

    let response = fixture
        .searcher(&store)?
        .search("rate limiter retry backoff", &SearchOptions::default().with_k(10))
        .await?;
    assert!(response.stats.partial);
    assert_eq!(response.stats.shards_skipped, vec![1]);
    assert_eq!(response.results.len(), 4);
    assert!(response.results.iter().all(|r| !lost.contains(&r.chunk.file_path)));

    // Files of the broken shard fail alone; the rest of the run goes through.
    let indexer = ShardedIndexer::new(
        store.clone(),
        fixture.embedder.clone(),
        Fixture::chunker(),
        fixture.scanner(),
    )?;
    std::fs::write(fixture.root.path().join("theta.txt"), "lease renewal heartbeat\n")?;
    let mut paths: Vec<std::path::PathBuf> = lost.iter().map(Into::into).collect();
    paths.push("theta.txt".into());
    let results = indexer.index_files(paths, true).await?;

    let broken = results.iter().find(|r| r.shard_id == Some(1)).expect("shard 1 result");
    assert_eq!(broken.files_failed, 2);
    let placed = store.shard_for("theta.txt").await;
    assert!(matches!(placed, Some(id) if id != 1));
    let healthy = results.iter().find(|r| r.shard_id == placed).expect("new file result");
    assert_eq!(healthy.files_succeeded, 1);
    Ok(())
}

#[tokio::test]
async fn test_index_all_prunes_deleted_files() -> Result<()> {
    let fixture = Fixture::new().await?;
    let (store, indexer) = fixture.sharded(4).await?;
    indexer.index_all(false).await?;
    assert_eq!(store.stats().await?.total_files, 6);

    std::fs::remove_file(fixture.root.path().join("beta.txt"))?;
    indexer.index_all(false).await?;
    assert_eq!(store.stats().await?.total_files, 5);
    assert_eq!(store.shard_for("beta.txt").await, None);
    assert!(!store.files().await?.iter().any(|f| f == "beta.txt"));
    Ok(())
}
