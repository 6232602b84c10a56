use super::ShardId;
use super::meta_index::{MetaIndex, ShardInfo, shard_file_name};
use crate::error::{Result, RetrieverError};
use crate::storage::{
    ChunkId, IndexStats, SearchFilter, SearchResult, SqliteVectorStore, VectorEntry, VectorStore,
    rank_order,
};
use async_trait::async_trait;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardHealth {
    Available,
    /// Failed to open; excluded from search and writes until reopened.
    Unavailable(String),
}

/// Shards a search can fan out to at one moment.
pub struct ShardSnapshot {
    pub live: Vec<(ShardId, Arc<dyn VectorStore>)>,
    /// Known shards that are unavailable.
    pub skipped: Vec<ShardId>,
}

/// The read side of a sharded store, as seen by the sharded searcher.
#[async_trait]
pub trait ShardSet: Send + Sync {
    /// Dimension every shard stores.
    fn expected_dimension(&self) -> usize;
    /// Backend every shard was built with.
    fn expected_backend(&self) -> &str;
    async fn snapshot(&self) -> ShardSnapshot;
}

/// N shard stores behind one [`VectorStore`], plus the meta-index.
pub struct ShardedVectorStore {
    dir: PathBuf,
    dimension: usize,
    backend_id: String,
    meta: RwLock<MetaIndex>,
    shards: RwLock<BTreeMap<ShardId, Arc<SqliteVectorStore>>>,
    unavailable: RwLock<BTreeMap<ShardId, String>>,
    /// One write lock per shard, so writes to different shards run in parallel.
    writers: Mutex<BTreeMap<ShardId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ShardedVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedVectorStore")
            .field("dir", &self.dir)
            .field("dimension", &self.dimension)
            .field("backend_id", &self.backend_id)
            .finish()
    }
}

impl ShardedVectorStore {
    /// Open the shard set in `dir`, creating it when absent.
    ///
    /// Shards that fail to open are marked unavailable; the rest keep serving.
    pub async fn open(
        dir: &Path,
        dimension: usize,
        backend_id: &str,
        max_chunks_per_shard: usize,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let mut meta = match MetaIndex::load(dir).await? {
            Some(meta) => {
                if meta.dimension != dimension {
                    return Err(RetrieverError::DimensionMismatch {
                        expected: meta.dimension,
                        actual: dimension,
                    });
                }
                if meta.backend_id != backend_id {
                    return Err(RetrieverError::BackendMismatch {
                        expected: meta.backend_id,
                        actual: backend_id.to_string(),
                    });
                }
                meta
            }
            None => MetaIndex::new(dimension, backend_id, max_chunks_per_shard),
        };
        meta.max_chunks_per_shard = max_chunks_per_shard.max(1);
        meta.save(dir).await?;
        Self::with_meta(dir, meta).await
    }

    /// Open a shard set that must already exist.
    pub async fn open_existing(dir: &Path) -> Result<Self> {
        let meta = MetaIndex::load(dir).await?.ok_or_else(|| RetrieverError::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no sharded index at {}", dir.display()),
            ),
        })?;
        Self::with_meta(dir, meta).await
    }

    async fn with_meta(dir: &Path, meta: MetaIndex) -> Result<Self> {
        let mut shards = BTreeMap::new();
        let mut unavailable = BTreeMap::new();

        for &shard_id in meta.shards.keys() {
            let path = dir.join(shard_file_name(shard_id));
            match Self::open_shard(&path, &meta).await {
                Ok(store) => {
                    shards.insert(shard_id, Arc::new(store));
                }
                Err(e) => {
                    tracing::warn!("Shard {} is unavailable: {}", shard_id, e);
                    unavailable.insert(shard_id, e.to_string());
                }
            }
        }
        tracing::info!(
            "Opened sharded store {} ({} shards, {} unavailable, {} files)",
            dir.display(),
            meta.shards.len(),
            unavailable.len(),
            meta.assignments.len()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            dimension: meta.dimension,
            backend_id: meta.backend_id.clone(),
            meta: RwLock::new(meta),
            shards: RwLock::new(shards),
            unavailable: RwLock::new(unavailable),
            writers: Mutex::new(BTreeMap::new()),
        })
    }

    async fn open_shard(path: &Path, meta: &MetaIndex) -> Result<SqliteVectorStore> {
        let store = SqliteVectorStore::open_existing(path).await?;
        if store.dimension() != meta.dimension {
            return Err(RetrieverError::DimensionMismatch {
                expected: meta.dimension,
                actual: store.dimension(),
            });
        }
        if store.backend_id() != meta.backend_id {
            return Err(RetrieverError::BackendMismatch {
                expected: meta.backend_id.clone(),
                actual: store.backend_id().to_string(),
            });
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn shard_for(&self, file: &str) -> Option<ShardId> {
        self.meta.read().await.shard_of(file)
    }

    pub async fn shard_infos(&self) -> Vec<ShardInfo> {
        self.meta.read().await.shards.values().cloned().collect()
    }

    pub async fn health(&self, shard_id: ShardId) -> Result<ShardHealth> {
        if !self.meta.read().await.shards.contains_key(&shard_id) {
            return Err(RetrieverError::UnknownShard { shard: shard_id });
        }
        Ok(match self.unavailable.read().await.get(&shard_id) {
            Some(reason) => ShardHealth::Unavailable(reason.clone()),
            None => ShardHealth::Available,
        })
    }

    pub async fn unavailable_shards(&self) -> BTreeMap<ShardId, String> {
        self.unavailable.read().await.clone()
    }

    /// The store for `shard_id`, or why it can't be used.
    pub async fn shard(&self, shard_id: ShardId) -> Result<Arc<SqliteVectorStore>> {
        if let Some(store) = self.shards.read().await.get(&shard_id) {
            return Ok(store.clone());
        }
        match self.unavailable.read().await.get(&shard_id) {
            Some(reason) => Err(RetrieverError::ShardUnavailable {
                shard: shard_id,
                reason: reason.clone(),
            }),
            None => Err(RetrieverError::UnknownShard { shard: shard_id }),
        }
    }

    /// The owning shard of `file`, assigning it on first sight.
    ///
    /// New files go to the available shard with the most room, reserving
    /// `estimated_chunks`; a shard is created when none has room.
    pub async fn assign(&self, file: &str, estimated_chunks: usize) -> Result<ShardId> {
        let mut meta = self.meta.write().await;
        if let Some(shard_id) = meta.shard_of(file) {
            return Ok(shard_id);
        }

        let choice = {
            let unavailable = self.unavailable.read().await;
            meta.choose_shard(|id| !unavailable.contains_key(&id))
        };
        let shard_id = match choice {
            Some(shard_id) => shard_id,
            None => {
                let shard_id = meta.next_shard_id();
                let path = self.dir.join(shard_file_name(shard_id));
                let store = SqliteVectorStore::open(&path, self.dimension, &self.backend_id).await?;
                self.shards.write().await.insert(shard_id, Arc::new(store));
                meta.add_shard(shard_id);
                tracing::info!("Created shard {} at {}", shard_id, path.display());
                shard_id
            }
        };
        meta.assign(file, shard_id, estimated_chunks.max(1));
        meta.save(&self.dir).await?;
        tracing::debug!("Assigned {} to shard {}", file, shard_id);
        Ok(shard_id)
    }

    /// Recompute a shard's usage from its contents and persist it.
    pub async fn refresh_shard_info(&self, shard_id: ShardId) -> Result<ShardInfo> {
        let stats = self.shard(shard_id).await?.stats().await?;
        let mut meta = self.meta.write().await;
        meta.set_usage(shard_id, stats.total_chunks, stats.size_bytes);
        meta.save(&self.dir).await?;
        meta.shards
            .get(&shard_id)
            .cloned()
            .ok_or(RetrieverError::UnknownShard { shard: shard_id })
    }

    /// Close every shard's connections.
    pub async fn close(&self) {
        for (_, store) in self.live_shards().await {
            store.close().await;
        }
    }

    async fn shard_writer(&self, shard_id: ShardId) -> OwnedMutexGuard<()> {
        let lock = self
            .writers
            .lock()
            .await
            .entry(shard_id)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Lock the shard that owns `file`, assigning one first when `reserve` is set.
    async fn lock_owner(
        &self,
        file: &str,
        reserve: Option<usize>,
    ) -> Result<Option<(ShardId, OwnedMutexGuard<()>)>> {
        loop {
            let shard_id = match (self.shard_for(file).await, reserve) {
                (Some(shard_id), _) => shard_id,
                (None, Some(chunks)) => self.assign(file, chunks).await?,
                (None, None) => return Ok(None),
            };
            let guard = self.shard_writer(shard_id).await;
            // A delete may have released the assignment while we waited.
            if self.shard_for(file).await == Some(shard_id) {
                return Ok(Some((shard_id, guard)));
            }
        }
    }

    async fn assigned_shard(&self, file: &str) -> Result<Option<(ShardId, Arc<SqliteVectorStore>)>> {
        match self.shard_for(file).await {
            Some(shard_id) => Ok(Some((shard_id, self.shard(shard_id).await?))),
            None => Ok(None),
        }
    }

    async fn live_shards(&self) -> Vec<(ShardId, Arc<SqliteVectorStore>)> {
        self.shards
            .read()
            .await
            .iter()
            .map(|(id, store)| (*id, store.clone()))
            .collect()
    }
}

#[async_trait]
impl VectorStore for ShardedVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    async fn upsert_batch(&self, entries: Vec<VectorEntry>) -> Result<()> {
        for entry in &entries {
            crate::storage::check_dimension(self.dimension, &entry.vector)?;
        }
        let by_file = entries
            .into_iter()
            .into_group_map_by(|e| e.record.file_path.clone());

        for (file, group) in by_file.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
            let Some((shard_id, _writer)) = self.lock_owner(&file, Some(group.len())).await? else {
                continue;
            };
            self.shard(shard_id).await?.upsert_batch(group).await?;
            self.refresh_shard_info(shard_id).await?;
        }
        Ok(())
    }

    async fn delete_by_id(&self, chunk_id: &str) -> Result<bool> {
        for (shard_id, store) in self.live_shards().await {
            let _writer = self.shard_writer(shard_id).await;
            if store.delete_by_id(chunk_id).await? {
                self.refresh_shard_info(shard_id).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Also releases the file's shard assignment.
    async fn delete_by_file(&self, file_path: &str) -> Result<usize> {
        let Some((shard_id, _writer)) = self.lock_owner(file_path, None).await? else {
            return Ok(0);
        };
        let removed = self.shard(shard_id).await?.delete_by_file(file_path).await?;
        self.meta.write().await.unassign(file_path);
        self.refresh_shard_info(shard_id).await?;
        Ok(removed)
    }

    async fn replace_file(
        &self,
        file_path: &str,
        current: &[ChunkId],
        entries: Vec<VectorEntry>,
    ) -> Result<usize> {
        for entry in &entries {
            crate::storage::check_dimension(self.dimension, &entry.vector)?;
        }
        let reserve = (!entries.is_empty()).then_some(entries.len());
        let Some((shard_id, _writer)) = self.lock_owner(file_path, reserve).await? else {
            return Ok(0);
        };
        let removed = self
            .shard(shard_id)
            .await?
            .replace_file(file_path, current, entries)
            .await?;
        self.refresh_shard_info(shard_id).await?;
        Ok(removed)
    }

    async fn chunk_ids_for_file(&self, file_path: &str) -> Result<Vec<ChunkId>> {
        match self.assigned_shard(file_path).await? {
            Some((_, store)) => store.chunk_ids_for_file(file_path).await,
            None => Ok(Vec::new()),
        }
    }

    /// Sequential fan-out over the available shards.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchResult>> {
        crate::storage::check_dimension(self.dimension, query)?;
        let mut merged = Vec::new();
        for (shard_id, store) in self.live_shards().await {
            let mut results = store.search(query, k, filter).await?;
            for result in &mut results {
                result.shard_id = Some(shard_id);
            }
            merged.extend(results);
        }
        merged.sort_by(rank_order);
        merged.truncate(k);
        Ok(merged)
    }

    /// Totals over the available shards.
    async fn stats(&self) -> Result<IndexStats> {
        let mut all = Vec::new();
        for (_, store) in self.live_shards().await {
            all.push(store.stats().await?);
        }
        Ok(IndexStats::combine(all))
    }

    async fn files(&self) -> Result<Vec<String>> {
        let mut files = BTreeSet::new();
        for (_, store) in self.live_shards().await {
            files.extend(store.files().await?);
        }
        Ok(files.into_iter().collect())
    }
}

#[async_trait]
impl ShardSet for ShardedVectorStore {
    fn expected_dimension(&self) -> usize {
        self.dimension
    }

    fn expected_backend(&self) -> &str {
        &self.backend_id
    }

    async fn snapshot(&self) -> ShardSnapshot {
        let live = self
            .live_shards()
            .await
            .into_iter()
            .map(|(id, store)| (id, store as Arc<dyn VectorStore>))
            .collect();
        let skipped = self.unavailable.read().await.keys().copied().collect();
        ShardSnapshot { live, skipped }
    }
}
