//! The meta-index: shard usage and file ownership, persisted as `meta.json`.

use super::ShardId;
use crate::error::{Result, RetrieverError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const META_FILE: &str = "meta.json";
const META_VERSION: u32 = 1;

pub fn shard_file_name(shard_id: ShardId) -> String {
    format!("shard-{shard_id:04}.db")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: ShardId,
    pub chunk_count: usize,
    pub size_bytes: u64,
    /// Parent directories of the files this shard owns.
    pub owned_path_prefixes: BTreeSet<String>,
}

impl ShardInfo {
    fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            chunk_count: 0,
            size_bytes: 0,
            owned_path_prefixes: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaIndex {
    pub version: u32,
    pub dimension: usize,
    pub backend_id: String,
    pub max_chunks_per_shard: usize,
    pub shards: BTreeMap<ShardId, ShardInfo>,
    /// File key → owning shard. An entry is only removed by an explicit delete.
    pub assignments: BTreeMap<String, ShardId>,
}

impl MetaIndex {
    pub fn new(dimension: usize, backend_id: impl Into<String>, max_chunks_per_shard: usize) -> Self {
        Self {
            version: META_VERSION,
            dimension,
            backend_id: backend_id.into(),
            max_chunks_per_shard: max_chunks_per_shard.max(1),
            shards: BTreeMap::new(),
            assignments: BTreeMap::new(),
        }
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(META_FILE)
    }

    /// `None` when the directory has no meta-index yet.
    pub async fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: Self = serde_json::from_slice(&bytes)
            .map_err(|e| RetrieverError::corrupt(&path, e.to_string()))?;
        if meta.version != META_VERSION {
            return Err(RetrieverError::corrupt(
                &path,
                format!("unsupported meta-index version {}", meta.version),
            ));
        }
        for (file, shard) in &meta.assignments {
            if !meta.shards.contains_key(shard) {
                return Err(RetrieverError::corrupt(
                    &path,
                    format!("{file} is assigned to missing shard {shard}"),
                ));
            }
        }
        Ok(Some(meta))
    }

    /// Write via a temp file and rename so readers never see a torn file.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        let path = Self::path_in(dir);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub fn shard_of(&self, file: &str) -> Option<ShardId> {
        self.assignments.get(file).copied()
    }

    /// Shard with the most room under the threshold, lowest id on ties.
    ///
    /// `None` means every eligible shard is full and a new one is needed.
    pub fn choose_shard(&self, eligible: impl Fn(ShardId) -> bool) -> Option<ShardId> {
        self.shards
            .values()
            .filter(|info| eligible(info.shard_id))
            .filter(|info| info.chunk_count < self.max_chunks_per_shard)
            .min_by_key(|info| (info.chunk_count, info.shard_id))
            .map(|info| info.shard_id)
    }

    pub fn next_shard_id(&self) -> ShardId {
        self.shards
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(0)
    }

    pub fn add_shard(&mut self, shard_id: ShardId) {
        self.shards
            .entry(shard_id)
            .or_insert_with(|| ShardInfo::new(shard_id));
    }

    /// Record `file` as owned by `shard_id`, reserving `estimated_chunks` of
    /// its capacity until the real count is refreshed.
    pub fn assign(&mut self, file: &str, shard_id: ShardId, estimated_chunks: usize) {
        self.assignments.insert(file.to_string(), shard_id);
        let info = self
            .shards
            .entry(shard_id)
            .or_insert_with(|| ShardInfo::new(shard_id));
        info.chunk_count += estimated_chunks;
        info.owned_path_prefixes.insert(parent_prefix(file));
    }

    pub fn unassign(&mut self, file: &str) -> Option<ShardId> {
        let shard_id = self.assignments.remove(file)?;
        let prefixes = self.prefixes_of(shard_id);
        if let Some(info) = self.shards.get_mut(&shard_id) {
            info.owned_path_prefixes = prefixes;
        }
        Some(shard_id)
    }

    pub fn set_usage(&mut self, shard_id: ShardId, chunk_count: usize, size_bytes: u64) {
        if let Some(info) = self.shards.get_mut(&shard_id) {
            info.chunk_count = chunk_count;
            info.size_bytes = size_bytes;
        }
    }

    pub fn files_of(&self, shard_id: ShardId) -> impl Iterator<Item = &str> {
        self.assignments
            .iter()
            .filter(move |(_, id)| **id == shard_id)
            .map(|(file, _)| file.as_str())
    }

    fn prefixes_of(&self, shard_id: ShardId) -> BTreeSet<String> {
        self.files_of(shard_id).map(parent_prefix).collect()
    }
}

/// `src/net/http.rs` → `src/net/`; top-level files → ``.
fn parent_prefix(file: &str) -> String {
    match file.rfind('/') {
        Some(idx) => file[..=idx].to_string(),
        None => String::new(),
    }
}
