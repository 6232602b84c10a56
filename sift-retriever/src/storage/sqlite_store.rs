//! SQLite-backed [`VectorStore`]
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE store_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
//!
//! CREATE TABLE files (
//!     path TEXT PRIMARY KEY,
//!     indexed_at TIMESTAMP NOT NULL
//! );
//!
//! CREATE TABLE chunks (
//!     chunk_id TEXT PRIMARY KEY,       -- blake3 hex from the chunker
//!     file_path TEXT NOT NULL REFERENCES files(path) ON DELETE CASCADE,
//!     start_line INTEGER NOT NULL,
//!     end_line INTEGER NOT NULL,
//!     symbol_name TEXT,
//!     language TEXT NOT NULL,
//!     content TEXT NOT NULL,
//!     content_hash TEXT NOT NULL,
//!     embedding BLOB NOT NULL          -- f16 vector
//! );
//! ```
//!
//! `store_meta` pins the dimension and backend id at creation. Search runs
//! over an in-memory mirror that is loaded on open and updated only after a
//! write transaction commits, so readers never wait on SQLite.

use super::{
    ChunkId, ChunkRecord, IndexStats, SearchFilter, SearchResult, VectorEntry, VectorStore,
    check_dimension, decode_vector, dot, encode_vector, quantize, rank_records,
};
use crate::error::{Result, RetrieverError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::{Mutex, RwLock};

const META_DIMENSION: &str = "dimension";
const META_BACKEND: &str = "backend_id";
const META_CREATED_AT: &str = "created_at";

struct StoredVector {
    record: ChunkRecord,
    vector: Vec<f32>,
}

/// A scored mirror entry. In a max-heap the greatest is the worst-ranked.
struct Candidate<'a> {
    score: f32,
    record: &'a ChunkRecord,
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate<'_> {}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        rank_records((self.score, self.record), (other.score, other.record))
    }
}

/// In-memory copy of the committed rows.
#[derive(Default)]
struct Mirror {
    vectors: HashMap<ChunkId, StoredVector>,
    by_file: BTreeMap<String, BTreeSet<ChunkId>>,
    indexed_at: HashMap<String, DateTime<Utc>>,
}

impl Mirror {
    fn insert(&mut self, record: ChunkRecord, vector: Vec<f32>) {
        self.by_file
            .entry(record.file_path.clone())
            .or_default()
            .insert(record.chunk_id.clone());
        self.vectors
            .insert(record.chunk_id.clone(), StoredVector { record, vector });
    }

    fn remove(&mut self, chunk_id: &str) -> bool {
        let Some(stored) = self.vectors.remove(chunk_id) else {
            return false;
        };
        let path = &stored.record.file_path;
        if let Some(ids) = self.by_file.get_mut(path) {
            ids.remove(chunk_id);
            if ids.is_empty() {
                self.by_file.remove(path);
                self.indexed_at.remove(path);
            }
        }
        true
    }

    fn ids_for(&self, file_path: &str) -> Vec<ChunkId> {
        self.by_file
            .get(file_path)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct SqliteVectorStore {
    path: Option<PathBuf>,
    pool: SqlitePool,
    dimension: usize,
    backend_id: String,
    mirror: RwLock<Mirror>,
    writer: Mutex<()>,
}

impl std::fmt::Debug for SqliteVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVectorStore")
            .field("path", &self.path)
            .field("dimension", &self.dimension)
            .field("backend_id", &self.backend_id)
            .finish()
    }
}

impl SqliteVectorStore {
    /// Open or create the store at `path`.
    ///
    /// A new store is pinned to `dimension` and `backend_id`; an existing one
    /// must match them.
    pub async fn open(path: &Path, dimension: usize, backend_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = SqlitePool::connect_with(Self::connect_options(path)).await?;
        Self::with_pool(Some(path.to_path_buf()), pool, Some((dimension, backend_id))).await
    }

    /// Open a store that must already exist, taking its dimension and backend from disk.
    pub async fn open_existing(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RetrieverError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no index at {}", path.display()),
                ),
            });
        }
        let pool = SqlitePool::connect_with(Self::connect_options(path)).await?;
        Self::with_pool(Some(path.to_path_buf()), pool, None).await
    }

    /// A store that lives only as long as this value. Intended for tests.
    pub async fn open_memory(dimension: usize, backend_id: &str) -> Result<Self> {
        // One connection that never expires: each new connection would be a new database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await?;
        Self::with_pool(None, pool, Some((dimension, backend_id))).await
    }

    fn connect_options(path: &Path) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true)
            .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::Full)
            .page_size(1 << 16)
            .optimize_on_close(true, 1 << 10)
    }

    async fn with_pool(
        path: Option<PathBuf>,
        pool: SqlitePool,
        expected: Option<(usize, &str)>,
    ) -> Result<Self> {
        Self::create_tables(&pool).await?;
        let display = path.clone().unwrap_or_else(|| PathBuf::from(":memory:"));

        let (dimension, backend_id) = match (Self::read_identity(&pool).await?, expected) {
            (Some((dim, backend)), Some((want_dim, want_backend))) => {
                if dim != want_dim {
                    return Err(RetrieverError::DimensionMismatch {
                        expected: dim,
                        actual: want_dim,
                    });
                }
                if backend != want_backend {
                    return Err(RetrieverError::BackendMismatch {
                        expected: backend,
                        actual: want_backend.to_string(),
                    });
                }
                (dim, backend)
            }
            (Some(identity), None) => identity,
            (None, Some((dim, backend))) => {
                if dim == 0 {
                    return Err(RetrieverError::invalid_config("dimension must be positive"));
                }
                Self::write_identity(&pool, dim, backend).await?;
                (dim, backend.to_string())
            }
            (None, None) => {
                return Err(RetrieverError::corrupt(display, "missing store metadata"));
            }
        };

        let mirror = Self::load_mirror(&pool, dimension, &display).await?;
        let store_path = display.display();
        tracing::info!(
            "Opened vector store {} ({} chunks, {} files, dimension {}, backend {})",
            store_path,
            mirror.vectors.len(),
            mirror.by_file.len(),
            dimension,
            backend_id
        );

        Ok(Self {
            path,
            pool,
            dimension,
            backend_id,
            mirror: RwLock::new(mirror),
            writer: Mutex::new(()),
        })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                path TEXT PRIMARY KEY,
                indexed_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                file_path TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                symbol_name TEXT,
                language TEXT NOT NULL,
                content TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                embedding BLOB NOT NULL,
                FOREIGN KEY (file_path) REFERENCES files(path) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path)")
            .execute(pool)
            .await?;

        Ok(())
    }

    async fn read_identity(pool: &SqlitePool) -> Result<Option<(usize, String)>> {
        let rows = sqlx::query("SELECT key, value FROM store_meta")
            .fetch_all(pool)
            .await?;
        let meta: HashMap<String, String> = rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect();

        match (meta.get(META_DIMENSION), meta.get(META_BACKEND)) {
            (Some(dim), Some(backend)) => {
                let dim = dim.parse::<usize>().map_err(|e| {
                    RetrieverError::invalid_config(format!("stored dimension '{dim}': {e}"))
                })?;
                Ok(Some((dim, backend.clone())))
            }
            _ => Ok(None),
        }
    }

    async fn write_identity(pool: &SqlitePool, dimension: usize, backend_id: &str) -> Result<()> {
        let mut tx = pool.begin().await?;
        for (key, value) in [
            (META_DIMENSION, dimension.to_string()),
            (META_BACKEND, backend_id.to_string()),
            (META_CREATED_AT, Utc::now().to_rfc3339()),
        ] {
            sqlx::query("INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)")
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_mirror(pool: &SqlitePool, dimension: usize, display: &Path) -> Result<Mirror> {
        let mut mirror = Mirror::default();

        let files = sqlx::query("SELECT path, indexed_at FROM files")
            .fetch_all(pool)
            .await?;
        for row in files {
            let path: String = row.get("path");
            let indexed_at: DateTime<Utc> = row.get("indexed_at");
            mirror.indexed_at.insert(path, indexed_at);
        }

        let rows = sqlx::query(
            "SELECT chunk_id, file_path, start_line, end_line, symbol_name, language, content, content_hash, embedding FROM chunks",
        )
        .fetch_all(pool)
        .await?;

        for row in rows {
            let chunk_id: String = row.get("chunk_id");
            let embedding_bytes: Vec<u8> = row.get("embedding");
            if embedding_bytes.len() != dimension * 2 {
                return Err(RetrieverError::corrupt(
                    display,
                    format!(
                        "chunk {chunk_id} has a {}-byte embedding, expected {}",
                        embedding_bytes.len(),
                        dimension * 2
                    ),
                ));
            }
            let start_line: i64 = row.get("start_line");
            let end_line: i64 = row.get("end_line");
            let record = ChunkRecord {
                chunk_id,
                file_path: row.get("file_path"),
                start_line: start_line as usize,
                end_line: end_line as usize,
                symbol_name: row.get("symbol_name"),
                language: row.get("language"),
                content: row.get("content"),
                content_hash: row.get("content_hash"),
            };
            mirror.insert(record, decode_vector(&embedding_bytes));
        }
        Ok(mirror)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Close the connection pool, checkpointing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Write `entries` and drop `stale` ids in one transaction, then mirror it.
    async fn commit(
        &self,
        entries: Vec<VectorEntry>,
        stale: Vec<ChunkId>,
        cleared_file: Option<&str>,
    ) -> Result<()> {
        for entry in &entries {
            check_dimension(self.dimension, &entry.vector)?;
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for chunk_id in &stale {
            sqlx::query("DELETE FROM chunks WHERE chunk_id = ?1")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(path) = cleared_file {
            sqlx::query("DELETE FROM files WHERE path = ?1")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }

        let touched: BTreeSet<&str> = entries
            .iter()
            .map(|e| e.record.file_path.as_str())
            .collect();
        for path in &touched {
            sqlx::query(
                r#"
                INSERT INTO files (path, indexed_at) VALUES (?1, ?2)
                ON CONFLICT(path) DO UPDATE SET indexed_at = excluded.indexed_at
                "#,
            )
            .bind(*path)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        for entry in &entries {
            let record = &entry.record;
            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_id, file_path, start_line, end_line, symbol_name, language, content, content_hash, embedding)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    file_path = excluded.file_path,
                    start_line = excluded.start_line,
                    end_line = excluded.end_line,
                    symbol_name = excluded.symbol_name,
                    language = excluded.language,
                    content = excluded.content,
                    content_hash = excluded.content_hash,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&record.chunk_id)
            .bind(&record.file_path)
            .bind(record.start_line as i64)
            .bind(record.end_line as i64)
            .bind(&record.symbol_name)
            .bind(&record.language)
            .bind(&record.content)
            .bind(&record.content_hash)
            .bind(encode_vector(&entry.vector))
            .execute(&mut *tx)
            .await?;
        }

        // Files left without chunks are dropped so `files` mirrors `chunks`.
        sqlx::query("DELETE FROM files WHERE path NOT IN (SELECT DISTINCT file_path FROM chunks)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let mut mirror = self.mirror.write().await;
        for chunk_id in &stale {
            mirror.remove(chunk_id);
        }
        if let Some(path) = cleared_file {
            for chunk_id in mirror.ids_for(path) {
                mirror.remove(&chunk_id);
            }
        }
        for path in touched {
            mirror.indexed_at.insert(path.to_string(), now);
        }
        for entry in entries {
            let vector = quantize(&entry.vector);
            mirror.remove(&entry.record.chunk_id);
            mirror.insert(entry.record, vector);
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    async fn upsert_batch(&self, entries: Vec<VectorEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _writer = self.writer.lock().await;
        self.commit(entries, Vec::new(), None).await
    }

    async fn delete_by_id(&self, chunk_id: &str) -> Result<bool> {
        let _writer = self.writer.lock().await;
        if !self.mirror.read().await.vectors.contains_key(chunk_id) {
            return Ok(false);
        }
        self.commit(Vec::new(), vec![chunk_id.to_string()], None)
            .await?;
        Ok(true)
    }

    async fn delete_by_file(&self, file_path: &str) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let existing = self.mirror.read().await.ids_for(file_path);
        if existing.is_empty() {
            return Ok(0);
        }
        self.commit(Vec::new(), Vec::new(), Some(file_path)).await?;
        tracing::debug!("Deleted {} chunks of {}", existing.len(), file_path);
        Ok(existing.len())
    }

    async fn replace_file(
        &self,
        file_path: &str,
        current: &[ChunkId],
        entries: Vec<VectorEntry>,
    ) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let keep: BTreeSet<&str> = current.iter().map(String::as_str).collect();
        let stale: Vec<ChunkId> = self
            .mirror
            .read()
            .await
            .ids_for(file_path)
            .into_iter()
            .filter(|id| !keep.contains(id.as_str()))
            .collect();
        if stale.is_empty() && entries.is_empty() {
            return Ok(0);
        }
        let removed = stale.len();
        self.commit(entries, stale, None).await?;
        Ok(removed)
    }

    async fn chunk_ids_for_file(&self, file_path: &str) -> Result<Vec<ChunkId>> {
        Ok(self.mirror.read().await.ids_for(file_path))
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchResult>> {
        check_dimension(self.dimension, query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mirror = self.mirror.read().await;
        let mut top = BinaryHeap::with_capacity(k + 1);
        for stored in mirror.vectors.values() {
            if !filter.matches(&stored.record) {
                continue;
            }
            top.push(Candidate {
                score: dot(query, &stored.vector),
                record: &stored.record,
            });
            if top.len() > k {
                top.pop();
            }
        }

        // Only the survivors are copied out of the mirror.
        Ok(top
            .into_sorted_vec()
            .into_iter()
            .map(|candidate| SearchResult {
                chunk: candidate.record.clone(),
                score: candidate.score,
                shard_id: None,
            })
            .collect())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let mirror = self.mirror.read().await;
        let size_bytes = mirror
            .vectors
            .values()
            .map(|s| (s.record.content.len() + self.dimension * 2) as u64)
            .sum();
        Ok(IndexStats {
            total_chunks: mirror.vectors.len(),
            total_files: mirror.by_file.len(),
            size_bytes,
            last_indexed_at: mirror.indexed_at.values().max().copied(),
        })
    }

    async fn files(&self) -> Result<Vec<String>> {
        Ok(self.mirror.read().await.by_file.keys().cloned().collect())
    }
}
