//! Partitioning a corpus across several vector stores
//!
//! ## Layout
//!
//! ```text
//! <dir>/meta.json        shard usage and file → shard ownership
//! <dir>/shard-0000.db    one SqliteVectorStore per shard
//! <dir>/shard-0001.db
//! ```
//!
//! A file is assigned to a shard the first time it is written and stays
//! there until it is deleted, so re-indexing a file touches one shard only.
//! A new shard is created once every shard holds `max_chunks_per_shard`
//! chunks or more.

pub mod indexer;
pub mod meta_index;
pub mod searcher;
pub mod store;

pub use indexer::{IndexBatchResult, ShardedIndexer};
pub use meta_index::{MetaIndex, ShardInfo};
pub use searcher::{SearchProgress, SearchStats, ShardedSearchResponse, ShardedSearcher};
pub use store::{ShardHealth, ShardSet, ShardSnapshot, ShardedVectorStore};

pub type ShardId = u32;
