//! Indexing and search over a single [`VectorStore`](crate::storage::VectorStore)
//!
//! - **FileScanner**: ignore-aware file discovery
//! - **Indexer**: incremental per-file indexing, cancellable directory runs and change events
//! - **Searcher**: query embedding, ranking and thresholds

pub mod events;
pub mod indexer;
pub mod scanner;
pub mod searcher;

pub use events::{EventAction, EventOutcome, FileChangeEvent, FileChangeKind};
pub use indexer::{
    DirectorySummary, FileFailure, FileIndexResult, IndexOptions, IndexProgress, IndexRun, Indexer,
};
pub use scanner::{FileScanner, ScannedFile};
pub use searcher::{SearchOptions, Searcher};
