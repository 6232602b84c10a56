//! Code-aware chunking for the sift semantic search engine.
//!
//! Files are cut into overlapping, line-bounded [`Chunk`]s. Where the language is
//! recognized, window ends are snapped to declaration boundaries; otherwise a plain
//! sliding window over lines is used. Both paths share the same size guarantees, so
//! callers never need to know which one produced a chunk.
//!
//! ```
//! use sift_context::{ChunkOptions, chunk};
//!
//! let content: String = (1..=120).map(|i| format!("line {i}\n")).collect();
//! let options = ChunkOptions { max_lines: 50, overlap_lines: 10, structure_aware: false };
//! let chunks = chunk("notes.txt", &content, &options);
//!
//! let ranges: Vec<_> = chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
//! assert_eq!(ranges, vec![(1, 50), (41, 90), (81, 120)]);
//! ```

pub mod chunker;
pub mod language;

pub use chunker::{Chunk, ChunkOptions, ChunkOptionsError, Chunker, chunk};
pub use language::Language;
