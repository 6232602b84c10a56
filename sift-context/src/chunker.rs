//! Line-based chunking with structure-aware window ends.
//!
//! Every file is covered by windows of at most `max_lines` lines. Consecutive
//! windows share `overlap_lines` lines, so text that straddles a cut is still whole
//! in at least one chunk. A non-final window is never shorter than
//! `max_lines - overlap_lines`.
//!
//! For recognized languages the end of each window is snapped, inside that
//! allowed range, to the strongest nearby boundary:
//!
//! | score | boundary                                         |
//! |-------|--------------------------------------------------|
//! | 3     | next line starts a top-level declaration         |
//! | 2     | last line closes a top-level unit (`}`, `end`)   |
//! | 1     | last line is blank                               |
//!
//! When nothing scores, the window keeps its full length, which is exactly the
//! sliding-window fallback.

use crate::language::{BoundaryRules, Language};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Chunk size settings, measured in lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkOptions {
    /// Maximum number of lines per chunk (M).
    pub max_lines: usize,
    /// Lines shared between consecutive chunks (O). Must be below `max_lines`.
    pub overlap_lines: usize,
    /// Snap window ends to syntactic boundaries when the language is known.
    pub structure_aware: bool,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_lines: 50,
            overlap_lines: 10,
            structure_aware: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkOptionsError {
    #[error("max_lines must be greater than zero")]
    ZeroMaxLines,
    #[error("overlap_lines ({overlap}) must be less than max_lines ({max})")]
    OverlapTooLarge { overlap: usize, max: usize },
}

impl ChunkOptions {
    pub fn validate(&self) -> Result<(), ChunkOptionsError> {
        if self.max_lines == 0 {
            return Err(ChunkOptionsError::ZeroMaxLines);
        }
        if self.overlap_lines >= self.max_lines {
            return Err(ChunkOptionsError::OverlapTooLarge {
                overlap: self.overlap_lines,
                max: self.max_lines,
            });
        }
        Ok(())
    }

    /// Clamp invalid settings into range so chunking never fails.
    fn sanitized(&self) -> Self {
        let max_lines = self.max_lines.max(1);
        Self {
            max_lines,
            overlap_lines: self.overlap_lines.min(max_lines - 1),
            structure_aware: self.structure_aware,
        }
    }
}

/// A positioned slice of a file, the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// blake3 of (path, start line, end line, content hash), hex encoded.
    pub id: String,
    pub file_path: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub symbol_name: Option<String>,
    pub language: String,
    pub content: String,
    /// blake3 of `content`, hex encoded.
    pub content_hash: String,
}

impl Chunk {
    pub fn line_count(&self) -> usize {
        self.end_line + 1 - self.start_line
    }

    /// Passage text handed to the embedding model.
    ///
    /// ```
    /// use sift_context::{ChunkOptions, chunk};
    ///
    /// let chunks = chunk("src/math.rs", "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n", &ChunkOptions::default());
    /// let passage = chunks[0].embedding_text();
    /// assert!(passage.starts_with("passage: {\"path\":\"src/math.rs\",\"language\":\"rust\",\"symbol\":\"add\"}"));
    /// assert!(passage.ends_with("focus: {}\npub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n"));
    /// ```
    pub fn embedding_text(&self) -> String {
        let header = PassageHeader {
            path: &self.file_path,
            language: &self.language,
            symbol: self.symbol_name.as_deref(),
        };
        let header = serde_json::to_string(&header).unwrap_or_default();
        format!("passage: {header}\n\nfocus: {{}}\n{}", self.content)
    }
}

#[derive(Serialize)]
struct PassageHeader<'a> {
    path: &'a str,
    language: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    symbol: Option<&'a str>,
}

pub fn chunk_id(file_path: &str, start_line: usize, end_line: usize, content_hash: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(file_path.as_bytes());
    hasher.update(&[0]);
    hasher.update(&(start_line as u64).to_le_bytes());
    hasher.update(&(end_line as u64).to_le_bytes());
    hasher.update(content_hash.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Reusable chunker bound to one set of options.
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    options: ChunkOptions,
}

impl Chunker {
    pub fn new(options: ChunkOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ChunkOptions {
        &self.options
    }

    pub fn chunk(&self, file_path: &str, content: &str) -> Vec<Chunk> {
        chunk(file_path, content, &self.options)
    }
}

/// Split `content` into ordered, overlapping chunks.
///
/// Deterministic in its inputs. Empty content yields no chunks.
pub fn chunk(file_path: &str, content: &str, options: &ChunkOptions) -> Vec<Chunk> {
    let options = options.sanitized();
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let language = Language::from_path(Path::new(file_path));
    let rules = language.rules();
    let boundary_rules = if options.structure_aware
        && options.max_lines > 2 * options.overlap_lines
    {
        rules
    } else {
        None
    };

    plan_windows(&lines, &options, boundary_rules)
        .into_iter()
        .map(|(start, end)| {
            let window = &lines[start..end];
            let content: String = window.concat();
            let content_hash = blake3::hash(content.as_bytes()).to_hex().to_string();
            let symbol_name = rules.and_then(|r| window.iter().find_map(|l| r.symbol_name(l)));
            Chunk {
                id: chunk_id(file_path, start + 1, end, &content_hash),
                file_path: file_path.to_string(),
                start_line: start + 1,
                end_line: end,
                symbol_name,
                language: language.as_str().to_string(),
                content,
                content_hash,
            }
        })
        .collect()
}

/// Half-open, 0-based line windows.
fn plan_windows(
    lines: &[&str],
    options: &ChunkOptions,
    rules: Option<&BoundaryRules>,
) -> Vec<(usize, usize)> {
    let total = lines.len();
    let max = options.max_lines;
    let overlap = options.overlap_lines;

    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        if start + max >= total {
            windows.push((start, total));
            return windows;
        }
        let longest = start + max;
        let shortest = longest - overlap;
        let end = rules
            .and_then(|r| best_boundary(lines, shortest, longest, r))
            .unwrap_or(longest);
        windows.push((start, end));
        start = end - overlap;
    }
}

/// Highest-scoring cut in `shortest..=longest`, earliest on ties.
fn best_boundary(
    lines: &[&str],
    shortest: usize,
    longest: usize,
    rules: &BoundaryRules,
) -> Option<usize> {
    let mut best: Option<(u8, usize)> = None;
    for end in shortest..=longest {
        let score = boundary_score(lines, end, rules);
        if score > 0 && best.is_none_or(|(s, _)| score > s) {
            best = Some((score, end));
        }
    }
    best.map(|(_, end)| end)
}

fn boundary_score(lines: &[&str], end: usize, rules: &BoundaryRules) -> u8 {
    if lines.get(end).is_some_and(|next| rules.boundary.is_match(next)) {
        return 3;
    }
    let Some(last) = end.checked_sub(1).and_then(|i| lines.get(i)) else {
        return 0;
    };
    if rules.closer.as_ref().is_some_and(|c| c.is_match(last)) {
        2
    } else if last.trim().is_empty() {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_lines(count: usize) -> String {
        (1..=count).map(|i| format!("line {i}\n")).collect()
    }

    fn ranges(chunks: &[Chunk]) -> Vec<(usize, usize)> {
        chunks.iter().map(|c| (c.start_line, c.end_line)).collect()
    }

    fn window(max_lines: usize, overlap_lines: usize) -> ChunkOptions {
        ChunkOptions {
            max_lines,
            overlap_lines,
            structure_aware: false,
        }
    }

    fn sample_rust(names: &[&str]) -> String {
        let mut out = String::new();
        for name in names {
            out.push_str(&format!("fn {name}() {{\n"));
            for i in 0..7 {
                out.push_str(&format!("    let v{i} = {i};\n"));
            }
            out.push_str("}\n\n");
        }
        out
    }

    #[test]
    fn test_sliding_window_matches_documented_example() {
        let chunks = chunk("notes.txt", &numbered_lines(120), &window(50, 10));
        assert_eq!(ranges(&chunks), vec![(1, 50), (41, 90), (81, 120)]);

        let chunks = chunk("notes.txt", &numbered_lines(30), &window(50, 10));
        assert_eq!(ranges(&chunks), vec![(1, 30)]);
        assert_eq!(chunks[0].content, numbered_lines(30));
    }

    #[test]
    fn test_final_window_stops_at_end_of_file() {
        let chunks = chunk("notes.txt", &numbered_lines(90), &window(50, 10));
        assert_eq!(ranges(&chunks), vec![(1, 50), (41, 90)]);
    }

    #[test]
    fn test_coverage_and_minimum_length() {
        let files = [
            ("a.txt", numbered_lines(1)),
            ("b.txt", numbered_lines(49)),
            ("c.txt", numbered_lines(257)),
            ("d.rs", sample_rust(&["alpha", "beta", "gamma", "delta", "epsilon", "zeta"])),
            ("e.py", "def f():\n    return 1\n\n\nclass A:\n    pass\n".repeat(20)),
        ];
        let settings = [(50, 10), (24, 4), (7, 3), (5, 0), (3, 2)];

        for (path, content) in &files {
            let total = content.split_inclusive('\n').count();
            for (max, overlap) in settings {
                for structure_aware in [false, true] {
                    let options = ChunkOptions {
                        max_lines: max,
                        overlap_lines: overlap,
                        structure_aware,
                    };
                    let chunks = chunk(path, content, &options);
                    assert_eq!(chunks.first().map(|c| c.start_line), Some(1));
                    assert_eq!(chunks.last().map(|c| c.end_line), Some(total));
                    for pair in chunks.windows(2) {
                        assert!(pair[1].start_line <= pair[0].end_line + 1, "gap in {path}");
                        assert!(pair[1].start_line > pair[0].start_line);
                    }
                    for (i, c) in chunks.iter().enumerate() {
                        assert!(c.line_count() <= max);
                        if i + 1 < chunks.len() {
                            assert!(c.line_count() >= max - overlap, "short chunk in {path}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_structure_aware_snaps_to_declarations() {
        let content = sample_rust(&["a", "b", "c"]);
        let options = ChunkOptions {
            max_lines: 24,
            overlap_lines: 4,
            structure_aware: true,
        };
        let chunks = chunk("src/lib.rs", &content, &options);

        assert_eq!(ranges(&chunks), vec![(1, 20), (17, 30)]);
        assert_eq!(chunks[0].symbol_name.as_deref(), Some("a"));
        assert_eq!(chunks[1].symbol_name.as_deref(), Some("c"));
        assert!(chunks[1].content.starts_with("    let v5 = 5;\n    let v6 = 6;\n}\n\nfn c() {\n"));
        assert_eq!(chunks[0].language, "rust");
    }

    #[test]
    fn test_unknown_language_uses_plain_window() {
        let content = sample_rust(&["a", "b", "c"]);
        let options = ChunkOptions {
            max_lines: 24,
            overlap_lines: 4,
            structure_aware: true,
        };
        let chunks = chunk("snippet.unknown", &content, &options);
        assert_eq!(ranges(&chunks), vec![(1, 24), (21, 30)]);
        assert!(chunks.iter().all(|c| c.symbol_name.is_none()));
        assert_eq!(chunks[0].language, "text");
    }

    #[test]
    fn test_ids_are_deterministic_and_position_sensitive() {
        let content = numbered_lines(120);
        let first = chunk("src/notes.txt", &content, &window(50, 10));
        let second = chunk("src/notes.txt", &content, &window(50, 10));
        assert_eq!(first, second);

        let moved = chunk("src/other.txt", &content, &window(50, 10));
        assert_ne!(first[0].id, moved[0].id);
        assert_eq!(first[0].content_hash, moved[0].content_hash);

        let ids: std::collections::HashSet<_> = first.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), first.len());
    }

    #[test]
    fn test_empty_content_has_no_chunks() {
        assert!(chunk("src/lib.rs", "", &ChunkOptions::default()).is_empty());
    }

    #[test]
    fn test_invalid_options_are_clamped() {
        let options = ChunkOptions {
            max_lines: 4,
            overlap_lines: 9,
            structure_aware: true,
        };
        assert_eq!(
            options.validate(),
            Err(ChunkOptionsError::OverlapTooLarge { overlap: 9, max: 4 })
        );
        let chunks = chunk("notes.txt", &numbered_lines(10), &options);
        assert_eq!(chunks.last().map(|c| c.end_line), Some(10));
        assert!(chunks.iter().all(|c| c.line_count() <= 4));

        let zero = ChunkOptions {
            max_lines: 0,
            ..ChunkOptions::default()
        };
        assert_eq!(zero.validate(), Err(ChunkOptionsError::ZeroMaxLines));
        assert_eq!(chunk("notes.txt", &numbered_lines(3), &zero).len(), 3);
    }

    #[test]
    fn test_last_line_without_newline_is_kept() {
        let chunks = chunk("notes.txt", "one\ntwo\nthree", &window(2, 1));
        assert_eq!(ranges(&chunks), vec![(1, 2), (2, 3)]);
        assert_eq!(chunks[1].content, "two\nthree");
    }
}
