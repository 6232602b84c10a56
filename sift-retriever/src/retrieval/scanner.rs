//! File discovery for directory indexing, using the ignore crate (same as ripgrep)

use crate::config::SIFT_DIR;
use ignore::WalkBuilder;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Path, PathBuf};

/// Project-local ignore file, same syntax as `.gitignore`.
pub const IGNORE_FILE: &str = ".siftignore";

/// A file selected for indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Path relative to the root with `/` separators; the key used in stores.
    pub key: String,
}

/// Walks a project tree, respecting `.gitignore` and `.siftignore`.
#[derive(Debug, Clone)]
pub struct FileScanner {
    root: PathBuf,
    max_file_size: u64,
}

impl FileScanner {
    pub fn new(root: impl AsRef<Path>, max_file_size: u64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_file_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Every indexable file under the root, sorted by key.
    pub fn scan(&self) -> Vec<ScannedFile> {
        let mut files: Vec<ScannedFile> = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .git_exclude(true)
            .require_git(false)
            .add_custom_ignore_filename(IGNORE_FILE)
            .filter_entry(|entry| entry.file_name() != SIFT_DIR)
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
            .filter(|entry| should_index_file(entry.path()))
            .filter(|entry| {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
                if size > self.max_file_size {
                    tracing::debug!("Skipping {} ({} bytes)", entry.path().display(), size);
                    return false;
                }
                true
            })
            .filter_map(|entry| {
                let key = self.key_for(entry.path())?;
                Some(ScannedFile {
                    path: entry.into_path(),
                    key,
                })
            })
            .collect();
        files.sort_by(|a, b| a.key.cmp(&b.key));
        files
    }

    /// Whether [`scan`](Self::scan) would pick up `path`, judged from its
    /// name and the ignore files between the root and the file. Size and
    /// existence are not checked.
    pub fn accepts(&self, path: &Path) -> bool {
        let Some(key) = self.key_for(path) else {
            return false;
        };
        let relative = Path::new(&key);
        if !should_index_file(relative) {
            return false;
        }

        let mut dirs = vec![self.root.clone()];
        let mut components: Vec<&str> = key.split('/').collect();
        components.pop();
        for part in components {
            if part.starts_with('.') {
                return false;
            }
            let next = dirs[dirs.len() - 1].join(part);
            dirs.push(next);
        }

        // Deeper ignore files win, and `.siftignore` beats `.gitignore`.
        let file = self.root.join(relative);
        for dir in dirs.iter().rev() {
            for name in [IGNORE_FILE, ".gitignore"] {
                let rules = ignore_rules(dir, &dir.join(name));
                match rules.matched_path_or_any_parents(&file, false) {
                    ignore::Match::Ignore(_) => return false,
                    ignore::Match::Whitelist(_) => return true,
                    ignore::Match::None => {}
                }
            }
        }
        let exclude = ignore_rules(&self.root, &self.root.join(".git/info/exclude"));
        !exclude.matched_path_or_any_parents(&file, false).is_ignore()
    }

    /// Store key for `path`, which may be absolute or relative to the root.
    ///
    /// Returns `None` for paths outside the root.
    pub fn key_for(&self, path: &Path) -> Option<String> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root).ok()?
        } else {
            path
        };
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }
}

/// Rules from one ignore file, anchored at `dir`. Missing files match nothing.
fn ignore_rules(dir: &Path, file: &Path) -> Gitignore {
    if !file.is_file() {
        return Gitignore::empty();
    }
    let mut builder = GitignoreBuilder::new(dir);
    if let Some(e) = builder.add(file) {
        tracing::warn!("Bad pattern in {}: {}", file.display(), e);
    }
    builder.build().unwrap_or_else(|e| {
        tracing::warn!("Ignoring {}: {}", file.display(), e);
        Gitignore::empty()
    })
}

/// Whether a file's name and extension make it worth indexing.
pub fn should_index_file(file_path: &Path) -> bool {
    if let Some(filename) = file_path.file_name().and_then(|n| n.to_str()) {
        if filename.starts_with('.') {
            return false;
        }
    }

    match file_path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("rs") | Some("py") | Some("pyi") | Some("js") | Some("ts") | Some("jsx")
        | Some("tsx") | Some("mjs") | Some("go") | Some("java") | Some("kt") | Some("cs")
        | Some("c") | Some("cc") | Some("cpp") | Some("h") | Some("hpp") | Some("rb")
        | Some("md") | Some("markdown") | Some("txt") | Some("toml") | Some("yaml")
        | Some("yml") | Some("json") | Some("sh") => true,

        Some("exe") | Some("dll") | Some("so") | Some("dylib") | Some("bin") | Some("png")
        | Some("jpg") | Some("jpeg") | Some("gif") | Some("ico") | Some("wasm") | Some("lock")
        | Some("db") | Some("zip") | Some("gz") | Some("pdf") => false,

        None => file_path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|filename| {
                matches!(
                    filename,
                    "README" | "CHANGELOG" | "LICENSE" | "Makefile" | "Dockerfile"
                )
            }),

        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_should_index_file() {
        assert!(should_index_file(Path::new("src/main.rs")));
        assert!(should_index_file(Path::new("README")));
        assert!(should_index_file(Path::new("notes.RST")));
        assert!(!should_index_file(Path::new(".env")));
        assert!(!should_index_file(Path::new("logo.png")));
        assert!(!should_index_file(Path::new("Cargo.lock")));
        assert!(!should_index_file(Path::new("binary")));
    }

    #[test]
    fn test_scan_respects_ignore_files() -> std::io::Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/nested"))?;
        std::fs::create_dir_all(root.join("target"))?;
        std::fs::create_dir_all(root.join(SIFT_DIR))?;
        std::fs::write(root.join("src/lib.rs"), "pub fn a() {}\n")?;
        std::fs::write(root.join("src/nested/util.py"), "def b():\n    pass\n")?;
        std::fs::write(root.join("target/out.rs"), "fn gen() {}\n")?;
        std::fs::write(root.join("generated.rs"), "fn gen() {}\n")?;
        std::fs::write(root.join("big.txt"), "x".repeat(2048))?;
        std::fs::write(root.join("image.png"), [0u8, 1, 2])?;
        std::fs::write(root.join(SIFT_DIR).join("config.toml"), "")?;
        std::fs::write(root.join(".gitignore"), "target/\n")?;
        std::fs::write(root.join(IGNORE_FILE), "generated.rs\n")?;

        let scanner = FileScanner::new(root, 1024);
        let keys: Vec<String> = scanner.scan().into_iter().map(|f| f.key).collect();
        assert_eq!(keys, vec!["src/lib.rs", "src/nested/util.py"]);
        Ok(())
    }

    #[test]
    fn test_accepts_agrees_with_scan() -> std::io::Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/gen"))?;
        std::fs::create_dir_all(root.join("build"))?;
        std::fs::create_dir_all(root.join(".git/info"))?;
        std::fs::write(root.join(".gitignore"), "build/
*.snap.txt
")?;
        std::fs::write(root.join(IGNORE_FILE), "scratch.md
")?;
        std::fs::write(root.join("src/.gitignore"), "gen/
!keep.snap.txt
")?;
        std::fs::write(root.join(".git/info/exclude"), "local.rs
")?;
        for file in [
            "src/lib.rs",
            "src/gen/out.rs",
            "src/keep.snap.txt",
            "build/app.rs",
            "report.snap.txt",
            "scratch.md",
            "local.rs",
            "notes.md",
        ] {
            std::fs::write(root.join(file), "content
")?;
        }

        let scanner = FileScanner::new(root, 1024);
        let scanned: Vec<String> = scanner.scan().into_iter().map(|f| f.key).collect();
        assert_eq!(scanned, vec!["notes.md", "src/keep.snap.txt", "src/lib.rs"]);

        for key in ["notes.md", "src/keep.snap.txt", "src/lib.rs"] {
            assert!(scanner.accepts(Path::new(key)), "{key} should be accepted");
        }
        for key in [
            "src/gen/out.rs",
            "build/app.rs",
            "report.snap.txt",
            "scratch.md",
            "local.rs",
            ".sift/index.db",
            "logo.png",
        ] {
            assert!(!scanner.accepts(Path::new(key)), "{key} should be ignored");
        }
        assert!(scanner.accepts(&root.join("src/lib.rs")));
        assert!(!scanner.accepts(Path::new("/elsewhere/a.rs")));
        Ok(())
    }

    #[test]
    fn test_key_for() {
        let scanner = FileScanner::new("/repo", 1024);
        assert_eq!(
            scanner.key_for(Path::new("/repo/src/a.rs")).as_deref(),
            Some("src/a.rs")
        );
        assert_eq!(
            scanner.key_for(Path::new("src/./a.rs")).as_deref(),
            Some("src/a.rs")
        );
        assert_eq!(scanner.key_for(Path::new("/elsewhere/a.rs")), None);
    }
}
