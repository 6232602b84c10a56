//! Incremental updates driven by file-change events from an external watcher.

use super::indexer::Indexer;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub kind: FileChangeKind,
    /// Absolute, or relative to the indexed root.
    pub path: PathBuf,
}

impl FileChangeEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FileChangeKind::Created,
            path: path.into(),
        }
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FileChangeKind::Modified,
            path: path.into(),
        }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FileChangeKind::Deleted,
            path: path.into(),
        }
    }
}

/// What an event did to the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EventAction {
    Indexed { added: usize, removed: usize },
    Removed { chunks: usize },
    /// Outside the root, ignored, not indexable, or too large.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventOutcome {
    pub event: FileChangeEvent,
    pub outcome: Result<EventAction, String>,
}

impl Indexer {
    /// Apply `events` in order. A failing event is recorded and the rest still run.
    pub async fn apply_events<S>(&self, events: S) -> Vec<EventOutcome>
    where
        S: Stream<Item = FileChangeEvent>,
    {
        let mut events = std::pin::pin!(events);
        let mut outcomes = Vec::new();
        while let Some(event) = events.next().await {
            let outcome = self.apply_event(&event).await;
            if let Err(e) = &outcome {
                tracing::error!("Failed to apply {:?} for {}: {}", event.kind, event.path.display(), e);
            }
            outcomes.push(EventOutcome { event, outcome });
        }
        outcomes
    }

    async fn apply_event(&self, event: &FileChangeEvent) -> Result<EventAction, String> {
        let path = if event.path.is_relative() {
            self.scanner().root().join(&event.path)
        } else {
            event.path.clone()
        };
        let Some(key) = self.scanner().key_for(&path) else {
            return Ok(EventAction::Skipped);
        };

        if event.kind == FileChangeKind::Deleted {
            return self.removal(&key).await;
        }
        if !self.scanner().accepts(&path) {
            return Ok(EventAction::Skipped);
        }

        let content = match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            // Gone before we got to it: same as a delete.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return self.removal(&key).await,
            Err(e) => return Err(e.to_string()),
        };
        if content.len() as u64 > self.scanner().max_file_size() {
            return Ok(EventAction::Skipped);
        }

        let result = self
            .index_file(&key, &content, false)
            .await
            .map_err(|e| e.to_string())?;
        if !result.is_ok() {
            return Err(result.errors.join("; "));
        }
        Ok(EventAction::Indexed {
            added: result.added,
            removed: result.removed,
        })
    }

    async fn removal(&self, key: &str) -> Result<EventAction, String> {
        self.remove_file(key)
            .await
            .map(|chunks| EventAction::Removed { chunks })
            .map_err(|e| e.to_string())
    }
}
