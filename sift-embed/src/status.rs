//! Backend health as an owned, observable value.

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of an embedding backend.
///
/// `Uninitialized -> Initializing -> Ready`, with `Degraded` while a worker
/// restarts and `Error` when initialization or recovery failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum EmbedderStatus {
    Uninitialized,
    Initializing,
    Ready,
    Degraded(String),
    Error(String),
}

impl EmbedderStatus {
    /// Whether embed calls are accepted in this state.
    pub fn is_usable(&self) -> bool {
        matches!(self, EmbedderStatus::Ready | EmbedderStatus::Degraded(_))
    }
}

impl fmt::Display for EmbedderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbedderStatus::Uninitialized => f.write_str("uninitialized"),
            EmbedderStatus::Initializing => f.write_str("initializing"),
            EmbedderStatus::Ready => f.write_str("ready"),
            EmbedderStatus::Degraded(reason) => write!(f, "degraded: {reason}"),
            EmbedderStatus::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Shared holder of an [`EmbedderStatus`]. Clones observe the same value.
#[derive(Debug, Clone)]
pub struct StatusCell {
    label: Arc<str>,
    tx: Arc<watch::Sender<EmbedderStatus>>,
}

impl StatusCell {
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        let (tx, _rx) = watch::channel(EmbedderStatus::Uninitialized);
        Self {
            label: label.into(),
            tx: Arc::new(tx),
        }
    }

    pub fn get(&self) -> EmbedderStatus {
        self.tx.borrow().clone()
    }

    pub fn set(&self, status: EmbedderStatus) {
        let previous = self.tx.send_replace(status.clone());
        if previous != status {
            tracing::info!("{} status: {} -> {}", self.label, previous, status);
        }
    }

    /// Receiver that sees every later transition.
    pub fn subscribe(&self) -> watch::Receiver<EmbedderStatus> {
        self.tx.subscribe()
    }

    /// Fail fast with [`EmbedError::NotInitialized`] unless ready.
    pub fn ensure_usable(&self) -> Result<()> {
        if self.get().is_usable() {
            Ok(())
        } else {
            Err(EmbedError::not_initialized(self.label.as_ref()))
        }
    }
}
