//! Error types for the embedding system

use std::path::PathBuf;

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Every failure an embedding backend, the factory or the worker pool can report.
///
/// Callers that need to react to a specific condition match on the variant:
/// [`EmbedError::NotInitialized`] means "retry after `initialize`",
/// [`EmbedError::WorkerUnavailable`] means the pool gave up after its retries,
/// and [`EmbedError::NoUsableBackend`] means nothing on this machine can embed.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when model files are not found or invalid
    #[error("Model file not found: {path}")]
    ModelFileNotFound { path: PathBuf },

    /// Error when model configuration is invalid
    #[error("Invalid model configuration: {message}")]
    InvalidConfig { message: String },

    /// No backend passed its availability probe
    #[error("No usable embedding backend: {details}")]
    NoUsableBackend { details: String },

    /// An embed call arrived before the backend reached the ready state
    #[error("Embedding backend {backend} is not initialized")]
    NotInitialized { backend: String },

    /// The worker stopped responding and every retry failed
    #[error("Embedding worker unavailable after {attempts} attempts: {reason}")]
    WorkerUnavailable { attempts: u32, reason: String },

    /// The outstanding-task queue is full and the pool is set to reject
    #[error("Embedding queue is full ({capacity} outstanding tasks)")]
    QueueFull { capacity: usize },

    /// A backend produced vectors of an unexpected size
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The remote embedding API answered with an error
    #[error("Remote embedding API error ({status}): {message}")]
    RemoteApi { status: u16, message: String },

    /// Transport failures talking to the remote embedding API
    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    /// IO errors when reading model files
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn not_initialized<S: Into<String>>(backend: S) -> Self {
        Self::NotInitialized {
            backend: backend.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_errors_convert_into_their_variants() {
        let io: EmbedError = std::io::Error::new(std::io::ErrorKind::NotFound, "model.onnx").into();
        assert!(matches!(io, EmbedError::Io { .. }));

        let other: EmbedError = anyhow::anyhow!("tokenizer rejected input").into();
        assert!(matches!(other, EmbedError::External { .. }));
        assert_eq!(other.to_string(), "External error: tokenizer rejected input");
    }

    #[test]
    fn test_pool_errors_name_their_cause() {
        let unavailable = EmbedError::WorkerUnavailable {
            attempts: 3,
            reason: "task 7 timed out after 100ms".to_string(),
        };
        assert_eq!(
            unavailable.to_string(),
            "Embedding worker unavailable after 3 attempts: task 7 timed out after 100ms"
        );
        assert_eq!(
            EmbedError::not_initialized("hash:v1:16").to_string(),
            "Embedding backend hash:v1:16 is not initialized"
        );
        assert_eq!(
            EmbedError::QueueFull { capacity: 4 }.to_string(),
            "Embedding queue is full (4 outstanding tasks)"
        );
    }
}
