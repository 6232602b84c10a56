//! Configuration for embedding backends and the worker pool

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// The closed set of embedding backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// fastembed on ONNX Runtime with a GPU execution provider
    Gpu,
    /// fastembed on the CPU
    Cpu,
    /// OpenAI-compatible HTTP embeddings API
    Remote,
    /// Deterministic token hashing, for offline use and tests
    Hash,
}

impl BackendKind {
    /// Order the factory walks when no backend is forced.
    pub const PREFERENCE: [BackendKind; 3] = [BackendKind::Gpu, BackendKind::Cpu, BackendKind::Remote];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Gpu => "gpu",
            BackendKind::Cpu => "cpu",
            BackendKind::Remote => "remote",
            BackendKind::Hash => "hash",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" | "cuda" => Ok(BackendKind::Gpu),
            "cpu" | "local" => Ok(BackendKind::Cpu),
            "remote" | "api" => Ok(BackendKind::Remote),
            "hash" => Ok(BackendKind::Hash),
            other => Err(EmbedError::invalid_config(format!(
                "unknown backend '{other}', expected one of gpu, cpu, remote, hash"
            ))),
        }
    }
}

/// Built-in fastembed models and the dimension each advertises.
pub const BUILTIN_MODELS: &[(&str, usize)] = &[
    ("all-minilm-l6-v2", 384),
    ("bge-small-en-v1.5", 384),
    ("bge-base-en-v1.5", 768),
    ("nomic-embed-text-v1.5", 768),
    ("jina-embeddings-v2-base-code", 768),
];

pub fn builtin_dimension(model_name: &str) -> Option<usize> {
    BUILTIN_MODELS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(model_name))
        .map(|(_, dim)| *dim)
}

/// Paths of the tokenizer files that accompany a downloaded ONNX model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerConfig {
    pub tokenizer_path: PathBuf,
    pub config_path: PathBuf,
    pub special_tokens_map_path: PathBuf,
    /// Optional; a minimal one is generated when missing
    pub tokenizer_config_path: PathBuf,
}

impl TokenizerConfig {
    /// The standard HuggingFace layout inside `model_dir`.
    pub fn standard<P: AsRef<Path>>(model_dir: P) -> Self {
        let model_dir = model_dir.as_ref();
        Self {
            tokenizer_path: model_dir.join("tokenizer.json"),
            config_path: model_dir.join("config.json"),
            special_tokens_map_path: model_dir.join("special_tokens_map.json"),
            tokenizer_config_path: model_dir.join("tokenizer_config.json"),
        }
    }

    /// Files that must exist before the model can load.
    pub fn required_files(&self) -> [&Path; 3] {
        [
            self.tokenizer_path.as_path(),
            self.config_path.as_path(),
            self.special_tokens_map_path.as_path(),
        ]
    }
}

/// Settings for the OpenAI-compatible remote backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the bearer token. The key itself is never stored.
    pub api_key_env: String,
    pub dimension: usize,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            dimension: 1536,
            timeout_secs: 30,
        }
    }
}

impl RemoteConfig {
    /// The configured API key, if its environment variable is set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

/// What the pool does when `queue_capacity` tasks are already outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueFullPolicy {
    /// Callers wait for a slot.
    Wait,
    /// Callers get [`EmbedError::QueueFull`] immediately.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub queue_capacity: usize,
    pub queue_full_policy: QueueFullPolicy,
    pub task_timeout_ms: u64,
    /// Re-submissions after a crash or timeout before giving up.
    pub max_retries: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            queue_full_policy: QueueFullPolicy::Wait,
            task_timeout_ms: 120_000,
            max_retries: 2,
        }
    }
}

impl WorkerPoolConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            task_timeout_ms: timeout.as_millis() as u64,
            ..self
        }
    }

    pub fn with_capacity(self, queue_capacity: usize, queue_full_policy: QueueFullPolicy) -> Self {
        Self {
            queue_capacity,
            queue_full_policy,
            ..self
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }
}

/// Configuration for embedding models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Force one backend instead of walking [`BackendKind::PREFERENCE`]
    pub backend: Option<BackendKind>,
    /// Directory holding downloaded model files
    pub model_base_path: PathBuf,
    /// Built-in fastembed model name, or the local name of a HuggingFace model
    pub model_name: String,
    /// HuggingFace model repository (e.g., "answerdotai/ModernBERT-large")
    pub hf_model_repo: Option<String>,
    pub hf_revision: Option<String>,
    /// Required for HuggingFace models, whose size is not known up front
    pub dimension: Option<usize>,
    /// Maximum batch size for embedding generation
    pub batch_size: usize,
    pub hash_dimension: usize,
    pub remote: RemoteConfig,
    pub worker: WorkerPoolConfig,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            backend: None,
            model_base_path: PathBuf::from("models"),
            model_name: "all-minilm-l6-v2".to_string(),
            hf_model_repo: None,
            hf_revision: Some("main".to_string()),
            dimension: None,
            batch_size: 32,
            hash_dimension: 256,
            remote: RemoteConfig::default(),
            worker: WorkerPoolConfig::default(),
        }
    }
}

impl EmbedConfig {
    /// A configuration for a model fetched from HuggingFace.
    pub fn from_huggingface<P: AsRef<Path>>(
        model_base_path: P,
        model_name: impl Into<String>,
        hf_repo: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            model_base_path: model_base_path.as_ref().to_path_buf(),
            model_name: model_name.into(),
            hf_model_repo: Some(hf_repo.into()),
            dimension: Some(dimension),
            batch_size: 16,
            ..Self::default()
        }
    }

    /// ModernBERT-large, the default HuggingFace model.
    pub fn modernbert_large<P: AsRef<Path>>(model_base_path: P) -> Self {
        Self::from_huggingface(
            model_base_path,
            "ModernBERT-large",
            "answerdotai/ModernBERT-large",
            1024,
        )
    }

    /// The offline hashing backend, forced.
    pub fn hashing(dimension: usize) -> Self {
        Self {
            backend: Some(BackendKind::Hash),
            hash_dimension: dimension,
            ..Self::default()
        }
    }

    pub fn with_backend(self, backend: BackendKind) -> Self {
        Self {
            backend: Some(backend),
            ..self
        }
    }

    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_base_path.join(&self.model_name)
    }

    /// Location of the downloaded ONNX weights.
    pub fn onnx_model_path(&self) -> PathBuf {
        let onnx_dir = self.model_path().join("onnx");
        let quantized = onnx_dir.join("model_q4.onnx");
        if quantized.exists() {
            return quantized;
        }
        onnx_dir.join("model_quantized.onnx")
    }

    pub fn tokenizer_config(&self) -> TokenizerConfig {
        TokenizerConfig::standard(self.model_path())
    }

    pub fn is_huggingface_model(&self) -> bool {
        self.hf_model_repo.is_some()
    }

    pub fn hf_repo(&self) -> Option<&str> {
        self.hf_model_repo.as_deref()
    }

    pub fn hf_revision(&self) -> &str {
        self.hf_revision.as_deref().unwrap_or("main")
    }

    /// Dimension the local (fastembed) backends will produce.
    pub fn local_dimension(&self) -> Result<usize> {
        if self.is_huggingface_model() {
            return self.dimension.ok_or_else(|| {
                EmbedError::invalid_config(format!(
                    "HuggingFace model {} needs an explicit dimension",
                    self.model_name
                ))
            });
        }
        builtin_dimension(&self.model_name).ok_or_else(|| {
            let known: Vec<&str> = BUILTIN_MODELS.iter().map(|(name, _)| *name).collect();
            EmbedError::invalid_config(format!(
                "unknown built-in model '{}', expected one of {}",
                self.model_name,
                known.join(", ")
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be at least 1"));
        }
        if self.worker.queue_capacity == 0 {
            return Err(EmbedError::invalid_config(
                "worker.queue_capacity must be at least 1",
            ));
        }
        if self.hash_dimension == 0 || self.remote.dimension == 0 {
            return Err(EmbedError::invalid_config("dimensions must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = EmbedConfig::default();
        assert_eq!(config.model_name, "all-minilm-l6-v2");
        assert_eq!(config.batch_size, 32);
        assert!(!config.is_huggingface_model());
        assert_eq!(config.local_dimension().unwrap(), 384);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_huggingface_paths() {
        let temp_dir = tempdir().unwrap();
        let config = EmbedConfig::modernbert_large(temp_dir.path());

        let expected_base = temp_dir.path().join("ModernBERT-large");
        assert_eq!(config.hf_repo(), Some("answerdotai/ModernBERT-large"));
        assert_eq!(config.hf_revision(), "main");
        assert_eq!(config.local_dimension().unwrap(), 1024);
        assert_eq!(
            config.onnx_model_path(),
            expected_base.join("onnx").join("model_quantized.onnx")
        );
        assert_eq!(
            config.tokenizer_config().tokenizer_path,
            expected_base.join("tokenizer.json")
        );
    }

    #[test]
    fn test_unknown_builtin_model_is_rejected() {
        let config = EmbedConfig {
            model_name: "not-a-model".to_string(),
            ..EmbedConfig::default()
        };
        let err = config.local_dimension().unwrap_err();
        assert!(err.to_string().contains("not-a-model"));
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("CUDA".parse::<BackendKind>().unwrap(), BackendKind::Gpu);
        assert_eq!("cpu".parse::<BackendKind>().unwrap(), BackendKind::Cpu);
        assert!("tpu".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_config_deserializes_partial_json() {
        let config: EmbedConfig = serde_json::from_str(
            r#"{"backend": "remote", "remote": {"model": "embed-small"}, "worker": {"max_retries": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.backend, Some(BackendKind::Remote));
        assert_eq!(config.remote.model, "embed-small");
        assert_eq!(config.remote.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.worker.max_retries, 5);
        assert_eq!(config.worker.queue_capacity, 64);
    }

    #[test]
    fn test_zero_batch_size_is_invalid() {
        let config = EmbedConfig::default().with_batch_size(0);
        assert!(matches!(
            config.validate(),
            Err(EmbedError::InvalidConfig { .. })
        ));
    }
}
