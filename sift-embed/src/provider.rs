//! The embedding capability and the fastembed (ONNX) backends

use crate::config::EmbedConfig;
use crate::downloader::{ModelDownloadProgress, ModelDownloader, ProgressSender, emit};
use crate::error::{EmbedError, Result};
use crate::status::{EmbedderStatus, StatusCell};
use async_trait::async_trait;
use fastembed::{
    EmbeddingModel, InitOptions, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;
use tokio::sync::RwLock;

/// Result of embedding generation
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text, each unit length
    pub embeddings: Vec<Vec<f32>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// The dimension is taken from the first vector, 0 when empty.
    pub fn new(embeddings: Vec<Vec<f32>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// A backend that turns text into unit-length vectors of a fixed dimension.
///
/// Implementations own their readiness: embed calls made before a successful
/// [`initialize`](EmbeddingProvider::initialize) fail with
/// [`EmbedError::NotInitialized`].
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Load the model, downloading it first if needed.
    async fn initialize(&self) -> Result<()> {
        self.initialize_with_progress(None).await
    }

    /// Like [`initialize`](EmbeddingProvider::initialize), reporting download progress.
    async fn initialize_with_progress(&self, progress: Option<ProgressSender>) -> Result<()>;

    /// Generate embeddings for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let result = self.embed_texts(&[text.to_string()]).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::invalid_config("No embedding generated for text"))
    }

    /// Generate embeddings for multiple texts (batch processing)
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Release the model. The provider can be initialized again afterwards.
    async fn dispose(&self) -> Result<()>;

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Stable identifier of the vector space, e.g. `fastembed:all-minilm-l6-v2`.
    ///
    /// Two providers with the same name produce comparable vectors.
    fn provider_name(&self) -> &str;

    fn status(&self) -> EmbedderStatus;
}

/// Scale `values` to unit L2 norm in place. Zero vectors are left alone.
pub fn normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for value in values.iter_mut() {
            *value /= norm;
        }
    }
}

/// Reject vectors whose length differs from the advertised dimension.
pub fn check_dimensions(expected: usize, embeddings: &[Vec<f32>]) -> Result<()> {
    match embeddings.iter().find(|e| e.len() != expected) {
        Some(bad) => Err(EmbedError::DimensionMismatch {
            expected,
            actual: bad.len(),
        }),
        None => Ok(()),
    }
}

/// Where the ONNX session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda,
}

/// Whether the CUDA execution provider can be used on this machine.
///
/// Always false unless the crate is built with the `cuda` feature.
pub fn gpu_runtime_available() -> bool {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
        CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
    }
    #[cfg(not(feature = "cuda"))]
    {
        false
    }
}

fn builtin_model(name: &str) -> Result<EmbeddingModel> {
    match name.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" => Ok(EmbeddingModel::NomicEmbedTextV15),
        "jina-embeddings-v2-base-code" => Ok(EmbeddingModel::JinaEmbeddingsV2BaseCode),
        other => Err(EmbedError::invalid_config(format!(
            "unknown built-in model '{other}'"
        ))),
    }
}

type SharedModel = Arc<Mutex<TextEmbedding>>;

/// FastEmbed-based embedding provider using real ONNX models
pub struct FastEmbedProvider {
    config: EmbedConfig,
    device: Device,
    model: RwLock<Option<SharedModel>>,
    dimension: usize,
    name: String,
    status: StatusCell,
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("model_name", &self.config.model_name)
            .field("device", &self.device)
            .field("dimension", &self.dimension)
            .field("status", &self.status.get())
            .finish()
    }
}

impl FastEmbedProvider {
    /// Creates an uninitialized provider. Fails if the model's dimension is unknown.
    pub fn new(config: EmbedConfig, device: Device) -> Result<Self> {
        let dimension = config.local_dimension()?;
        let name = format!("fastembed:{}", config.model_name.to_ascii_lowercase());
        let label = match device {
            Device::Cpu => format!("{name} (cpu)"),
            Device::Cuda => format!("{name} (cuda)"),
        };
        Ok(Self {
            config,
            device,
            model: RwLock::new(None),
            dimension,
            name,
            status: StatusCell::new(label),
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    async fn load(&self, progress: Option<&ProgressSender>) -> Result<TextEmbedding> {
        if self.config.is_huggingface_model() {
            let downloader = ModelDownloader::new()?;
            downloader.ensure_model(&self.config, progress).await?;
            return self.load_user_defined_model().await;
        }

        tracing::info!(
            "Using built-in fastembed model: {}",
            self.config.model_name
        );
        let model = builtin_model(&self.config.model_name)?;
        let options = InitOptions::new(model)
            .with_cache_dir(self.config.model_base_path.clone())
            .with_show_download_progress(false);
        #[cfg(feature = "cuda")]
        let options = options.with_execution_providers(self.execution_providers());

        tokio::task::spawn_blocking(move || {
            TextEmbedding::try_new(options).map_err(|e| EmbedError::External { source: e })
        })
        .await?
    }

    #[cfg(feature = "cuda")]
    fn execution_providers(&self) -> Vec<ort::execution_providers::ExecutionProviderDispatch> {
        use ort::execution_providers::CUDAExecutionProvider;
        match self.device {
            Device::Cuda => vec![CUDAExecutionProvider::default().build().error_on_failure()],
            Device::Cpu => Vec::new(),
        }
    }

    /// Load a user-defined ONNX model from downloaded HuggingFace files
    async fn load_user_defined_model(&self) -> Result<TextEmbedding> {
        tracing::info!("Loading user-defined model: {}", self.config.model_name);

        let onnx_path = self.config.onnx_model_path();
        if !onnx_path.exists() {
            return Err(EmbedError::ModelFileNotFound { path: onnx_path });
        }
        let onnx_file = fs::read(&onnx_path).await?;

        let tokenizer = self.config.tokenizer_config();
        let tokenizer_file = fs::read(&tokenizer.tokenizer_path).await?;
        let config_file = fs::read(&tokenizer.config_path).await?;
        let special_tokens_map_file = fs::read(&tokenizer.special_tokens_map_path).await?;
        let tokenizer_config_file = if tokenizer.tokenizer_config_path.exists() {
            fs::read(&tokenizer.tokenizer_config_path).await?
        } else {
            let minimal_config = serde_json::json!({
                "clean_up_tokenization_spaces": true,
                "do_lower_case": false,
                "model_max_length": 512,
                "tokenizer_class": "BertTokenizer"
            });
            serde_json::to_vec_pretty(&minimal_config)
                .map_err(|e| EmbedError::External { source: e.into() })?
        };

        let user_model = UserDefinedEmbeddingModel::new(
            onnx_file,
            TokenizerFiles {
                tokenizer_file,
                config_file,
                special_tokens_map_file,
                tokenizer_config_file,
            },
        );
        #[cfg(not(feature = "cuda"))]
        let options = Default::default();
        #[cfg(feature = "cuda")]
        let options = fastembed::InitOptionsUserDefined::default()
            .with_execution_providers(self.execution_providers());

        tokio::task::spawn_blocking(move || {
            TextEmbedding::try_new_from_user_defined(user_model, options)
                .map_err(|e| EmbedError::External { source: e })
        })
        .await?
    }

    /// Embed one probe sentence and check the output shape.
    async fn validate_model(&self, model: &SharedModel) -> Result<()> {
        let embeddings = run_blocking(model, vec!["validation test".to_string()]).await?;
        let embedding = embeddings.first().ok_or_else(|| {
            EmbedError::invalid_config("Model validation failed: no embeddings generated")
        })?;
        if embedding.len() != self.dimension {
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(EmbedError::invalid_config(
                "Model validation failed: non-finite values in embedding",
            ));
        }
        tracing::debug!("Model validation passed for: {}", self.config.model_name);
        Ok(())
    }
}

async fn run_blocking(model: &SharedModel, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
    let model = Arc::clone(model);
    tokio::task::spawn_blocking(move || {
        let mut guard = model.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .embed(texts, None)
            .map_err(|e| EmbedError::External { source: e })
    })
    .await?
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn initialize_with_progress(&self, progress: Option<ProgressSender>) -> Result<()> {
        let mut slot = self.model.write().await;
        if slot.is_some() {
            return Ok(());
        }

        self.status.set(EmbedderStatus::Initializing);
        let model_name = self.config.model_name.clone();
        emit(
            progress.as_ref(),
            ModelDownloadProgress::Started {
                model: model_name.clone(),
            },
        );

        let loaded = match self.load(progress.as_ref()).await {
            Ok(model) => {
                let shared = Arc::new(Mutex::new(model));
                self.validate_model(&shared).await.map(|()| shared)
            }
            Err(e) => Err(e),
        };

        match loaded {
            Ok(shared) => {
                *slot = Some(shared);
                self.status.set(EmbedderStatus::Ready);
                emit(
                    progress.as_ref(),
                    ModelDownloadProgress::Finished { model: model_name },
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to initialize {}: {}", self.name, e);
                self.status.set(EmbedderStatus::Error(e.to_string()));
                emit(
                    progress.as_ref(),
                    ModelDownloadProgress::Failed {
                        model: model_name,
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        self.status.ensure_usable()?;
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }
        let model = self
            .model
            .read()
            .await
            .clone()
            .ok_or_else(|| EmbedError::not_initialized(&self.name))?;

        tracing::debug!("Generating embeddings for {} texts", texts.len());
        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let mut embeddings = run_blocking(&model, batch.to_vec()).await?;
            embeddings.iter_mut().for_each(|e| normalize(e));
            all_embeddings.extend(embeddings);
        }
        check_dimensions(self.dimension, &all_embeddings)?;
        Ok(EmbeddingResult::new(all_embeddings))
    }

    async fn dispose(&self) -> Result<()> {
        self.model.write().await.take();
        self.status.set(EmbedderStatus::Uninitialized);
        Ok(())
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> EmbedderStatus {
        self.status.get()
    }
}
