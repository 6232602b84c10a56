//! Backend discovery and construction

use crate::config::{BackendKind, EmbedConfig};
use crate::downloader::ProgressSender;
use crate::error::{EmbedError, Result};
use crate::hashing::HashEmbeddingProvider;
use crate::provider::{
    Device, EmbeddingProvider, EmbeddingResult, FastEmbedProvider, gpu_runtime_available,
};
use crate::remote::RemoteEmbeddingProvider;
use crate::status::EmbedderStatus;
use async_trait::async_trait;
use serde::Serialize;

/// One of the closed set of embedding backends.
pub enum AnyEmbedder {
    Gpu(FastEmbedProvider),
    Cpu(FastEmbedProvider),
    Remote(RemoteEmbeddingProvider),
    Hash(HashEmbeddingProvider),
}

impl AnyEmbedder {
    pub fn kind(&self) -> BackendKind {
        match self {
            AnyEmbedder::Gpu(_) => BackendKind::Gpu,
            AnyEmbedder::Cpu(_) => BackendKind::Cpu,
            AnyEmbedder::Remote(_) => BackendKind::Remote,
            AnyEmbedder::Hash(_) => BackendKind::Hash,
        }
    }

    fn inner(&self) -> &dyn EmbeddingProvider {
        match self {
            AnyEmbedder::Gpu(p) | AnyEmbedder::Cpu(p) => p,
            AnyEmbedder::Remote(p) => p,
            AnyEmbedder::Hash(p) => p,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for AnyEmbedder {
    async fn initialize_with_progress(&self, progress: Option<ProgressSender>) -> Result<()> {
        self.inner().initialize_with_progress(progress).await
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.inner().embed_text(text).await
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        self.inner().embed_texts(texts).await
    }

    async fn dispose(&self) -> Result<()> {
        self.inner().dispose().await
    }

    fn embedding_dimension(&self) -> usize {
        self.inner().embedding_dimension()
    }

    fn provider_name(&self) -> &str {
        self.inner().provider_name()
    }

    fn status(&self) -> EmbedderStatus {
        self.inner().status()
    }
}

/// Outcome of one availability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub kind: BackendKind,
    pub available: bool,
    pub detail: String,
}

/// Picks and builds a backend from an [`EmbedConfig`].
///
/// Without an override the first backend in [`BackendKind::PREFERENCE`] whose
/// probe passes wins. Probes are cheap: they never load a model.
#[derive(Debug, Clone)]
pub struct EmbedderFactory {
    config: EmbedConfig,
}

impl EmbedderFactory {
    pub fn new(config: EmbedConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }

    pub fn probe(&self, kind: BackendKind) -> ProbeReport {
        let (available, detail) = match kind {
            BackendKind::Gpu => {
                if !cfg!(feature = "cuda") {
                    (false, "built without the cuda feature".to_string())
                } else if !gpu_runtime_available() {
                    (false, "CUDA execution provider not available".to_string())
                } else {
                    self.local_model_detail()
                }
            }
            BackendKind::Cpu => self.local_model_detail(),
            BackendKind::Remote => {
                if RemoteEmbeddingProvider::is_configured(&self.config.remote) {
                    (
                        true,
                        format!(
                            "{} at {}",
                            self.config.remote.model, self.config.remote.endpoint
                        ),
                    )
                } else {
                    (
                        false,
                        format!("{} is not set", self.config.remote.api_key_env),
                    )
                }
            }
            BackendKind::Hash => (
                true,
                format!("{} dimensions", self.config.hash_dimension),
            ),
        };
        ProbeReport {
            kind,
            available,
            detail,
        }
    }

    fn local_model_detail(&self) -> (bool, String) {
        match self.config.local_dimension() {
            Ok(dim) => (true, format!("{} ({dim} dimensions)", self.config.model_name)),
            Err(e) => (false, e.to_string()),
        }
    }

    /// Probe reports for every backend, preferred ones first.
    pub fn probe_all(&self) -> Vec<ProbeReport> {
        BackendKind::PREFERENCE
            .iter()
            .copied()
            .chain(std::iter::once(BackendKind::Hash))
            .map(|kind| self.probe(kind))
            .collect()
    }

    /// The backend that will be used. Does not initialize it.
    pub fn select(&self) -> Result<AnyEmbedder> {
        let candidates: Vec<BackendKind> = match self.config.backend {
            Some(kind) => vec![kind],
            None => BackendKind::PREFERENCE.to_vec(),
        };

        let mut rejected = Vec::new();
        for kind in candidates {
            let report = self.probe(kind);
            if report.available {
                tracing::info!("Selected {} embedding backend: {}", kind, report.detail);
                return self.build(kind);
            }
            tracing::debug!("Skipping {} backend: {}", kind, report.detail);
            rejected.push(format!("{}: {}", kind, report.detail));
        }
        Err(EmbedError::NoUsableBackend {
            details: rejected.join("; "),
        })
    }

    /// Construct `kind` without probing it.
    pub fn build(&self, kind: BackendKind) -> Result<AnyEmbedder> {
        self.config.validate()?;
        Ok(match kind {
            BackendKind::Gpu => {
                AnyEmbedder::Gpu(FastEmbedProvider::new(self.config.clone(), Device::Cuda)?)
            }
            BackendKind::Cpu => {
                AnyEmbedder::Cpu(FastEmbedProvider::new(self.config.clone(), Device::Cpu)?)
            }
            BackendKind::Remote => AnyEmbedder::Remote(RemoteEmbeddingProvider::new(
                self.config.remote.clone(),
                self.config.batch_size,
            )),
            BackendKind::Hash => {
                AnyEmbedder::Hash(HashEmbeddingProvider::new(self.config.hash_dimension))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;

    fn offline_config() -> EmbedConfig {
        EmbedConfig {
            remote: RemoteConfig {
                api_key_env: "SIFT_TEST_NO_SUCH_KEY".to_string(),
                ..RemoteConfig::default()
            },
            ..EmbedConfig::default()
        }
    }

    #[test]
    fn test_cpu_wins_without_gpu_or_override() {
        let factory = EmbedderFactory::new(offline_config());
        if gpu_runtime_available() {
            return;
        }
        let embedder = factory.select().unwrap();
        assert_eq!(embedder.kind(), BackendKind::Cpu);
        assert_eq!(embedder.provider_name(), "fastembed:all-minilm-l6-v2");
    }

    #[test]
    fn test_override_is_respected() {
        let factory = EmbedderFactory::new(offline_config().with_backend(BackendKind::Hash));
        let embedder = factory.select().unwrap();
        assert_eq!(embedder.kind(), BackendKind::Hash);
        assert_eq!(embedder.embedding_dimension(), 256);
    }

    #[test]
    fn test_unavailable_override_names_reason() {
        let factory = EmbedderFactory::new(offline_config().with_backend(BackendKind::Remote));
        let err = factory.select().err().unwrap();
        match err {
            EmbedError::NoUsableBackend { details } => {
                assert!(details.contains("SIFT_TEST_NO_SUCH_KEY"), "{details}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_nothing_usable_lists_every_probe() {
        let config = EmbedConfig {
            model_name: "unknown-model".to_string(),
            ..offline_config()
        };
        let err = EmbedderFactory::new(config).select().err().unwrap();
        let EmbedError::NoUsableBackend { details } = err else {
            panic!("expected NoUsableBackend");
        };
        assert!(details.contains("gpu:"));
        assert!(details.contains("cpu:"));
        assert!(details.contains("remote:"));
    }

    #[test]
    fn test_probe_all_includes_hash() {
        let reports = EmbedderFactory::new(offline_config()).probe_all();
        assert_eq!(reports.len(), 4);
        assert_eq!(reports[3].kind, BackendKind::Hash);
        assert!(reports[3].available);
        assert!(!reports[2].available);
    }

    #[tokio::test]
    async fn test_any_embedder_delegates() -> Result<()> {
        let embedder = EmbedderFactory::new(EmbedConfig::hashing(32)).build(BackendKind::Hash)?;
        assert_eq!(embedder.status(), EmbedderStatus::Uninitialized);
        embedder.initialize().await?;
        assert_eq!(embedder.status(), EmbedderStatus::Ready);
        let v = embedder.embed_text("hello world").await?;
        assert_eq!(v.len(), 32);
        embedder.dispose().await?;
        assert_eq!(embedder.status(), EmbedderStatus::Uninitialized);
        Ok(())
    }
}
