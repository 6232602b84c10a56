//! Remote embeddings over an OpenAI-compatible HTTP API

use crate::config::RemoteConfig;
use crate::downloader::{ModelDownloadProgress, ProgressSender, emit};
use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingResult, check_dimensions, normalize};
use crate::status::{EmbedderStatus, StatusCell};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Client state that exists only between `initialize` and `dispose`.
struct Session {
    client: reqwest::Client,
    api_key: String,
}

pub struct RemoteEmbeddingProvider {
    config: RemoteConfig,
    batch_size: usize,
    session: RwLock<Option<Session>>,
    name: String,
    status: StatusCell,
}

impl RemoteEmbeddingProvider {
    pub fn new(config: RemoteConfig, batch_size: usize) -> Self {
        let name = format!("remote:{}", config.model);
        Self {
            status: StatusCell::new(name.clone()),
            config,
            batch_size: batch_size.max(1),
            session: RwLock::new(None),
            name,
        }
    }

    /// Availability probe: an API key is configured.
    pub fn is_configured(config: &RemoteConfig) -> bool {
        config.api_key().is_some()
    }

    async fn request(&self, session: &Session, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = session
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&session.api_key)
            .json(&EmbeddingRequest {
                model: &self.config.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbedError::RemoteApi {
                status: status.as_u16(),
                message,
            });
        }

        let mut body: EmbeddingResponse = response.json().await?;
        if body.data.len() != texts.len() {
            return Err(EmbedError::RemoteApi {
                status: status.as_u16(),
                message: format!(
                    "expected {} embeddings, received {}",
                    texts.len(),
                    body.data.len()
                ),
            });
        }
        body.data.sort_by_key(|d| d.index);
        Ok(body
            .data
            .into_iter()
            .map(|d| {
                let mut embedding = d.embedding;
                normalize(&mut embedding);
                embedding
            })
            .collect())
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbeddingProvider {
    async fn initialize_with_progress(&self, progress: Option<ProgressSender>) -> Result<()> {
        let mut session = self.session.write().await;
        if session.is_some() {
            return Ok(());
        }
        self.status.set(EmbedderStatus::Initializing);
        emit(
            progress.as_ref(),
            ModelDownloadProgress::Started {
                model: self.config.model.clone(),
            },
        );

        let Some(api_key) = self.config.api_key() else {
            let message = format!("environment variable {} is not set", self.config.api_key_env);
            self.status.set(EmbedderStatus::Error(message.clone()));
            emit(
                progress.as_ref(),
                ModelDownloadProgress::Failed {
                    model: self.config.model.clone(),
                    error: message.clone(),
                },
            );
            return Err(EmbedError::invalid_config(message));
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()?;
        *session = Some(Session { client, api_key });

        self.status.set(EmbedderStatus::Ready);
        emit(
            progress.as_ref(),
            ModelDownloadProgress::Finished {
                model: self.config.model.clone(),
            },
        );
        Ok(())
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        self.status.ensure_usable()?;
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }
        let guard = self.session.read().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| EmbedError::not_initialized(&self.name))?;

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            tracing::debug!("Requesting {} remote embeddings", batch.len());
            all_embeddings.extend(self.request(session, batch).await?);
        }
        check_dimensions(self.config.dimension, &all_embeddings)?;
        Ok(EmbeddingResult::new(all_embeddings))
    }

    async fn dispose(&self) -> Result<()> {
        self.session.write().await.take();
        self.status.set(EmbedderStatus::Uninitialized);
        Ok(())
    }

    fn embedding_dimension(&self) -> usize {
        self.config.dimension
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> EmbedderStatus {
        self.status.get()
    }
}
