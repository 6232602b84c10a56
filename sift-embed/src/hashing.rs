//! Deterministic feature-hashing embedder.
//!
//! Tokens and adjacent token pairs are hashed into a fixed number of buckets
//! with a signed count, then the vector is normalized. Texts that share
//! identifiers land close together, which is enough to exercise the whole
//! pipeline without a model.

use crate::downloader::{ModelDownloadProgress, ProgressSender, emit};
use crate::error::Result;
use crate::provider::{EmbeddingProvider, EmbeddingResult, normalize};
use crate::status::{EmbedderStatus, StatusCell};
use async_trait::async_trait;
use fnv::FnvHasher;
use std::hash::Hasher;

pub struct HashEmbeddingProvider {
    dimension: usize,
    name: String,
    status: StatusCell,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        let name = format!("hash:v1:{dimension}");
        Self {
            dimension,
            status: StatusCell::new(name.clone()),
            name,
        }
    }

    /// The vector for `text`, without any readiness check.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        let mut values = vec![0.0f32; self.dimension];
        if tokens.is_empty() {
            values[0] = 1.0;
            return values;
        }
        for token in &tokens {
            self.accumulate(&mut values, &[token.as_str()], 1.0);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut values, &[pair[0].as_str(), pair[1].as_str()], 0.5);
        }
        normalize(&mut values);
        values
    }

    fn accumulate(&self, values: &mut [f32], parts: &[&str], weight: f32) {
        let mut hasher = FnvHasher::default();
        for part in parts {
            hasher.write(part.as_bytes());
            hasher.write_u8(0xff);
        }
        let hash = hasher.finish();
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        values[bucket] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn initialize_with_progress(&self, progress: Option<ProgressSender>) -> Result<()> {
        emit(
            progress.as_ref(),
            ModelDownloadProgress::Started {
                model: self.name.clone(),
            },
        );
        self.status.set(EmbedderStatus::Ready);
        emit(
            progress.as_ref(),
            ModelDownloadProgress::Finished {
                model: self.name.clone(),
            },
        );
        Ok(())
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        self.status.ensure_usable()?;
        Ok(EmbeddingResult::new(
            texts.iter().map(|t| self.embed_sync(t)).collect(),
        ))
    }

    async fn dispose(&self) -> Result<()> {
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
