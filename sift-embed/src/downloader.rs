//! HuggingFace model downloading with progress events

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use hf_hub::api::tokio::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::mpsc;

/// One step of a model download or load.
///
/// A single `initialize` call emits a finite sequence that always ends with
/// `Finished` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ModelDownloadProgress {
    Started { model: String },
    FileStarted { file: String, index: usize, total: usize },
    FileFinished { file: String, index: usize, total: usize, bytes: u64 },
    Finished { model: String },
    Failed { model: String, error: String },
}

pub type ProgressSender = mpsc::UnboundedSender<ModelDownloadProgress>;

/// Send `event` if anyone is listening. A dropped receiver is not an error.
pub(crate) fn emit(progress: Option<&ProgressSender>, event: ModelDownloadProgress) {
    if let Some(tx) = progress {
        let _ = tx.send(event);
    }
}

/// Downloads models from HuggingFace Hub
pub struct ModelDownloader {
    api: Api,
}

impl ModelDownloader {
    pub fn new() -> Result<Self> {
        let api = Api::new().map_err(|e| EmbedError::External { source: e.into() })?;
        Ok(Self { api })
    }

    /// Make sure every file the model needs is present under `config.model_path()`.
    ///
    /// Files already on disk are skipped, so an interrupted download resumes
    /// where it stopped.
    pub async fn ensure_model(
        &self,
        config: &EmbedConfig,
        progress: Option<&ProgressSender>,
    ) -> Result<()> {
        let Some(repo_id) = config.hf_repo() else {
            tracing::debug!("Not a HuggingFace model, skipping download");
            return Ok(());
        };

        if is_model_complete(config) {
            tracing::info!("Model {} already exists and is complete", config.model_name);
            return Ok(());
        }

        tracing::info!("Downloading model {} from {}", config.model_name, repo_id);
        fs::create_dir_all(config.model_path().join("onnx")).await?;

        let repo = self.api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            config.hf_revision().to_string(),
        ));
        self.download_model_files(&repo, config, progress).await?;

        tracing::info!("Model {} downloaded successfully", config.model_name);
        Ok(())
    }

    async fn download_model_files(
        &self,
        repo: &ApiRepo,
        config: &EmbedConfig,
        progress: Option<&ProgressSender>,
    ) -> Result<()> {
        let downloads = planned_downloads(config);
        let total = downloads.len();

        for (index, (remote_path, local_path)) in downloads.iter().enumerate() {
            if local_path.exists() {
                tracing::debug!("File already exists: {}", local_path.display());
                continue;
            }
            if let Some(parent) = local_path.parent() {
                fs::create_dir_all(parent).await?;
            }

            emit(
                progress,
                ModelDownloadProgress::FileStarted {
                    file: remote_path.to_string(),
                    index,
                    total,
                },
            );
            tracing::info!("Downloading {} to {}", remote_path, local_path.display());

            match repo.get(remote_path).await {
                Ok(cached) => {
                    let bytes = fs::copy(&cached, local_path).await?;
                    emit(
                        progress,
                        ModelDownloadProgress::FileFinished {
                            file: remote_path.to_string(),
                            index,
                            total,
                            bytes,
                        },
                    );
                }
                Err(e) if *remote_path == "special_tokens_map.json" => {
                    tracing::warn!("Failed to download {}: {}", remote_path, e);
                    write_fallback_special_tokens_map(local_path).await?;
                }
                Err(e) if *remote_path == "tokenizer_config.json" => {
                    tracing::info!(
                        "tokenizer_config.json not available ({}), a minimal config will be generated",
                        e
                    );
                }
                Err(e) => return Err(EmbedError::External { source: e.into() }),
            }
        }

        Ok(())
    }
}

/// (remote path, local path) pairs for every file the model uses.
fn planned_downloads(config: &EmbedConfig) -> Vec<(&'static str, PathBuf)> {
    let tokenizer = config.tokenizer_config();
    vec![
        (
            "onnx/model_q4.onnx",
            config.model_path().join("onnx").join("model_q4.onnx"),
        ),
        ("tokenizer.json", tokenizer.tokenizer_path),
        ("config.json", tokenizer.config_path),
        ("special_tokens_map.json", tokenizer.special_tokens_map_path),
        ("tokenizer_config.json", tokenizer.tokenizer_config_path),
    ]
}

/// Whether the weights and the required tokenizer files are all on disk.
pub fn is_model_complete(config: &EmbedConfig) -> bool {
    let tokenizer = config.tokenizer_config();
    let weights = config.onnx_model_path();
    std::iter::once(weights.as_path())
        .chain(tokenizer.required_files())
        .all(|path| {
            let exists = path.exists();
            if !exists {
                tracing::debug!("Missing file: {}", path.display());
            }
            exists
        })
}

async fn write_fallback_special_tokens_map(path: &Path) -> Result<()> {
    let fallback_content = serde_json::json!({
        "cls_token": "[CLS]",
        "sep_token": "[SEP]",
        "unk_token": "[UNK]",
        "pad_token": "[PAD]",
        "mask_token": "[MASK]"
    });

    let content = serde_json::to_string_pretty(&fallback_content)
        .map_err(|e| EmbedError::External { source: e.into() })?;

    fs::write(path, content).await?;
    tracing::info!("Created fallback special_tokens_map.json");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_incomplete_model_detected() {
        let temp_dir = tempdir().unwrap();
        let config = EmbedConfig::modernbert_large(temp_dir.path());
        assert!(!is_model_complete(&config));
    }

    #[tokio::test]
    async fn test_complete_model_detected() -> Result<()> {
        let temp_dir = tempdir().unwrap();
        let config = EmbedConfig::modernbert_large(temp_dir.path());
        for (_, local) in planned_downloads(&config) {
            fs::create_dir_all(local.parent().unwrap()).await?;
            fs::write(&local, b"{}").await?;
        }
        assert!(is_model_complete(&config));
        Ok(())
    }

    #[test]
    fn test_progress_events_serialize_with_tag() {
        let event = ModelDownloadProgress::FileStarted {
            file: "tokenizer.json".into(),
            index: 1,
            total: 5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "file_started");
        assert_eq!(json["total"], 5);
    }

    #[test]
    fn test_emit_without_listener_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        emit(
            Some(&tx),
            ModelDownloadProgress::Started {
                model: "m".into(),
            },
        );
        emit(None, ModelDownloadProgress::Finished { model: "m".into() });
    }
}
