//! On-device embeddings through fastembed.
//!
//! The model is resolved from its name up front but downloaded and loaded on
//! first use, so opening the engine stays cheap.

use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use fastembed::{InitOptions, TextEmbedding};

use super::{l2_normalize, EmbeddingError, EmbeddingProvider};

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

pub struct LocalEmbedder {
    model_name: String,
    model: fastembed::EmbeddingModel,
    cache_dir: PathBuf,
    download_timeout: Duration,
    /// fastembed's embed() needs &mut self, hence the Mutex.
    state: Mutex<Option<TextEmbedding>>,
    /// Set once the model is loaded; readable while `state` is held.
    loaded: AtomicBool,
}

impl LocalEmbedder {
    /// # Arguments
    /// * `model_name` - e.g. "bge-small-en-v1.5"
    /// * `cache_dir` - models are cached in its `models/` subdirectory
    /// * `download_timeout` - limit for the first download and load
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        Ok(Self {
            model_name: model_name.to_string(),
            model: parse_model_name(model_name)?,
            cache_dir,
            download_timeout: download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT),
            state: Mutex::new(None),
            loaded: AtomicBool::new(false),
        })
    }

    fn load(&self) -> Result<TextEmbedding, EmbeddingError> {
        let models_dir = self.cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(self.model.clone())
            .with_cache_dir(models_dir)
            .with_show_download_progress(false);

        log::info!("loading embedding model {}", self.model_name);

        // Loading may download the model; bound it without blocking forever.
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(TextEmbedding::try_new(options).map_err(|e| e.to_string()));
        });

        match rx.recv_timeout(self.download_timeout) {
            Ok(Ok(model)) => Ok(model),
            Ok(Err(message)) => Err(EmbeddingError::InitFailed(message)),
            Err(RecvTimeoutError::Timeout) => Err(EmbeddingError::InitFailed(format!(
                "Model download timed out after {} seconds",
                self.download_timeout.as_secs()
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(EmbeddingError::InitFailed(
                "Model loader exited unexpectedly".to_string(),
            )),
        }
    }
}

impl EmbeddingProvider for LocalEmbedder {
    fn model_id(&self) -> &str {
        &self.model_name
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut guard = self.state.lock().map_err(|e| {
            EmbeddingError::Failed(format!("Failed to acquire model lock: {}", e))
        })?;

        if guard.is_none() {
            *guard = Some(self.load()?);
            self.loaded.store(true, Ordering::SeqCst);
        }
        let model = guard
            .as_mut()
            .ok_or_else(|| EmbeddingError::InitFailed("Model not loaded".to_string()))?;

        let vectors = model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::Failed(e.to_string()))?;

        Ok(vectors.into_iter().map(l2_normalize).collect())
    }

    fn is_ready(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }
}

/// Parse model name string to fastembed enum.
fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l6-v2-q" | "allminiml6v2q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
        "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-small-en-v1.5-q" | "bgesmallenv15q" => Ok(fastembed::EmbeddingModel::BGESmallENV15Q),
        "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-base-en-v1.5-q" | "bgebaseenv15q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
        "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "bge-large-en-v1.5-q" | "bgelargeenv15q" => Ok(fastembed::EmbeddingModel::BGELargeENV15Q),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (add -q suffix for quantized)",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_model_name() {
        let result = LocalEmbedder::new("nonexistent-model", std::env::temp_dir(), None);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_model_is_loaded_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = LocalEmbedder::new("BGE-Small-EN-v1.5", dir.path().to_path_buf(), None).unwrap();
        assert_eq!(embedder.model_id(), "BGE-Small-EN-v1.5");
        assert!(!embedder.is_ready());
        assert!(embedder.embed(&[]).unwrap().is_empty());
        assert!(!dir.path().join("models").exists());
    }

    #[test]
    fn test_readiness_does_not_wait_for_a_load_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = LocalEmbedder::new("bge-small-en-v1.5", dir.path().to_path_buf(), None).unwrap();

        // stands in for embed() holding the lock through a download
        let _loading = embedder.state.lock().unwrap();
        assert!(!embedder.is_ready());
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_embedding_generation() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = LocalEmbedder::new("bge-small-en-v1.5", dir.path().to_path_buf(), None).unwrap();

        let vectors = embedder
            .embed(&["Hello, world!".to_string(), "second".to_string()])
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 384);
        assert!(embedder.is_ready());

        let norm: f32 = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }
}
