//! Scenario tests across the indexer, embedder, store and search.
//!
//! Providers are in-process mocks, so nothing here downloads a model.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, EmbeddingHost};
use crate::embedding::{l2_normalize, EmbeddingError, EmbeddingProvider};
use crate::engine::Engine;
use crate::store::Database;

pub const MODEL: &str = "test-model";
const DIMS: usize = 64;

/// Bag-of-words vectors: each lowercase word bumps one hashed bucket.
pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; DIMS];
    for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let bucket = word
            .to_lowercase()
            .bytes()
            .fold(17usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
            % DIMS;
        vector[bucket] += 1.0;
    }
    l2_normalize(vector)
}

pub struct MockEmbedder {
    model: String,
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
    texts: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(model: &str) -> Arc<Self> {
        Arc::new(Self {
            model: model.to_string(),
            delay: Duration::ZERO,
            fail: false,
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        })
    }

    pub fn slow(model: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            model: model.to_string(),
            delay,
            fail: false,
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        })
    }

    pub fn failing(model: &str) -> Arc<Self> {
        Arc::new(Self {
            model: model.to_string(),
            delay: Duration::ZERO,
            fail: true,
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for MockEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail {
            return Err(EmbeddingError::InitFailed("model files missing".to_string()));
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }

    fn is_ready(&self) -> bool {
        !self.fail
    }
}

pub fn test_config(host: EmbeddingHost) -> Config {
    let mut config = Config::default();
    config.embedding.model = MODEL.to_string();
    config.embedding.host = host;
    config.embedding.chunk_timeout_ms = 5_000;
    config.search.query_timeout_ms = 5_000;
    config.indexing.debounce_ms = 50;
    config.indexing.target_chars = 60;
    config.indexing.max_chars = 200;
    config
}

pub fn engine_over(
    db: Arc<Database>,
    local: Arc<dyn EmbeddingProvider>,
    remote: Option<Arc<dyn EmbeddingProvider>>,
    host: EmbeddingHost,
) -> Engine {
    Engine::with_providers(test_config(host), db, local, remote)
}

pub fn local_engine(local: Arc<dyn EmbeddingProvider>) -> Engine {
    engine_over(Arc::new(Database::in_memory()), local, None, EmbeddingHost::LocalOnly)
}
