//! Embedding capability and the machinery around it.
//!
//! # Architecture
//!
//! - `EmbeddingProvider`: synchronous `embed(texts) -> vectors` capability
//! - `local`: fastembed-backed provider, lazily loaded
//! - `remote`: HTTP feature-extraction provider used as fallback
//! - `protocol`: versioned request/response messages
//! - `worker`: background worker running a provider off the async threads
//! - `client`: versioned front of the worker (latest-wins per note and query)
//! - `fallback`: routes between local worker and remote provider, records
//!   failures and publishes user notices

mod client;
mod fallback;
mod local;
pub mod protocol;
mod remote;
mod worker;

pub use client::EmbeddingClient;
pub use fallback::{EmbedOutcome, Embedder, EmbedderOptions, EmbeddingNotice, EmbeddingRoute};
pub use local::LocalEmbedder;
pub use protocol::{ChunkVector, EmbedItem, EmbedRequest, EmbedResponse};
pub use remote::{coerce_vector, mean_pool, RemoteEmbedder};
pub use worker::{spawn_worker, WorkerHandle, WorkerReply};

#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Embedding generation failed: {0}")]
    Failed(String),

    #[error("Embedding worker failed: {0}")]
    Worker(String),

    #[error("Remote embedding failed: {0}")]
    Remote(String),

    #[error("Embedding timed out after {ms} ms")]
    Timeout { ms: u64 },

    #[error("Query superseded by a newer query")]
    QuerySuperseded,

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl EmbeddingError {
    /// A newer query took over; callers swallow this instead of reporting it.
    pub fn is_superseded(&self) -> bool {
        matches!(self, EmbeddingError::QuerySuperseded)
    }
}

/// Something that turns text into fixed-length vectors.
///
/// Implementations block; async callers go through the worker or
/// `spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier stored next to every vector this provider produced.
    fn model_id(&self) -> &str;

    /// One vector per input text, in input order.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Failed("No embedding returned".to_string()))
    }

    /// Whether the provider can serve requests without a slow warm-up.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Scale `vector` to unit length. Zero or non-finite norms leave it as is.
pub fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm.is_finite() && norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
    vector
}
