//! Messages exchanged with the embedding worker.
//!
//! Every request carries a version; every request yields exactly one
//! response or one `Error` echoing the request.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedItem {
    pub chunk_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkVector {
    pub chunk_id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum EmbedRequest {
    EmbedChunks {
        note_id: String,
        version: u64,
        model_id: String,
        items: Vec<EmbedItem>,
    },
    EmbedQuery {
        version: u64,
        model_id: String,
        text: String,
    },
}

impl EmbedRequest {
    pub fn version(&self) -> u64 {
        match self {
            EmbedRequest::EmbedChunks { version, .. } | EmbedRequest::EmbedQuery { version, .. } => *version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum EmbedResponse {
    ChunksResult {
        note_id: String,
        version: u64,
        vectors: Vec<ChunkVector>,
    },
    QueryResult {
        version: u64,
        vector: Vec<f32>,
    },
    Error {
        message: String,
        originating_request: EmbedRequest,
    },
}
