use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A size-bounded slice of a note, the unit that gets embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// `<note_id>:<first 12 hex chars of hash>`
    pub id: String,
    pub note_id: String,
    pub order: u32,
    pub text: String,
    pub hash: String,
}

/// Per-note indexing cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteHash {
    pub note_id: String,
    #[serde(default)]
    pub last_indexed_hash: Option<String>,
    #[serde(default)]
    pub indexed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_embedded_hash: Option<String>,
    #[serde(default)]
    pub last_embedding_model_id: Option<String>,
    #[serde(default)]
    pub embedded_at: Option<DateTime<Utc>>,
}

impl NoteHash {
    pub fn new(note_id: &str) -> Self {
        Self {
            note_id: note_id.to_string(),
            ..Default::default()
        }
    }

    /// True when both the chunk set and its embeddings match `content_hash`
    /// under `model_id`.
    pub fn is_current(&self, content_hash: &str, model_id: &str) -> bool {
        self.last_indexed_hash.as_deref() == Some(content_hash)
            && self.last_embedded_hash.as_deref() == Some(content_hash)
            && self.last_embedding_model_id.as_deref() == Some(model_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub chunk_id: String,
    pub note_id: String,
    pub model_id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmbeddingErrorKind {
    EmbedQuery,
    EmbedChunks,
}

impl std::fmt::Display for EmbeddingErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingErrorKind::EmbedQuery => write!(f, "EMBED_QUERY"),
            EmbeddingErrorKind::EmbedChunks => write!(f, "EMBED_CHUNKS"),
        }
    }
}

/// A failure of the local embedding pipeline, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEmbeddingError {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EmbeddingErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
