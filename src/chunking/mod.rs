//! Note chunking: body composition, block splitting, merging and chunk identity.
//!
//! # Architecture
//!
//! - `preprocess`: hashing, title composition, markdown normalisation
//! - `blocks`: markdown block splitter and size-bounded merger
//!
//! `chunk_note` is pure; `chunk_in_background` runs it on the blocking pool
//! so a large note never stalls the scheduler.

mod blocks;
mod preprocess;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::store::Chunk;

pub use blocks::{get_blocks, merge_blocks};
pub use preprocess::{chunk_id, compose_body, hash, normalize_markdown, CHUNK_ID_HASH_PREFIX};

/// Default soft chunk size in characters.
pub const DEFAULT_TARGET_CHARS: usize = 800;
/// Default hard chunk size in characters.
pub const DEFAULT_MAX_CHARS: usize = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingSettings {
    pub target_chars: usize,
    pub max_chars: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            target_chars: DEFAULT_TARGET_CHARS,
            max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

/// A request to chunk one version of a note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingRequest {
    pub note_id: String,
    pub version: u64,
    pub title: Option<String>,
    pub content: String,
    pub settings: ChunkingSettings,
}

/// Chunks produced for one version of a note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingResult {
    pub note_id: String,
    pub version: u64,
    pub chunks: Vec<Chunk>,
    /// Hash of the raw content only, independent of the title.
    pub content_hash: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkingError {
    #[error("chunking task failed: {0}")]
    TaskFailed(String),
}

/// Chunk a note synchronously.
///
/// Chunks whose text repeats an earlier chunk of the same note share its id;
/// only the first occurrence is kept and `order` stays contiguous from 0.
pub fn chunk_note(request: &ChunkingRequest) -> ChunkingResult {
    let body = compose_body(request.title.as_deref(), &request.content);
    let blocks = get_blocks(&body);
    let texts = merge_blocks(
        &blocks,
        request.settings.target_chars,
        request.settings.max_chars,
    );

    let mut seen = HashSet::new();
    let mut chunks = Vec::with_capacity(texts.len());
    for text in texts {
        let chunk_hash = hash(&text);
        let id = chunk_id(&request.note_id, &chunk_hash);
        if !seen.insert(id.clone()) {
            log::debug!("dropping repeated chunk {id} of note {}", request.note_id);
            continue;
        }

        chunks.push(Chunk {
            id,
            note_id: request.note_id.clone(),
            order: chunks.len() as u32,
            text,
            hash: chunk_hash,
        });
    }

    ChunkingResult {
        note_id: request.note_id.clone(),
        version: request.version,
        chunks,
        content_hash: hash(&request.content),
    }
}

/// Chunk a note on the blocking thread pool.
pub async fn chunk_in_background(request: ChunkingRequest) -> Result<ChunkingResult, ChunkingError> {
    tokio::task::spawn_blocking(move || chunk_note(&request))
        .await
        .map_err(|err| ChunkingError::TaskFailed(err.to_string()))
}
