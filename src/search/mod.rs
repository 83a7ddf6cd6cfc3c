//! Semantic search over stored chunk embeddings.
//!
//! # Architecture
//!
//! - `ranking`: dot product, bounded top-K and best-chunk-per-note collapse
//! - `highlight`: query terms, snippets, highlight payload codec and renderer

mod highlight;
mod ranking;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::embedding::{Embedder, EmbeddingError};
use crate::store::{Database, StoreError};

pub use highlight::{
    create_snippet, decode_highlight, encode_highlight, get_terms, render_snippet, strip_markdown, HighlightRange,
    SearchHighlightPayload, Snippet, DEFAULT_SNIPPET_MAX_LENGTH,
};
pub use ranking::{best_per_note, dot_product, Candidate, Ranker, Scored, TopK};

pub const DEFAULT_TOP_K: usize = 12;
pub const DEFAULT_OVERSAMPLING_FACTOR: usize = 2;

/// Chars of raw chunk text shown when no snippet could be built.
const FALLBACK_SNIPPET_CHARS: usize = 240;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("search superseded by a newer search")]
    Superseded,
}

impl SearchError {
    /// A newer search took over; not something to show the user.
    pub fn is_superseded(&self) -> bool {
        match self {
            SearchError::Superseded => true,
            SearchError::Embedding(err) => err.is_superseded(),
            SearchError::Store(_) => false,
        }
    }
}

/// One ranked note.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticMatch {
    #[serde(flatten)]
    pub payload: SearchHighlightPayload,
    pub score: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub top_k: usize,
    pub oversampling_factor: usize,
    pub snippet_max_length: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            oversampling_factor: DEFAULT_OVERSAMPLING_FACTOR,
            snippet_max_length: DEFAULT_SNIPPET_MAX_LENGTH,
        }
    }
}

pub struct SearchService {
    embedder: Arc<Embedder>,
    db: Arc<Database>,
    options: SearchOptions,
    latest_search: AtomicU64,
}

impl SearchService {
    pub fn new(embedder: Arc<Embedder>, db: Arc<Database>, options: SearchOptions) -> Self {
        Self {
            embedder,
            db,
            options,
            latest_search: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> SearchOptions {
        self.options
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SemanticMatch>, SearchError> {
        self.search_top(query, self.options.top_k).await
    }

    /// Rank notes against `query`, best first, at most `top_k`. Soft-deleted
    /// notes are left out of the scan.
    ///
    /// A search started later makes this one return `SearchError::Superseded`.
    pub async fn search_top(&self, query: &str, top_k: usize) -> Result<Vec<SemanticMatch>, SearchError> {
        let query = query.trim();
        if query.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let search_id = self.latest_search.fetch_add(1, Ordering::SeqCst) + 1;
        let terms = get_terms(query);

        let vector = self.embedder.embed_query(query).await?;
        self.ensure_latest(search_id)?;

        let model_id = self.embedder.model_id().to_string();
        let hidden = self.db.deleted_note_ids()?;
        let mut ranker = Ranker::new(&vector, top_k, self.options.oversampling_factor);
        self.db.scan_embeddings(&model_id, |embedding| {
            if !hidden.contains(&embedding.note_id) {
                ranker.offer(embedding);
            }
        })?;
        let ranked = ranker.finish(top_k);

        let chunk_ids: Vec<String> = ranked.iter().map(|c| c.chunk_id.clone()).collect();
        let chunks = self.db.chunks_by_ids(&chunk_ids)?;

        let mut matches = Vec::with_capacity(ranked.len());
        for (candidate, chunk) in ranked.into_iter().zip(chunks) {
            let Some(chunk) = chunk else {
                log::debug!("skipping match {} whose chunk is gone", candidate.chunk_id);
                continue;
            };

            let mut snippet = create_snippet(&chunk.text, &terms, self.options.snippet_max_length);
            if snippet.snippet.is_empty() {
                snippet = Snippet {
                    snippet: chunk.text.chars().take(FALLBACK_SNIPPET_CHARS).collect(),
                    ..Snippet::default()
                };
            }

            matches.push(SemanticMatch {
                payload: SearchHighlightPayload {
                    note_id: candidate.note_id,
                    chunk_id: candidate.chunk_id,
                    snippet: snippet.snippet,
                    highlights: snippet.highlights,
                    leading_ellipsis: snippet.leading_ellipsis,
                    trailing_ellipsis: snippet.trailing_ellipsis,
                    terms: terms.clone(),
                },
                score: candidate.score,
            });
        }

        self.ensure_latest(search_id)?;
        log::debug!("search {search_id} for {query:?} matched {} notes", matches.len());
        Ok(matches)
    }

    fn ensure_latest(&self, search_id: u64) -> Result<(), SearchError> {
        if self.latest_search.load(Ordering::SeqCst) == search_id {
            Ok(())
        } else {
            Err(SearchError::Superseded)
        }
    }
}
