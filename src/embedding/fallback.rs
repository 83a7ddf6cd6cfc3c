//! Local-first embedding with optional remote fallback.
//!
//! Every local failure is logged and recorded in the local error table before
//! the host policy decides whether to retry remotely or give up.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

use super::client::EmbeddingClient;
use super::protocol::{ChunkVector, EmbedItem};
use super::{EmbeddingError, EmbeddingProvider};
use crate::config::{Config, EmbeddingHost};
use crate::eid::Eid;
use crate::store::{Database, EmbeddingErrorKind, LocalEmbeddingError, Table};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingRoute {
    Local,
    Remote,
}

/// A failure the user may need to acknowledge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingNotice {
    pub kind: EmbeddingErrorKind,
    pub message: String,
    /// The remote fallback produced the result instead.
    pub fallback_used: bool,
    /// The configured policy permits a remote fallback.
    pub fallback_available: bool,
}

#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    pub vectors: Vec<ChunkVector>,
    pub route: EmbeddingRoute,
}

#[derive(Debug, Clone)]
pub struct EmbedderOptions {
    pub host: EmbeddingHost,
    pub dismiss_error_messages: bool,
    pub chunk_timeout: Duration,
    pub query_timeout: Duration,
}

impl EmbedderOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.embedding.host,
            dismiss_error_messages: config.embedding.dismiss_error_messages,
            chunk_timeout: Duration::from_millis(config.embedding.chunk_timeout_ms),
            query_timeout: Duration::from_millis(config.search.query_timeout_ms),
        }
    }
}

pub struct Embedder {
    local: EmbeddingClient,
    remote: Option<Arc<dyn EmbeddingProvider>>,
    db: Arc<Database>,
    options: EmbedderOptions,
    online: AtomicBool,
    latest_query: AtomicU64,
    notices: broadcast::Sender<EmbeddingNotice>,
}

impl Embedder {
    /// Spawns the local worker; call inside a tokio runtime.
    pub fn new(
        local: Arc<dyn EmbeddingProvider>,
        remote: Option<Arc<dyn EmbeddingProvider>>,
        db: Arc<Database>,
        options: EmbedderOptions,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            local: EmbeddingClient::new(local),
            remote,
            db,
            options,
            online: AtomicBool::new(true),
            latest_query: AtomicU64::new(0),
            notices,
        }
    }

    /// Model id stored with every vector, whichever route produced it.
    pub fn model_id(&self) -> &str {
        self.local.model_id()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EmbeddingNotice> {
        self.notices.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.local.is_ready()
            || (self.fallback_allowed() && self.remote.as_ref().is_some_and(|r| r.is_ready()))
    }

    fn fallback_available(&self) -> bool {
        self.options.host == EmbeddingHost::AllowFallback && self.remote.is_some()
    }

    fn fallback_allowed(&self) -> bool {
        self.fallback_available() && self.is_online()
    }

    /// Embed chunk texts. `Ok(None)` means a newer version of the note took over.
    pub async fn embed_chunks(
        &self,
        note_id: &str,
        version: u64,
        items: Vec<EmbedItem>,
    ) -> Result<Option<EmbedOutcome>, EmbeddingError> {
        let local = self
            .local
            .embed_chunks(note_id, version, items.clone(), self.options.chunk_timeout)
            .await;

        let err = match local {
            Ok(Some(vectors)) => {
                return Ok(Some(EmbedOutcome {
                    vectors,
                    route: EmbeddingRoute::Local,
                }))
            }
            Ok(None) => return Ok(None),
            Err(err) => err,
        };

        self.record_failure(EmbeddingErrorKind::EmbedChunks, &err);
        let Some(remote) = self.remote.clone().filter(|_| self.fallback_allowed()) else {
            self.notify(EmbeddingErrorKind::EmbedChunks, &err, false);
            return Err(err);
        };

        log::info!("embedding {} chunks of note {note_id} remotely", items.len());
        let texts: Vec<String> = items.iter().map(|item| item.text.clone()).collect();
        let result = tokio::task::spawn_blocking(move || remote.embed(&texts))
            .await
            .map_err(|e| EmbeddingError::Remote(format!("remote embedding task failed: {e}")))
            .and_then(|r| r)
            .and_then(|vectors| pair_vectors(&items, vectors));

        match result {
            Ok(vectors) => {
                self.notify(EmbeddingErrorKind::EmbedChunks, &err, true);
                Ok(Some(EmbedOutcome {
                    vectors,
                    route: EmbeddingRoute::Remote,
                }))
            }
            Err(remote_err) => {
                log::error!("remote embedding for note {note_id} failed: {remote_err}");
                self.notify(EmbeddingErrorKind::EmbedChunks, &remote_err, false);
                Err(remote_err)
            }
        }
    }

    /// Embed a search query within the configured query timeout.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_query_within(text, self.options.query_timeout).await
    }

    /// Embed a search query. A newer query makes this one fail with
    /// `EmbeddingError::QuerySuperseded` on either route; a superseded query
    /// is never recorded or reported.
    pub async fn embed_query_within(&self, text: &str, timeout: Duration) -> Result<Vec<f32>, EmbeddingError> {
        let query = self.latest_query.fetch_add(1, Ordering::SeqCst) + 1;

        let err = match self.local.embed_query(text, timeout).await {
            Ok(vector) => return self.latest_or_superseded(query, vector),
            Err(err) if err.is_superseded() => return Err(err),
            Err(err) => err,
        };
        self.latest_or_superseded(query, ())?;

        self.record_failure(EmbeddingErrorKind::EmbedQuery, &err);
        let Some(remote) = self.remote.clone().filter(|_| self.fallback_allowed()) else {
            self.notify(EmbeddingErrorKind::EmbedQuery, &err, false);
            return Err(err);
        };

        let text = text.to_string();
        let result = tokio::task::spawn_blocking(move || remote.embed_query(&text))
            .await
            .map_err(|e| EmbeddingError::Remote(format!("remote embedding task failed: {e}")))
            .and_then(|r| r)
            .and_then(|vector| {
                if vector.is_empty() {
                    Err(EmbeddingError::Remote("remote returned an empty vector".to_string()))
                } else {
                    Ok(vector)
                }
            });
        self.latest_or_superseded(query, ())?;

        match result {
            Ok(vector) => {
                self.notify(EmbeddingErrorKind::EmbedQuery, &err, true);
                Ok(vector)
            }
            Err(remote_err) => {
                log::error!("remote query embedding failed: {remote_err}");
                self.notify(EmbeddingErrorKind::EmbedQuery, &remote_err, false);
                Err(remote_err)
            }
        }
    }

    fn latest_or_superseded<T>(&self, query: u64, value: T) -> Result<T, EmbeddingError> {
        if self.latest_query.load(Ordering::SeqCst) == query {
            Ok(value)
        } else {
            Err(EmbeddingError::QuerySuperseded)
        }
    }

    fn record_failure(&self, kind: EmbeddingErrorKind, err: &EmbeddingError) {
        log::error!("local embedding failed ({kind}): {err}");

        let entry = LocalEmbeddingError {
            id: Eid::new().to_string(),
            kind,
            message: err.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(store_err) = self
            .db
            .transaction(&[Table::LocalEmbeddingErrors], |tx| tx.add_local_error(entry))
        {
            log::warn!("could not record embedding failure: {store_err}");
        }
    }

    fn notify(&self, kind: EmbeddingErrorKind, err: &EmbeddingError, fallback_used: bool) {
        if fallback_used && self.options.dismiss_error_messages {
            return;
        }

        // No subscribers is fine.
        let _ = self.notices.send(EmbeddingNotice {
            kind,
            message: err.to_string(),
            fallback_used,
            fallback_available: self.fallback_available(),
        });
    }
}

/// Match remote vectors to their items, enforcing one equal-length,
/// non-empty vector per item.
fn pair_vectors(items: &[EmbedItem], vectors: Vec<Vec<f32>>) -> Result<Vec<ChunkVector>, EmbeddingError> {
    if vectors.len() != items.len() {
        return Err(EmbeddingError::Remote(format!(
            "remote returned {} vectors for {} texts",
            vectors.len(),
            items.len()
        )));
    }

    let dims = vectors.first().map_or(0, Vec::len);
    if let Some(bad) = vectors.iter().find(|v| v.is_empty() || v.len() != dims) {
        return Err(EmbeddingError::DimensionMismatch {
            expected: dims,
            got: bad.len(),
        });
    }

    Ok(items
        .iter()
        .zip(vectors)
        .map(|(item, vector)| ChunkVector {
            chunk_id: item.chunk_id.clone(),
            vector,
        })
        .collect())
}
