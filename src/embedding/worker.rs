//! Background embedding worker.
//!
//! Requests arrive over a channel; each one runs its provider calls on the
//! blocking pool, batch by batch. Before every batch the worker checks that
//! the request is still the latest for its note (or the latest query) and
//! answers `Superseded` instead of finishing stale work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use super::protocol::{ChunkVector, EmbedRequest, EmbedResponse};
use super::{EmbeddingError, EmbeddingProvider};

/// Items per provider call.
const BATCH_SIZE: usize = 16;

#[derive(Debug)]
pub enum WorkerReply {
    Response(EmbedResponse),
    Superseded,
}

/// Latest issued version per note and for queries.
#[derive(Default)]
pub(crate) struct VersionBook {
    by_note: Mutex<HashMap<String, u64>>,
    latest_query: AtomicU64,
}

impl VersionBook {
    fn record(&self, request: &EmbedRequest) {
        match request {
            EmbedRequest::EmbedChunks { note_id, version, .. } => {
                let mut by_note = self.by_note.lock().unwrap_or_else(|e| e.into_inner());
                let latest = by_note.entry(note_id.clone()).or_insert(0);
                *latest = (*latest).max(*version);
            }
            EmbedRequest::EmbedQuery { version, .. } => {
                self.latest_query.fetch_max(*version, Ordering::SeqCst);
            }
        }
    }

    pub(crate) fn is_latest_note(&self, note_id: &str, version: u64) -> bool {
        let by_note = self.by_note.lock().unwrap_or_else(|e| e.into_inner());
        by_note.get(note_id).map_or(true, |latest| *latest == version)
    }

    pub(crate) fn is_latest_query(&self, version: u64) -> bool {
        self.latest_query.load(Ordering::SeqCst) == version
    }

    fn is_latest(&self, request: &EmbedRequest) -> bool {
        match request {
            EmbedRequest::EmbedChunks { note_id, version, .. } => self.is_latest_note(note_id, *version),
            EmbedRequest::EmbedQuery { version, .. } => self.is_latest_query(*version),
        }
    }
}

struct Envelope {
    request: EmbedRequest,
    reply: oneshot::Sender<WorkerReply>,
}

#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    book: Arc<VersionBook>,
}

impl WorkerHandle {
    /// Record the request as the latest of its kind and hand it to the worker.
    pub fn submit(&self, request: EmbedRequest) -> Result<oneshot::Receiver<WorkerReply>, EmbeddingError> {
        self.book.record(&request);

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { request, reply })
            .map_err(|_| EmbeddingError::Worker("embedding worker has stopped".to_string()))?;
        Ok(rx)
    }

    pub(crate) fn book(&self) -> &VersionBook {
        &self.book
    }
}

/// Start a worker for `provider`. Must be called inside a tokio runtime.
pub fn spawn_worker(provider: Arc<dyn EmbeddingProvider>) -> WorkerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let book = Arc::new(VersionBook::default());

    let worker_book = book.clone();
    tokio::spawn(async move {
        while let Some(Envelope { request, reply }) = rx.recv().await {
            let provider = provider.clone();
            let book = worker_book.clone();
            tokio::spawn(async move {
                let outcome = process(provider, &book, request).await;
                // The caller may have timed out and dropped its receiver.
                let _ = reply.send(outcome);
            });
        }
        log::debug!("embedding worker stopped");
    });

    WorkerHandle { tx, book }
}

async fn process(provider: Arc<dyn EmbeddingProvider>, book: &VersionBook, request: EmbedRequest) -> WorkerReply {
    let result = match &request {
        EmbedRequest::EmbedChunks { note_id, version, items, .. } => {
            let mut vectors = Vec::with_capacity(items.len());
            let mut dimensions = None;
            for batch in items.chunks(BATCH_SIZE) {
                if !book.is_latest(&request) {
                    log::debug!("dropping superseded embedding job for note {note_id} v{version}");
                    return WorkerReply::Superseded;
                }

                let texts: Vec<String> = batch.iter().map(|item| item.text.clone()).collect();
                let embedded = match run_blocking(provider.clone(), move |p| p.embed(&texts)).await {
                    Ok(embedded) => embedded,
                    Err(err) => return error_reply(err, request),
                };
                if embedded.len() != batch.len() {
                    let err = EmbeddingError::Failed(format!(
                        "provider returned {} vectors for {} texts",
                        embedded.len(),
                        batch.len()
                    ));
                    return error_reply(err, request);
                }

                for (item, vector) in batch.iter().zip(embedded) {
                    if let Err(err) = check_dimensions(&mut dimensions, &vector) {
                        return error_reply(err, request);
                    }
                    vectors.push(ChunkVector {
                        chunk_id: item.chunk_id.clone(),
                        vector,
                    });
                }
            }

            EmbedResponse::ChunksResult {
                note_id: note_id.clone(),
                version: *version,
                vectors,
            }
        }
        EmbedRequest::EmbedQuery { version, text, .. } => {
            if !book.is_latest(&request) {
                return WorkerReply::Superseded;
            }

            let text = text.clone();
            let vector = match run_blocking(provider.clone(), move |p| p.embed_query(&text)).await {
                Ok(vector) => vector,
                Err(err) => return error_reply(err, request),
            };
            if let Err(err) = check_dimensions(&mut None, &vector) {
                return error_reply(err, request);
            }

            EmbedResponse::QueryResult {
                version: *version,
                vector,
            }
        }
    };

    if !book.is_latest(&request) {
        return WorkerReply::Superseded;
    }
    WorkerReply::Response(result)
}

async fn run_blocking<T, F>(provider: Arc<dyn EmbeddingProvider>, f: F) -> Result<T, EmbeddingError>
where
    T: Send + 'static,
    F: FnOnce(&dyn EmbeddingProvider) -> Result<T, EmbeddingError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(provider.as_ref()))
        .await
        .map_err(|err| EmbeddingError::Worker(format!("embedding task failed: {err}")))?
}

/// All vectors of one response share a non-zero length.
fn check_dimensions(expected: &mut Option<usize>, vector: &[f32]) -> Result<(), EmbeddingError> {
    if vector.is_empty() {
        return Err(EmbeddingError::Failed("provider returned an empty vector".to_string()));
    }
    match *expected {
        Some(dims) if dims != vector.len() => Err(EmbeddingError::DimensionMismatch {
            expected: dims,
            got: vector.len(),
        }),
        Some(_) => Ok(()),
        None => {
            *expected = Some(vector.len());
            Ok(())
        }
    }
}

fn error_reply(err: EmbeddingError, request: EmbedRequest) -> WorkerReply {
    log::warn!("embedding request v{} failed: {err}", request.version());
    WorkerReply::Response(EmbedResponse::Error {
        message: err.to_string(),
        originating_request: request,
    })
}
