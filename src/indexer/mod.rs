//! Incremental note indexing.
//!
//! # Architecture
//!
//! - `IndexingService`: per-note debounce and flush with monotonic versions
//! - `pipeline`: chunk, diff against the stored chunk set, embed, apply
//!
//! Every job is stamped with the note's version when it is scheduled. Any
//! stage that completes later compares that stamp with the current version
//! and drops its results when a newer job exists. Nothing in flight is ever
//! interrupted.

mod pipeline;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::chunking::{ChunkingError, ChunkingSettings};
use crate::embedding::{Embedder, EmbeddingError, EmbeddingRoute};
use crate::store::{Database, Note, StoreError};

pub use pipeline::chunks_to_embed;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("chunking failed: {0}")]
    Chunking(#[from] ChunkingError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// What happened to one executed job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// A newer job for the note took over; nothing was written.
    Superseded,
    /// Chunks and embeddings already matched the content.
    UpToDate,
    Indexed {
        chunks_written: usize,
        embedded: usize,
        route: Option<EmbeddingRoute>,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexEvent {
    pub note_id: String,
    pub version: u64,
    pub outcome: JobOutcome,
}

/// Snapshot of the note a job indexes.
#[derive(Debug, Clone)]
struct Job {
    note_id: String,
    version: u64,
    title: Option<String>,
    content: String,
}

impl Job {
    fn new(note: &Note, version: u64) -> Self {
        Self {
            note_id: note.id.clone(),
            version,
            title: note.title.clone(),
            content: note.content.clone(),
        }
    }
}

/// Recorded when chunk vectors are requested; the result is applied only if
/// it still matches.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEmbed {
    version: u64,
    content_hash: String,
}

#[derive(Debug, Default)]
struct NoteIndexingState {
    version: u64,
    pending_timer: Option<JoinHandle<()>>,
    pending_embed: Option<PendingEmbed>,
}

struct Inner {
    db: Arc<Database>,
    embedder: Arc<Embedder>,
    settings: ChunkingSettings,
    states: Mutex<HashMap<String, NoteIndexingState>>,
    events: broadcast::Sender<IndexEvent>,
}

/// Schedules and runs indexing jobs. Cheap to clone.
///
/// Lock order is store first, then job state; job state is never held across
/// a store call or an await.
#[derive(Clone)]
pub struct IndexingService {
    inner: Arc<Inner>,
}

impl IndexingService {
    pub fn new(db: Arc<Database>, embedder: Arc<Embedder>, settings: ChunkingSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                db,
                embedder,
                settings,
                states: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.inner.events.subscribe()
    }

    /// Latest version issued for `note_id`, 0 if none.
    pub fn version(&self, note_id: &str) -> u64 {
        self.inner.states().get(note_id).map_or(0, |state| state.version)
    }

    /// Index `note` after `delay`, replacing any job still waiting for it.
    /// Returns the job's version.
    pub fn schedule(&self, note: &Note, delay: Duration) -> u64 {
        let mut states = self.inner.states();
        let state = states.entry(note.id.clone()).or_default();
        let version = bump(state);

        let job = Job::new(note, version);
        let inner = self.inner.clone();
        state.pending_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.fire_timer(&job.note_id, job.version) {
                inner.run(job).await;
            }
        }));

        log::debug!("scheduled note {} v{version} in {delay:?}", note.id);
        version
    }

    /// Index `note` now, replacing any job still waiting for it.
    pub fn flush(&self, note: &Note) -> JoinHandle<JobOutcome> {
        let version = {
            let mut states = self.inner.states();
            bump(states.entry(note.id.clone()).or_default())
        };

        let job = Job::new(note, version);
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(job).await })
    }

    /// Invalidate every job for `note_id`, waiting or in flight.
    pub fn forget(&self, note_id: &str) {
        let mut states = self.inner.states();
        if let Some(state) = states.get_mut(note_id) {
            bump(state);
            state.pending_embed = None;
        }
    }
}

/// New version for a note; a waiting timer is cancelled.
fn bump(state: &mut NoteIndexingState) -> u64 {
    state.version += 1;
    if let Some(timer) = state.pending_timer.take() {
        timer.abort();
    }
    state.version
}

impl Inner {
    fn states(&self) -> MutexGuard<'_, HashMap<String, NoteIndexingState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, note_id: &str, version: u64) -> bool {
        self.states().get(note_id).is_some_and(|state| state.version == version)
    }

    /// A timer woke up; it may run only if nothing replaced it meanwhile.
    fn fire_timer(&self, note_id: &str, version: u64) -> bool {
        let mut states = self.states();
        match states.get_mut(note_id) {
            Some(state) if state.version == version => {
                state.pending_timer = None;
                true
            }
            _ => false,
        }
    }

    async fn run(&self, job: Job) -> JobOutcome {
        let outcome = match self.index(&job).await {
            Ok(outcome) => outcome,
            Err(err) => {
                log::error!("indexing note {} v{} failed: {err}", job.note_id, job.version);
                JobOutcome::Failed {
                    message: err.to_string(),
                }
            }
        };

        tracing::info!(
            note_id = %job.note_id,
            version = job.version,
            outcome = ?outcome,
            "indexing job finished"
        );

        // No subscribers is fine.
        let _ = self.events.send(IndexEvent {
            note_id: job.note_id,
            version: job.version,
            outcome: outcome.clone(),
        });
        outcome
    }
}
