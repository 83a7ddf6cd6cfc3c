//! The façade hosts and the CLI talk to.
//!
//! Note writes go through the store and then schedule indexing; search,
//! readiness, online state and notices are forwarded to the services.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::{Config, ConfigError};
use crate::embedding::{
    Embedder, EmbedderOptions, EmbeddingError, EmbeddingNotice, EmbeddingProvider, LocalEmbedder, RemoteEmbedder,
};
use crate::indexer::{IndexEvent, IndexingService, JobOutcome};
use crate::search::{SearchError, SearchOptions, SearchService, SemanticMatch};
use crate::store::{Database, LocalEmbeddingError, Note, StoreError, Table};

/// Store files live in this subdirectory of the data directory.
const STORE_DIR: &str = "store";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("search error: {0}")]
    Search(#[from] SearchError),

    #[error("note not found: {0}")]
    NotFound(String),

    #[error("indexing task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// A newer query or search took over; callers drop these silently.
    pub fn is_superseded(&self) -> bool {
        match self {
            EngineError::Embedding(err) => err.is_superseded(),
            EngineError::Search(err) => err.is_superseded(),
            _ => false,
        }
    }
}

pub struct Engine {
    config: Config,
    db: Arc<Database>,
    embedder: Arc<Embedder>,
    indexer: IndexingService,
    search: SearchService,
}

impl Engine {
    /// Open the store under the config's data directory with the configured
    /// providers. Must be called inside a tokio runtime.
    pub fn open(config: Config) -> Result<Self, EngineError> {
        let base = PathBuf::from(config.base_path());
        let db = Arc::new(Database::open(base.join(STORE_DIR))?);

        let local = LocalEmbedder::new(
            &config.embedding.model,
            base.clone(),
            Some(Duration::from_secs(config.embedding.download_timeout_secs)),
        )?;
        let remote = RemoteEmbedder::new(&config.embedding.remote, &config.embedding.model);
        log::debug!("remote fallback endpoint: {}", remote.url());

        Ok(Self::with_providers(config, db, Arc::new(local), Some(Arc::new(remote))))
    }

    /// Build an engine over an existing store and providers.
    pub fn with_providers(
        config: Config,
        db: Arc<Database>,
        local: Arc<dyn EmbeddingProvider>,
        remote: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        let embedder = Arc::new(Embedder::new(local, remote, db.clone(), EmbedderOptions::from_config(&config)));
        let indexer = IndexingService::new(db.clone(), embedder.clone(), config.indexing.chunking());
        let search = SearchService::new(
            embedder.clone(),
            db.clone(),
            SearchOptions {
                top_k: config.search.top_k,
                oversampling_factor: config.search.oversampling_factor,
                snippet_max_length: config.search.snippet_max_length,
            },
        );

        Self {
            config,
            db,
            embedder,
            indexer,
            search,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        Path::new(self.config.base_path())
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn indexer(&self) -> &IndexingService {
        &self.indexer
    }

    fn debounce(&self) -> Duration {
        Duration::from_millis(self.config.indexing.debounce_ms)
    }

    pub fn note(&self, id: &str) -> Result<Note, EngineError> {
        self.db.note(id)?.ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub fn list_notes(&self) -> Result<Vec<Note>, EngineError> {
        Ok(self.db.list_notes()?)
    }

    pub fn add_note(&self, title: Option<String>, content: String) -> Result<Note, EngineError> {
        let note = self.db.add_note(title, content)?;
        self.indexer.schedule(&note, self.debounce());
        Ok(note)
    }

    pub fn update_note(&self, id: &str, title: Option<String>, content: Option<String>) -> Result<Note, EngineError> {
        let note = self.db.update_note(id, title, content)?;
        self.indexer.schedule(&note, self.debounce());
        Ok(note)
    }

    /// Soft delete, or remove the note and everything indexed for it.
    pub fn delete_note(&self, id: &str, permanent: bool) -> Result<(), EngineError> {
        if permanent {
            self.indexer.forget(id);
            self.db.permanently_delete_note(id)?;
        } else {
            self.db.delete_note(id)?;
        }
        Ok(())
    }

    pub fn restore_note(&self, id: &str) -> Result<Note, EngineError> {
        let note = self.db.restore_note(id)?;
        self.indexer.schedule(&note, self.debounce());
        Ok(note)
    }

    /// Index one note now and wait for the outcome.
    pub async fn index_now(&self, id: &str) -> Result<JobOutcome, EngineError> {
        let note = self.note(id)?;
        self.indexer
            .flush(&note)
            .await
            .map_err(|e| EngineError::Task(e.to_string()))
    }

    /// Flush every live note and wait for all of them.
    pub async fn reindex_all(&self) -> Result<Vec<(String, JobOutcome)>, EngineError> {
        let handles: Vec<_> = self
            .db
            .list_notes()?
            .into_iter()
            .map(|note| {
                let handle = self.indexer.flush(&note);
                (note.id, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let outcome = handle.await.map_err(|e| EngineError::Task(e.to_string()))?;
            outcomes.push((id, outcome));
        }
        Ok(outcomes)
    }

    /// Ranked matches among live notes. `top_k` overrides the configured
    /// result count.
    pub async fn search(&self, query: &str, top_k: Option<usize>) -> Result<Vec<SemanticMatch>, EngineError> {
        let top_k = top_k.unwrap_or(self.search.options().top_k);
        Ok(self.search.search_top(query, top_k).await?)
    }

    /// Embed `text` as a query. `timeout` defaults to the configured query
    /// timeout.
    pub async fn embed_query(&self, text: &str, timeout: Option<Duration>) -> Result<Vec<f32>, EngineError> {
        let timeout = timeout.unwrap_or(Duration::from_millis(self.config.search.query_timeout_ms));
        Ok(self.embedder.embed_query_within(text, timeout).await?)
    }

    pub fn local_embedding_errors(&self) -> Result<Vec<LocalEmbeddingError>, EngineError> {
        Ok(self.db.local_embedding_errors()?)
    }

    pub fn clear_local_embedding_errors(&self) -> Result<usize, EngineError> {
        Ok(self
            .db
            .transaction(&[Table::LocalEmbeddingErrors], |tx| tx.clear_local_errors())?)
    }

    pub fn set_online(&self, online: bool) {
        self.embedder.set_online(online);
    }

    /// Local model loaded, or remote fallback permitted and reachable.
    pub fn is_ready(&self) -> bool {
        self.embedder.is_ready()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<EmbeddingNotice> {
        self.embedder.subscribe()
    }

    pub fn subscribe_index_events(&self) -> broadcast::Receiver<IndexEvent> {
        self.indexer.subscribe()
    }
}
