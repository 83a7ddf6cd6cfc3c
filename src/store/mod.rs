//! Persisted tables with unit-of-work transactions.
//!
//! # Architecture
//!
//! - `models`: row types
//! - `vectors`: binary codec for the embeddings table
//! - `notes`: notes data-access operations
//!
//! All five tables live in memory behind one lock. A transaction declares the
//! tables it touches, works on staged copies of exactly those tables, persists
//! them and only then swaps them in. A failed closure or a failed write leaves
//! every table as it was.

mod models;
mod notes;
pub mod vectors;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::storage::{BackendLocal, StorageManager};

pub use models::{Chunk, Embedding, EmbeddingErrorKind, LocalEmbeddingError, Note, NoteHash};
pub use vectors::VectorFileError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("embeddings file: {0}")]
    VectorFile(#[from] VectorFileError),

    #[error("table {0:?} is not part of this transaction")]
    OutOfScope(Table),

    #[error("note not found: {0}")]
    NotFound(String),

    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Notes,
    NoteHashes,
    Chunks,
    Embeddings,
    LocalEmbeddingErrors,
}

impl Table {
    fn file_name(&self) -> &'static str {
        match self {
            Table::Notes => "notes.json",
            Table::NoteHashes => "note_hashes.json",
            Table::Chunks => "chunks.json",
            Table::Embeddings => vectors::EMBEDDINGS_FILE,
            Table::LocalEmbeddingErrors => "local_embedding_errors.json",
        }
    }
}

type EmbeddingKey = (String, String);

#[derive(Debug, Default, Clone)]
struct Tables {
    notes: BTreeMap<String, Note>,
    note_hashes: BTreeMap<String, NoteHash>,
    chunks: BTreeMap<String, Chunk>,
    /// Keyed by `(chunk_id, model_id)`.
    embeddings: BTreeMap<EmbeddingKey, Embedding>,
    local_embedding_errors: BTreeMap<String, LocalEmbeddingError>,
}

/// Staged copies of the tables declared by a transaction.
#[derive(Default)]
pub struct Transaction {
    notes: Option<BTreeMap<String, Note>>,
    note_hashes: Option<BTreeMap<String, NoteHash>>,
    chunks: Option<BTreeMap<String, Chunk>>,
    embeddings: Option<BTreeMap<EmbeddingKey, Embedding>>,
    local_embedding_errors: Option<BTreeMap<String, LocalEmbeddingError>>,
}

macro_rules! staged {
    ($self:ident, $field:ident, $table:expr) => {
        $self.$field.as_mut().ok_or(StoreError::OutOfScope($table))
    };
}

impl Transaction {
    fn stage(tables: &Tables, scope: &[Table]) -> Self {
        let mut tx = Transaction::default();
        for table in scope {
            match table {
                Table::Notes => tx.notes = Some(tables.notes.clone()),
                Table::NoteHashes => tx.note_hashes = Some(tables.note_hashes.clone()),
                Table::Chunks => tx.chunks = Some(tables.chunks.clone()),
                Table::Embeddings => tx.embeddings = Some(tables.embeddings.clone()),
                Table::LocalEmbeddingErrors => {
                    tx.local_embedding_errors = Some(tables.local_embedding_errors.clone())
                }
            }
        }
        tx
    }

    fn apply(self, tables: &mut Tables) {
        if let Some(notes) = self.notes {
            tables.notes = notes;
        }
        if let Some(note_hashes) = self.note_hashes {
            tables.note_hashes = note_hashes;
        }
        if let Some(chunks) = self.chunks {
            tables.chunks = chunks;
        }
        if let Some(embeddings) = self.embeddings {
            tables.embeddings = embeddings;
        }
        if let Some(errors) = self.local_embedding_errors {
            tables.local_embedding_errors = errors;
        }
    }

    pub fn note(&mut self, id: &str) -> Result<Option<Note>, StoreError> {
        Ok(staged!(self, notes, Table::Notes)?.get(id).cloned())
    }

    pub fn put_note(&mut self, note: Note) -> Result<(), StoreError> {
        staged!(self, notes, Table::Notes)?.insert(note.id.clone(), note);
        Ok(())
    }

    pub fn delete_note(&mut self, id: &str) -> Result<Option<Note>, StoreError> {
        Ok(staged!(self, notes, Table::Notes)?.remove(id))
    }

    /// Merge fields into the note's cursor row, creating it when missing.
    pub fn update_note_hash<F>(&mut self, note_id: &str, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut NoteHash),
    {
        let row = staged!(self, note_hashes, Table::NoteHashes)?
            .entry(note_id.to_string())
            .or_insert_with(|| NoteHash::new(note_id));
        update(row);
        Ok(())
    }

    pub fn delete_note_hash(&mut self, note_id: &str) -> Result<(), StoreError> {
        staged!(self, note_hashes, Table::NoteHashes)?.remove(note_id);
        Ok(())
    }

    pub fn bulk_put_chunks(&mut self, chunks: Vec<Chunk>) -> Result<(), StoreError> {
        let table = staged!(self, chunks, Table::Chunks)?;
        for chunk in chunks {
            table.insert(chunk.id.clone(), chunk);
        }
        Ok(())
    }

    pub fn bulk_delete_chunks(&mut self, ids: &[String]) -> Result<(), StoreError> {
        let table = staged!(self, chunks, Table::Chunks)?;
        for id in ids {
            table.remove(id);
        }
        Ok(())
    }

    /// Remove every chunk of a note, returning the removed ids.
    pub fn delete_chunks_for_note(&mut self, note_id: &str) -> Result<Vec<String>, StoreError> {
        let table = staged!(self, chunks, Table::Chunks)?;
        let ids: Vec<String> = table
            .values()
            .filter(|chunk| chunk.note_id == note_id)
            .map(|chunk| chunk.id.clone())
            .collect();
        for id in &ids {
            table.remove(id);
        }
        Ok(ids)
    }

    pub fn bulk_put_embeddings(&mut self, embeddings: Vec<Embedding>) -> Result<(), StoreError> {
        let table = staged!(self, embeddings, Table::Embeddings)?;
        for embedding in embeddings {
            table.insert(
                (embedding.chunk_id.clone(), embedding.model_id.clone()),
                embedding,
            );
        }
        Ok(())
    }

    /// Remove embeddings of the given chunks under every model.
    pub fn delete_embeddings_for_chunks(&mut self, chunk_ids: &[String]) -> Result<usize, StoreError> {
        let table = staged!(self, embeddings, Table::Embeddings)?;
        let before = table.len();
        table.retain(|(chunk_id, _), _| !chunk_ids.contains(chunk_id));
        Ok(before - table.len())
    }

    pub fn delete_embeddings_for_note(&mut self, note_id: &str) -> Result<usize, StoreError> {
        let table = staged!(self, embeddings, Table::Embeddings)?;
        let before = table.len();
        table.retain(|_, embedding| embedding.note_id != note_id);
        Ok(before - table.len())
    }

    pub fn add_local_error(&mut self, error: LocalEmbeddingError) -> Result<(), StoreError> {
        staged!(self, local_embedding_errors, Table::LocalEmbeddingErrors)?.insert(error.id.clone(), error);
        Ok(())
    }

    pub fn clear_local_errors(&mut self) -> Result<usize, StoreError> {
        let table = staged!(self, local_embedding_errors, Table::LocalEmbeddingErrors)?;
        let count = table.len();
        table.clear();
        Ok(count)
    }
}

pub struct Database {
    tables: RwLock<Tables>,
    storage: Option<BackendLocal>,
}

impl Database {
    /// A database that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            storage: None,
        }
    }

    /// Open (or create) a database persisted under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage = BackendLocal::new(dir)?;

        let notes: Vec<Note> = load_json(&storage, Table::Notes)?;
        let note_hashes: Vec<NoteHash> = load_json(&storage, Table::NoteHashes)?;
        let chunks: Vec<Chunk> = load_json(&storage, Table::Chunks)?;
        let errors: Vec<LocalEmbeddingError> = load_json(&storage, Table::LocalEmbeddingErrors)?;
        let embeddings = if storage.exists(vectors::EMBEDDINGS_FILE) {
            vectors::decode(&storage.read(vectors::EMBEDDINGS_FILE)?)?
        } else {
            Vec::new()
        };

        let tables = Tables {
            notes: notes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            note_hashes: note_hashes.into_iter().map(|h| (h.note_id.clone(), h)).collect(),
            chunks: chunks.into_iter().map(|c| (c.id.clone(), c)).collect(),
            embeddings: embeddings
                .into_iter()
                .map(|e| ((e.chunk_id.clone(), e.model_id.clone()), e))
                .collect(),
            local_embedding_errors: errors.into_iter().map(|e| (e.id.clone(), e)).collect(),
        };

        log::debug!(
            "opened store at {:?}: {} notes, {} chunks, {} embeddings",
            storage.base_dir,
            tables.notes.len(),
            tables.chunks.len(),
            tables.embeddings.len()
        );

        Ok(Self {
            tables: RwLock::new(tables),
            storage: Some(storage),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables.write().map_err(|_| StoreError::Poisoned)
    }

    /// Run `f` against staged copies of `scope`; all-or-nothing.
    pub fn transaction<T, F>(&self, scope: &[Table], f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Transaction) -> Result<T, StoreError>,
    {
        let mut tables = self.write()?;
        let mut tx = Transaction::stage(&tables, scope);
        let value = f(&mut tx)?;

        if let Some(storage) = &self.storage {
            persist(storage, &tx, &tables)?;
        }
        tx.apply(&mut tables);

        Ok(value)
    }

    pub fn note(&self, id: &str) -> Result<Option<Note>, StoreError> {
        Ok(self.read()?.notes.get(id).cloned())
    }

    /// Live (not soft-deleted) notes, most recently updated first.
    pub fn list_notes(&self) -> Result<Vec<Note>, StoreError> {
        let tables = self.read()?;
        let mut notes: Vec<Note> = tables.notes.values().filter(|n| !n.deleted).cloned().collect();
        notes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(notes)
    }

    /// Ids of soft-deleted notes.
    pub fn deleted_note_ids(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .read()?
            .notes
            .values()
            .filter(|n| n.deleted)
            .map(|n| n.id.clone())
            .collect())
    }

    pub fn note_hash(&self, note_id: &str) -> Result<Option<NoteHash>, StoreError> {
        Ok(self.read()?.note_hashes.get(note_id).cloned())
    }

    /// Chunks of a note ordered by `order`.
    pub fn chunks_for_note(&self, note_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let tables = self.read()?;
        let mut chunks: Vec<Chunk> = tables
            .chunks
            .values()
            .filter(|c| c.note_id == note_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.order);
        Ok(chunks)
    }

    /// Bulk get; missing ids yield `None` at their position.
    pub fn chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Option<Chunk>>, StoreError> {
        let tables = self.read()?;
        Ok(ids.iter().map(|id| tables.chunks.get(id).cloned()).collect())
    }

    /// Visit every embedding stored under `model_id`.
    pub fn scan_embeddings<F>(&self, model_id: &str, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(&Embedding),
    {
        let tables = self.read()?;
        tables
            .embeddings
            .values()
            .filter(|e| e.model_id == model_id)
            .for_each(|e| visit(e));
        Ok(())
    }

    pub fn has_embedding(&self, chunk_id: &str, model_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .read()?
            .embeddings
            .contains_key(&(chunk_id.to_string(), model_id.to_string())))
    }

    pub fn embedding_count(&self, model_id: &str) -> Result<usize, StoreError> {
        Ok(self.read()?.embeddings.values().filter(|e| e.model_id == model_id).count())
    }

    /// Recorded local embedding failures, oldest first.
    pub fn local_embedding_errors(&self) -> Result<Vec<LocalEmbeddingError>, StoreError> {
        let tables = self.read()?;
        let mut errors: Vec<LocalEmbeddingError> = tables.local_embedding_errors.values().cloned().collect();
        errors.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(errors)
    }
}

fn load_json<T: DeserializeOwned>(storage: &BackendLocal, table: Table) -> Result<Vec<T>, StoreError> {
    let name = table.file_name();
    if !storage.exists(name) {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&storage.read(name)?)?)
}

fn write_json<'a, T, I>(storage: &BackendLocal, table: Table, rows: I) -> Result<(), StoreError>
where
    T: Serialize + 'a,
    I: Iterator<Item = &'a T>,
{
    let rows: Vec<&T> = rows.collect();
    storage.write(table.file_name(), &serde_json::to_vec_pretty(&rows)?)?;
    Ok(())
}

/// Write order for a transaction's files. Chunks precede their embeddings and
/// the note cursors go last, so a cursor on disk never describes rows that
/// are not.
const PERSIST_ORDER: [Table; 5] = [
    Table::Notes,
    Table::LocalEmbeddingErrors,
    Table::Chunks,
    Table::Embeddings,
    Table::NoteHashes,
];

fn write_table(storage: &BackendLocal, tx: &Transaction, table: Table) -> Result<bool, StoreError> {
    match table {
        Table::Notes => match &tx.notes {
            Some(notes) => write_json(storage, table, notes.values())?,
            None => return Ok(false),
        },
        Table::NoteHashes => match &tx.note_hashes {
            Some(note_hashes) => write_json(storage, table, note_hashes.values())?,
            None => return Ok(false),
        },
        Table::Chunks => match &tx.chunks {
            Some(chunks) => write_json(storage, table, chunks.values())?,
            None => return Ok(false),
        },
        Table::LocalEmbeddingErrors => match &tx.local_embedding_errors {
            Some(errors) => write_json(storage, table, errors.values())?,
            None => return Ok(false),
        },
        Table::Embeddings => match &tx.embeddings {
            Some(embeddings) => storage.write(table.file_name(), &vectors::encode(embeddings.values())?)?,
            None => return Ok(false),
        },
    }
    Ok(true)
}

/// Write every staged table. When one write fails, the files already written
/// are restored from `committed`.
fn persist(storage: &BackendLocal, tx: &Transaction, committed: &Tables) -> Result<(), StoreError> {
    let mut written = Vec::new();
    for table in PERSIST_ORDER {
        match write_table(storage, tx, table) {
            Ok(true) => written.push(table),
            Ok(false) => {}
            Err(err) => {
                rollback(storage, committed, &written);
                return Err(err);
            }
        }
    }
    Ok(())
}

fn rollback(storage: &BackendLocal, committed: &Tables, written: &[Table]) {
    if written.is_empty() {
        return;
    }
    let previous = Transaction::stage(committed, written);
    for table in written.iter().rev() {
        if let Err(err) = write_table(storage, &previous, *table) {
            log::error!("failed to restore {} after an aborted write: {err}", table.file_name());
        }
    }
}
