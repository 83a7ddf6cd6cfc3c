//! Notes data access.

use chrono::Utc;

use super::{Database, Note, StoreError, Table};
use crate::eid::Eid;

impl Database {
    pub fn add_note(&self, title: Option<String>, content: String) -> Result<Note, StoreError> {
        let now = Utc::now();
        let note = Note {
            id: Eid::new().to_string(),
            title: title.filter(|t| !t.is_empty()),
            content,
            deleted: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        self.transaction(&[Table::Notes], |tx| tx.put_note(note.clone()))?;
        log::debug!("added note {}", note.id);
        Ok(note)
    }

    /// Update title and/or content. Fields left as `None` are kept; an empty
    /// title clears it.
    pub fn update_note(
        &self,
        id: &str,
        title: Option<String>,
        content: Option<String>,
    ) -> Result<Note, StoreError> {
        self.transaction(&[Table::Notes], |tx| {
            let mut note = tx.note(id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if let Some(title) = title {
                note.title = Some(title).filter(|t| !t.is_empty());
            }
            if let Some(content) = content {
                note.content = content;
            }
            note.updated_at = Utc::now();
            tx.put_note(note.clone())?;
            Ok(note)
        })
    }

    /// Soft delete. Chunks and embeddings are kept so a restore is cheap.
    pub fn delete_note(&self, id: &str) -> Result<Note, StoreError> {
        self.set_deleted(id, true)
    }

    pub fn restore_note(&self, id: &str) -> Result<Note, StoreError> {
        self.set_deleted(id, false)
    }

    fn set_deleted(&self, id: &str, deleted: bool) -> Result<Note, StoreError> {
        self.transaction(&[Table::Notes], |tx| {
            let mut note = tx.note(id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let now = Utc::now();
            note.deleted = deleted;
            note.deleted_at = deleted.then_some(now);
            note.updated_at = now;
            tx.put_note(note.clone())?;
            Ok(note)
        })
    }

    /// Remove a note with its chunks, embeddings (all models) and cursor row.
    pub fn permanently_delete_note(&self, id: &str) -> Result<(), StoreError> {
        let scope = [Table::Notes, Table::Chunks, Table::Embeddings, Table::NoteHashes];
        self.transaction(&scope, |tx| {
            tx.delete_note(id)?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let chunk_ids = tx.delete_chunks_for_note(id)?;
            tx.delete_embeddings_for_chunks(&chunk_ids)?;
            tx.delete_embeddings_for_note(id)?;
            tx.delete_note_hash(id)?;
            log::debug!("permanently deleted note {id} with {} chunks", chunk_ids.len());
            Ok(())
        })
    }
}
