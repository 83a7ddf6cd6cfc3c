use std::collections::{HashMap, HashSet};

use chrono::Utc;

use super::{IndexError, Inner, Job, JobOutcome, PendingEmbed};
use crate::chunking::{chunk_in_background, ChunkingRequest};
use crate::embedding::EmbedItem;
use crate::store::{Chunk, Embedding, NoteHash, Table};

/// Chunks whose vectors must be (re)computed for the active model.
///
/// With a changed model every chunk qualifies. Otherwise a chunk qualifies
/// when it is new, its hash changed, or it has no stored vector.
pub fn chunks_to_embed<'a>(
    chunks: &'a [Chunk],
    previous: &HashMap<String, Chunk>,
    embedded: &HashSet<String>,
    model_changed: bool,
) -> Vec<&'a Chunk> {
    chunks
        .iter()
        .filter(|chunk| {
            model_changed
                || previous.get(&chunk.id).map_or(true, |prev| prev.hash != chunk.hash)
                || !embedded.contains(&chunk.id)
        })
        .collect()
}

impl Inner {
    pub(super) async fn index(&self, job: &Job) -> Result<JobOutcome, IndexError> {
        let chunked = chunk_in_background(ChunkingRequest {
            note_id: job.note_id.clone(),
            version: job.version,
            title: job.title.clone(),
            content: job.content.clone(),
            settings: self.settings,
        })
        .await?;

        if !self.is_current(&job.note_id, job.version) {
            return Ok(JobOutcome::Superseded);
        }

        let model_id = self.embedder.model_id().to_string();
        let cursor = self
            .db
            .note_hash(&job.note_id)?
            .unwrap_or_else(|| NoteHash::new(&job.note_id));
        if cursor.is_current(&chunked.content_hash, &model_id) {
            log::debug!("note {} is up to date", job.note_id);
            return Ok(JobOutcome::UpToDate);
        }

        let previous: HashMap<String, Chunk> = self
            .db
            .chunks_for_note(&job.note_id)?
            .into_iter()
            .map(|chunk| (chunk.id.clone(), chunk))
            .collect();

        let mut chunks_written = 0;
        if cursor.last_indexed_hash.as_deref() != Some(chunked.content_hash.as_str()) {
            let kept: HashSet<&str> = chunked.chunks.iter().map(|c| c.id.as_str()).collect();
            let removed: Vec<String> = previous
                .keys()
                .filter(|id| !kept.contains(id.as_str()))
                .cloned()
                .collect();

            let applied = self
                .db
                .transaction(&[Table::Chunks, Table::Embeddings, Table::NoteHashes], |tx| {
                    if !self.is_current(&job.note_id, job.version) {
                        return Ok(false);
                    }
                    tx.bulk_delete_chunks(&removed)?;
                    tx.delete_embeddings_for_chunks(&removed)?;
                    tx.bulk_put_chunks(chunked.chunks.clone())?;
                    tx.update_note_hash(&job.note_id, |row| {
                        row.last_indexed_hash = Some(chunked.content_hash.clone());
                        row.indexed_at = Some(Utc::now());
                    })?;
                    Ok(true)
                })?;
            if !applied {
                return Ok(JobOutcome::Superseded);
            }

            chunks_written = chunked.chunks.len();
            log::debug!(
                "note {}: wrote {chunks_written} chunks, removed {}",
                job.note_id,
                removed.len()
            );
        }

        let mut embedded = HashSet::new();
        for chunk in &chunked.chunks {
            if self.db.has_embedding(&chunk.id, &model_id)? {
                embedded.insert(chunk.id.clone());
            }
        }
        let model_changed = cursor.last_embedding_model_id.as_deref() != Some(model_id.as_str());
        let items: Vec<EmbedItem> = chunks_to_embed(&chunked.chunks, &previous, &embedded, model_changed)
            .into_iter()
            .map(|chunk| EmbedItem {
                chunk_id: chunk.id.clone(),
                text: chunk.text.clone(),
            })
            .collect();

        let marker = PendingEmbed {
            version: job.version,
            content_hash: chunked.content_hash.clone(),
        };

        if items.is_empty() {
            let applied = self.db.transaction(&[Table::NoteHashes], |tx| {
                if !self.is_current(&job.note_id, job.version) {
                    return Ok(false);
                }
                tx.update_note_hash(&job.note_id, |row| mark_embedded(row, &marker, &model_id))?;
                Ok(true)
            })?;

            return Ok(if applied {
                JobOutcome::Indexed {
                    chunks_written,
                    embedded: 0,
                    route: None,
                }
            } else {
                JobOutcome::Superseded
            });
        }

        if !self.set_pending(&job.note_id, marker.clone()) {
            return Ok(JobOutcome::Superseded);
        }

        let count = items.len();
        let outcome = match self.embedder.embed_chunks(&job.note_id, job.version, items).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return Ok(JobOutcome::Superseded),
            Err(err) => {
                self.clear_pending(&job.note_id, &marker);
                return Err(err.into());
            }
        };

        let rows: Vec<Embedding> = outcome
            .vectors
            .into_iter()
            .map(|cv| Embedding {
                chunk_id: cv.chunk_id,
                note_id: job.note_id.clone(),
                model_id: model_id.clone(),
                vector: cv.vector,
            })
            .collect();

        let applied = self
            .db
            .transaction(&[Table::Embeddings, Table::NoteHashes], |tx| {
                if !self.pending_matches(&job.note_id, &marker) {
                    return Ok(false);
                }
                tx.bulk_put_embeddings(rows)?;
                tx.update_note_hash(&job.note_id, |row| mark_embedded(row, &marker, &model_id))?;
                Ok(true)
            })?;
        self.clear_pending(&job.note_id, &marker);

        if !applied {
            return Ok(JobOutcome::Superseded);
        }

        Ok(JobOutcome::Indexed {
            chunks_written,
            embedded: count,
            route: Some(outcome.route),
        })
    }

    /// Record the embed marker if the job is still current.
    fn set_pending(&self, note_id: &str, marker: PendingEmbed) -> bool {
        let mut states = self.states();
        match states.get_mut(note_id) {
            Some(state) if state.version == marker.version => {
                state.pending_embed = Some(marker);
                true
            }
            _ => false,
        }
    }

    fn pending_matches(&self, note_id: &str, marker: &PendingEmbed) -> bool {
        self.states().get(note_id).is_some_and(|state| {
            state.version == marker.version && state.pending_embed.as_ref() == Some(marker)
        })
    }

    fn clear_pending(&self, note_id: &str, marker: &PendingEmbed) {
        let mut states = self.states();
        if let Some(state) = states.get_mut(note_id) {
            if state.pending_embed.as_ref() == Some(marker) {
                state.pending_embed = None;
            }
        }
    }
}

fn mark_embedded(row: &mut NoteHash, marker: &PendingEmbed, model_id: &str) {
    row.last_embedded_hash = Some(marker.content_hash.clone());
    row.last_embedding_model_id = Some(model_id.to_string());
    row.embedded_at = Some(Utc::now());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, hash: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            note_id: "n".to_string(),
            order: 0,
            text: id.to_string(),
            hash: hash.to_string(),
        }
    }

    fn ids(chunks: Vec<&Chunk>) -> Vec<&str> {
        chunks.into_iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_only_new_changed_or_missing_chunks_are_embedded() {
        let chunks = vec![chunk("same", "h1"), chunk("changed", "h2"), chunk("new", "h3"), chunk("lost", "h4")];
        let previous: HashMap<String, Chunk> = [chunk("same", "h1"), chunk("changed", "old"), chunk("lost", "h4")]
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        let embedded: HashSet<String> = ["same", "changed"].iter().map(|s| s.to_string()).collect();

        assert_eq!(
            ids(chunks_to_embed(&chunks, &previous, &embedded, false)),
            vec!["changed", "new", "lost"]
        );
    }

    #[test]
    fn test_model_change_embeds_everything() {
        let chunks = vec![chunk("a", "h1"), chunk("b", "h2")];
        let previous: HashMap<String, Chunk> = chunks.iter().map(|c| (c.id.clone(), c.clone())).collect();
        let embedded: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();

        assert!(chunks_to_embed(&chunks, &previous, &embedded, false).is_empty());
        assert_eq!(ids(chunks_to_embed(&chunks, &previous, &embedded, true)), vec!["a", "b"]);
    }
}
