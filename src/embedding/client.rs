use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::protocol::{ChunkVector, EmbedItem, EmbedRequest, EmbedResponse};
use super::worker::{spawn_worker, WorkerHandle, WorkerReply};
use super::{EmbeddingError, EmbeddingProvider};

/// Versioned front of an embedding worker.
///
/// Chunk results older than the latest version issued for their note come
/// back as `Ok(None)`. Each query gets a fresh version; an older query that
/// is overtaken resolves to `EmbeddingError::QuerySuperseded`.
pub struct EmbeddingClient {
    worker: WorkerHandle,
    provider: Arc<dyn EmbeddingProvider>,
    model_id: String,
    next_query: AtomicU64,
}

impl EmbeddingClient {
    /// Spawns the worker; call inside a tokio runtime.
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            worker: spawn_worker(provider.clone()),
            model_id: provider.model_id().to_string(),
            provider,
            next_query: AtomicU64::new(0),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_ready(&self) -> bool {
        self.provider.is_ready()
    }

    pub async fn embed_chunks(
        &self,
        note_id: &str,
        version: u64,
        items: Vec<EmbedItem>,
        timeout: Duration,
    ) -> Result<Option<Vec<ChunkVector>>, EmbeddingError> {
        let request = EmbedRequest::EmbedChunks {
            note_id: note_id.to_string(),
            version,
            model_id: self.model_id.clone(),
            items,
        };

        match self.round_trip(request, timeout).await? {
            WorkerReply::Superseded => Ok(None),
            WorkerReply::Response(EmbedResponse::ChunksResult {
                note_id,
                version,
                vectors,
            }) => {
                if self.worker.book().is_latest_note(&note_id, version) {
                    Ok(Some(vectors))
                } else {
                    log::debug!("discarding superseded vectors for note {note_id} v{version}");
                    Ok(None)
                }
            }
            WorkerReply::Response(EmbedResponse::Error { message, .. }) => Err(EmbeddingError::Failed(message)),
            WorkerReply::Response(other) => Err(unexpected(&other)),
        }
    }

    pub async fn embed_query(&self, text: &str, timeout: Duration) -> Result<Vec<f32>, EmbeddingError> {
        let version = self.next_query.fetch_add(1, Ordering::SeqCst) + 1;
        let request = EmbedRequest::EmbedQuery {
            version,
            model_id: self.model_id.clone(),
            text: text.to_string(),
        };

        match self.round_trip(request, timeout).await? {
            WorkerReply::Superseded => Err(EmbeddingError::QuerySuperseded),
            WorkerReply::Response(EmbedResponse::QueryResult { version, vector }) => {
                if self.worker.book().is_latest_query(version) {
                    Ok(vector)
                } else {
                    Err(EmbeddingError::QuerySuperseded)
                }
            }
            WorkerReply::Response(EmbedResponse::Error { message, .. }) => Err(EmbeddingError::Failed(message)),
            WorkerReply::Response(other) => Err(unexpected(&other)),
        }
    }

    /// Submit and wait. Expiry abandons the wait only; the worker finishes
    /// and its answer is dropped.
    async fn round_trip(&self, request: EmbedRequest, timeout: Duration) -> Result<WorkerReply, EmbeddingError> {
        let rx = self.worker.submit(request)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(EmbeddingError::Worker("embedding worker dropped the request".to_string())),
            Err(_) => Err(EmbeddingError::Timeout {
                ms: timeout.as_millis() as u64,
            }),
        }
    }
}

fn unexpected(response: &EmbedResponse) -> EmbeddingError {
    EmbeddingError::Worker(format!("unexpected worker response: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Blocks each call until the test releases it.
    struct Gated {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl EmbeddingProvider for Gated {
        fn model_id(&self) -> &str {
            "gated"
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let _ = self.gate.lock().unwrap().recv();
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct Instant;

    impl EmbeddingProvider for Instant {
        fn model_id(&self) -> &str {
            "instant"
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().map(|_| vec![0.0, 1.0]).collect())
        }
    }

    struct Failing;

    impl EmbeddingProvider for Failing {
        fn model_id(&self) -> &str {
            "failing"
        }

        fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Failed("no backend".to_string()))
        }
    }

    fn items(texts: &[&str]) -> Vec<EmbedItem> {
        texts
            .iter()
            .map(|t| EmbedItem {
                chunk_id: format!("n:{t}"),
                text: t.to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_embed_chunks_returns_vectors() {
        let client = EmbeddingClient::new(Arc::new(Instant));
        assert_eq!(client.model_id(), "instant");

        let vectors = client
            .embed_chunks("n", 1, items(&["a", "b"]), Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1].chunk_id, "n:b");
    }

    #[tokio::test]
    async fn test_stale_chunk_result_is_discarded() {
        let (release, gate) = std::sync::mpsc::channel();
        let client = Arc::new(EmbeddingClient::new(Arc::new(Gated {
            gate: Mutex::new(gate),
        })));

        let first = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .embed_chunks("n", 1, items(&["old"]), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .embed_chunks("n", 2, items(&["new"]), Duration::from_secs(5))
                    .await
            })
        };

        release.send(()).unwrap();
        release.send(()).unwrap();

        assert!(first.await.unwrap().unwrap().is_none());
        assert!(second.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_older_query_is_superseded() {
        let (release, gate) = std::sync::mpsc::channel();
        let client = Arc::new(EmbeddingClient::new(Arc::new(Gated {
            gate: Mutex::new(gate),
        })));

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.embed_query("first", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.embed_query("second", Duration::from_secs(5)).await })
        };

        release.send(()).unwrap();
        release.send(()).unwrap();

        assert!(first.await.unwrap().unwrap_err().is_superseded());
        assert_eq!(second.await.unwrap().unwrap(), vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_query_timeout() {
        let (release, gate) = std::sync::mpsc::channel();
        let client = EmbeddingClient::new(Arc::new(Gated {
            gate: Mutex::new(gate),
        }));

        let err = client
            .embed_query("slow", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::Timeout { ms: 30 }));
        release.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_provider_failure_is_reported() {
        let client = EmbeddingClient::new(Arc::new(Failing));
        let err = client
            .embed_chunks("n", 1, items(&["a"]), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::Failed(ref msg) if msg.contains("no backend")));
    }
}
