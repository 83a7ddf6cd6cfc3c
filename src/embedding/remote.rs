//! Remote feature-extraction provider, the fallback when local embedding fails.

use std::time::Duration;

use once_cell::sync::OnceCell;
use serde_json::{json, Value};

use super::{l2_normalize, EmbeddingError, EmbeddingProvider};
use crate::config::RemoteEmbeddingConfig;

pub struct RemoteEmbedder {
    url: String,
    token: Option<String>,
    model_id: String,
    timeout: Duration,
    /// Built on first request, which always runs on a blocking thread.
    client: OnceCell<reqwest::blocking::Client>,
}

impl RemoteEmbedder {
    /// `model_id` is the id stored with the returned vectors; it is the
    /// configured embedding model, not the remote model path.
    pub fn new(config: &RemoteEmbeddingConfig, model_id: &str) -> Self {
        let endpoint = config.endpoint.strip_suffix('/').unwrap_or(&config.endpoint);
        let url = format!("{}/{}/pipeline/feature-extraction", endpoint, config.model);

        Self {
            url,
            token: std::env::var(&config.token_env).ok().filter(|t| !t.is_empty()),
            model_id: model_id.to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            client: OnceCell::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, EmbeddingError> {
        self.client.get_or_try_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| EmbeddingError::Remote(e.to_string()))
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn feature_extraction(&self, inputs: Value) -> Result<Value, EmbeddingError> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| EmbeddingError::Remote("API token is not set".to_string()))?;

        log::debug!("POST {}", self.url);
        let response = self
            .client()?
            .post(&self.url)
            .bearer_auth(token)
            .json(&json!({ "inputs": inputs }))
            .send()
            .map_err(|e| EmbeddingError::Remote(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| EmbeddingError::Remote(e.to_string()))?;
        if !status.is_success() {
            log::error!("feature extraction failed with {status}: {text}");
            return Err(EmbeddingError::Remote(format!("{status}: {text}")));
        }

        serde_json::from_str(&text).map_err(|err| {
            log::error!("{err}. tried to parse: {text:?}");
            EmbeddingError::Remote(err.to_string())
        })
    }
}

impl EmbeddingProvider for RemoteEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let output = self.feature_extraction(json!(texts))?;
        match output.as_array() {
            Some(items) if items.len() == texts.len() => items.iter().map(coerce_vector).collect(),
            _ => {
                // Some endpoints answer a batch with a single vector.
                log::warn!("batched feature extraction returned an unexpected shape, retrying per item");
                texts
                    .iter()
                    .map(|text| coerce_vector(&self.feature_extraction(json!(text))?))
                    .collect()
            }
        }
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        coerce_vector(&self.feature_extraction(json!(text))?)
    }

    fn is_ready(&self) -> bool {
        self.token.is_some()
    }
}

/// Average token embeddings into one vector.
pub fn mean_pool(token_embeddings: &[Vec<f32>]) -> Vec<f32> {
    let Some(dims) = token_embeddings.first().map(Vec::len) else {
        return vec![];
    };

    let mut sum = vec![0.0f32; dims];
    for token in token_embeddings {
        for (acc, value) in sum.iter_mut().zip(token.iter()) {
            *acc += value;
        }
    }

    let inv = 1.0 / token_embeddings.len() as f32;
    sum.iter_mut().for_each(|v| *v *= inv);
    sum
}

/// Turn a feature-extraction answer into one normalised vector.
///
/// A flat number array is already pooled; a 2-D array holds token
/// embeddings and gets mean-pooled.
pub fn coerce_vector(output: &Value) -> Result<Vec<f32>, EmbeddingError> {
    let items = output
        .as_array()
        .ok_or_else(|| EmbeddingError::Remote("Unexpected embedding output type".to_string()))?;

    let Some(first) = items.first() else {
        return Ok(vec![]);
    };

    if first.is_number() {
        return Ok(l2_normalize(numbers(items)?));
    }

    if first.as_array().and_then(|row| row.first()).is_some_and(Value::is_number) {
        let tokens = items
            .iter()
            .map(|row| {
                row.as_array()
                    .ok_or_else(|| EmbeddingError::Remote("Unexpected embedding output shape".to_string()))
                    .and_then(|row| numbers(row))
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(l2_normalize(mean_pool(&tokens)));
    }

    Err(EmbeddingError::Remote("Unexpected embedding output shape".to_string()))
}

fn numbers(values: &[Value]) -> Result<Vec<f32>, EmbeddingError> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingError::Remote("Non-numeric embedding value".to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_flat_vector_is_normalized() {
        let v = coerce_vector(&json!([3.0, 4.0])).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_coerce_token_embeddings_are_mean_pooled() {
        let v = coerce_vector(&json!([[1.0, 0.0], [3.0, 0.0]])).unwrap();
        assert_eq!(v, vec![1.0, 0.0]);
    }

    #[test]
    fn test_coerce_rejects_bad_shapes() {
        assert!(coerce_vector(&json!({"error": "loading"})).is_err());
        assert!(coerce_vector(&json!(["a", "b"])).is_err());
        assert!(coerce_vector(&json!([[1.0], "x"])).is_err());
        assert!(coerce_vector(&json!([])).unwrap().is_empty());
    }

    #[test]
    fn test_mean_pool() {
        assert!(mean_pool(&[]).is_empty());
        assert_eq!(mean_pool(&[vec![2.0, 4.0], vec![4.0, 8.0]]), vec![3.0, 6.0]);
    }

    #[test]
    fn test_url_and_missing_token() {
        let config = RemoteEmbeddingConfig {
            endpoint: "https://example.invalid/models/".to_string(),
            model: "org/model".to_string(),
            token_env: "MNEMOS_TEST_TOKEN_THAT_IS_NOT_SET".to_string(),
            timeout_secs: 1,
        };
        let remote = RemoteEmbedder::new(&config, "local-model");

        assert_eq!(
            remote.url(),
            "https://example.invalid/models/org/model/pipeline/feature-extraction"
        );
        assert_eq!(remote.model_id(), "local-model");
        assert!(!remote.is_ready());
        assert!(matches!(
            remote.embed(&["x".to_string()]),
            Err(EmbeddingError::Remote(_))
        ));
    }
}
