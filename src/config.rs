use serde::{Deserialize, Serialize};

use crate::chunking::ChunkingSettings;
use crate::storage::{self, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

/// Default embedding model; its id is stored on every embedding row.
const DEFAULT_EMBEDDING_MODEL: &str = "bge-small-en-v1.5";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CHUNK_TIMEOUT_MS: u64 = 120_000;

const DEFAULT_REMOTE_ENDPOINT: &str = "https://router.huggingface.co/hf-inference/models";
const DEFAULT_REMOTE_MODEL: &str = "BAAI/bge-small-en-v1.5";
const DEFAULT_REMOTE_TOKEN_ENV: &str = "HF_API_TOKEN";
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 60;

const DEFAULT_TARGET_CHARS: usize = 800;
const DEFAULT_MAX_CHARS: usize = 1200;
const DEFAULT_DEBOUNCE_MS: u64 = 1000;

const DEFAULT_TOP_K: usize = 12;
const DEFAULT_OVERSAMPLING_FACTOR: usize = 2;
const DEFAULT_SNIPPET_MAX_LENGTH: usize = 240;
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;

pub const ENV_TOP_K: &str = "MNEMOS_TOP_K";
pub const ENV_OVERSAMPLING_FACTOR: &str = "MNEMOS_OVERSAMPLING_FACTOR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file is not valid utf8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where embeddings may be computed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingHost {
    #[default]
    LocalOnly,
    AllowFallback,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteEmbeddingConfig {
    #[serde(default = "default_remote_endpoint")]
    pub endpoint: String,

    /// Model path on the inference endpoint
    #[serde(default = "default_remote_model")]
    pub model: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_remote_token_env")]
    pub token_env: String,

    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteEmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_remote_endpoint(),
            model: default_remote_model(),
            token_env: default_remote_token_env(),
            timeout_secs: DEFAULT_REMOTE_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default)]
    pub host: EmbeddingHost,

    /// Suppress notices for failures that the remote fallback recovered from
    #[serde(default)]
    pub dismiss_error_messages: bool,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Deadline for one chunk embedding round-trip
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,

    #[serde(default)]
    pub remote: RemoteEmbeddingConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            host: EmbeddingHost::default(),
            dismiss_error_messages: false,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            chunk_timeout_ms: DEFAULT_CHUNK_TIMEOUT_MS,
            remote: RemoteEmbeddingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_target_chars")]
    pub target_chars: usize,

    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Delay between an edit and its indexing job
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            target_chars: DEFAULT_TARGET_CHARS,
            max_chars: DEFAULT_MAX_CHARS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl IndexingConfig {
    pub fn chunking(&self) -> ChunkingSettings {
        ChunkingSettings {
            target_chars: self.target_chars,
            max_chars: self.max_chars,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_oversampling_factor")]
    pub oversampling_factor: usize,

    #[serde(default = "default_snippet_max_length")]
    pub snippet_max_length: usize,

    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            oversampling_factor: DEFAULT_OVERSAMPLING_FACTOR,
            snippet_max_length: DEFAULT_SNIPPET_MAX_LENGTH,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
        }
    }
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_chunk_timeout_ms() -> u64 {
    DEFAULT_CHUNK_TIMEOUT_MS
}

fn default_remote_endpoint() -> String {
    DEFAULT_REMOTE_ENDPOINT.to_string()
}

fn default_remote_model() -> String {
    DEFAULT_REMOTE_MODEL.to_string()
}

fn default_remote_token_env() -> String {
    DEFAULT_REMOTE_TOKEN_ENV.to_string()
}

fn default_remote_timeout_secs() -> u64 {
    DEFAULT_REMOTE_TIMEOUT_SECS
}

fn default_target_chars() -> usize {
    DEFAULT_TARGET_CHARS
}

fn default_max_chars() -> usize {
    DEFAULT_MAX_CHARS
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_oversampling_factor() -> usize {
    DEFAULT_OVERSAMPLING_FACTOR
}

fn default_snippet_max_length() -> usize {
    DEFAULT_SNIPPET_MAX_LENGTH
}

fn default_query_timeout_ms() -> u64 {
    DEFAULT_QUERY_TIMEOUT_MS
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub search: SearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let idx = &self.indexing;
        if idx.target_chars == 0 || idx.max_chars == 0 {
            return invalid("indexing.target_chars and indexing.max_chars must be greater than 0".into());
        }
        if idx.target_chars > idx.max_chars {
            return invalid(format!(
                "indexing.target_chars ({}) must not exceed indexing.max_chars ({})",
                idx.target_chars, idx.max_chars
            ));
        }

        let search = &self.search;
        if search.top_k == 0 {
            return invalid("search.top_k must be greater than 0".into());
        }
        if search.oversampling_factor == 0 {
            return invalid("search.oversampling_factor must be at least 1".into());
        }
        if search.snippet_max_length == 0 {
            return invalid("search.snippet_max_length must be greater than 0".into());
        }
        if search.query_timeout_ms == 0 {
            return invalid("search.query_timeout_ms must be greater than 0".into());
        }

        let emb = &self.embedding;
        if emb.model.trim().is_empty() {
            return invalid("embedding.model must not be empty".into());
        }
        if emb.download_timeout_secs == 0 {
            return invalid("embedding.download_timeout_secs must be greater than 0".into());
        }
        if emb.chunk_timeout_ms == 0 {
            return invalid("embedding.chunk_timeout_ms must be greater than 0".into());
        }
        if emb.remote.timeout_secs == 0 {
            return invalid("embedding.remote.timeout_secs must be greater than 0".into());
        }
        if emb.remote.endpoint.trim().is_empty() {
            return invalid("embedding.remote.endpoint must not be empty".into());
        }

        Ok(())
    }

    /// Apply `MNEMOS_TOP_K` / `MNEMOS_OVERSAMPLING_FACTOR`.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str, value: String| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::Invalid(format!("{key} must be a positive integer, got {value:?}")))
        };

        if let Some(value) = lookup(ENV_TOP_K) {
            self.search.top_k = parse(ENV_TOP_K, value)?;
        }
        if let Some(value) = lookup(ENV_OVERSAMPLING_FACTOR) {
            self.search.oversampling_factor = parse(ENV_OVERSAMPLING_FACTOR, value)?;
        }
        Ok(())
    }

    pub fn load_with(base_path: &str) -> Result<Self, ConfigError> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.embedding.model, "bge-small-en-v1.5");
        assert_eq!(config.embedding.host, EmbeddingHost::LocalOnly);
        assert_eq!(config.search.top_k, 12);
        assert_eq!(config.search.oversampling_factor, 2);
        assert_eq!(config.search.snippet_max_length, 240);
        assert_eq!(config.indexing.debounce_ms, 1000);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "embedding:\n  host: allow-fallback\nsearch:\n  top_k: 5\n";
        let config: Config = serde_yml::from_str(yaml).unwrap();

        assert_eq!(config.embedding.host, EmbeddingHost::AllowFallback);
        assert_eq!(config.embedding.model, "bge-small-en-v1.5");
        assert_eq!(config.search.top_k, 5);
        assert_eq!(config.search.oversampling_factor, 2);
        assert_eq!(config.indexing.max_chars, 1200);
    }

    #[test]
    fn test_validate_rejects_inverted_chunk_sizes() {
        let mut config = Config::default();
        config.indexing.target_chars = 2000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_top_k() {
        let mut config = Config::default();
        config.search.top_k = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.search.oversampling_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(|key| match key {
                ENV_TOP_K => Some("7".to_string()),
                ENV_OVERSAMPLING_FACTOR => Some(" 3 ".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.search.top_k, 7);
        assert_eq!(config.search.oversampling_factor, 3);

        let err = config.apply_overrides(|key| (key == ENV_TOP_K).then(|| "many".to_string()));
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_with_creates_and_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();

        let config = Config::load_with(base).unwrap();
        assert!(dir.path().join("config.yaml").exists());
        assert_eq!(config.base_path(), base);

        std::fs::write(
            dir.path().join("config.yaml"),
            "indexing:\n  target_chars: 100\n  max_chars: 150\n",
        )
        .unwrap();
        let config = Config::load_with(base).unwrap();
        assert_eq!(config.indexing.chunking().target_chars, 100);

        // missing fields were written back
        let saved = std::fs::read_to_string(dir.path().join("config.yaml")).unwrap();
        assert!(saved.contains("debounce_ms"));
    }

    #[test]
    fn test_load_with_rejects_malformed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "search: [unclosed").unwrap();
        assert!(Config::load_with(dir.path().to_str().unwrap()).is_err());
    }
}
