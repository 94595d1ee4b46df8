use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_currency")]
    pub currency: String,
    pub store: StoreConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub images: ImagesConfig,
}

fn default_currency() -> String {
    "EUR".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    #[serde(default = "default_vector_backend")]
    pub backend: String,
    #[serde(default = "default_vector_path")]
    pub path: PathBuf,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
            path: default_vector_path(),
        }
    }
}

fn default_vector_backend() -> String {
    "memory".to_string()
}
fn default_vector_path() -> PathBuf {
    PathBuf::from("data/vectors")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_text_model")]
    pub text_model: String,
    /// Concurrent in-flight completion calls allowed before callers queue.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_vision_timeout_secs")]
    pub vision_timeout_secs: u64,
    #[serde(default = "default_text_timeout_secs")]
    pub text_timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_completion_endpoint(),
            vision_model: default_vision_model(),
            text_model: default_text_model(),
            max_in_flight: default_max_in_flight(),
            vision_timeout_secs: default_vision_timeout_secs(),
            text_timeout_secs: default_text_timeout_secs(),
        }
    }
}

fn default_completion_endpoint() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_vision_model() -> String {
    "llava:13b".to_string()
}
fn default_text_model() -> String {
    "llama3.1:8b".to_string()
}
fn default_max_in_flight() -> usize {
    4
}
fn default_vision_timeout_secs() -> u64 {
    120
}
fn default_text_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"completion"` calls the completion service's embedding endpoint;
    /// `"hashed"` is a deterministic local fallback that needs no network.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dim: default_embedding_dim(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "completion".to_string()
}
fn default_embedding_model() -> String {
    "all-minilm".to_string()
}
fn default_embedding_dim() -> usize {
    384
}
fn default_embedding_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8081
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImagesConfig {
    #[serde(default = "default_images_dir")]
    pub dir: PathBuf,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            dir: default_images_dir(),
        }
    }
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("data/images")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.vector.backend.as_str() {
        "persistent" | "memory" => {}
        other => anyhow::bail!(
            "Unknown vector backend: '{}'. Must be persistent or memory.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "completion" | "hashed" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be completion or hashed.",
            other
        ),
    }

    if config.embedding.dim == 0 {
        anyhow::bail!("embedding.dim must be > 0");
    }

    if config.currency.len() != 3 || !config.currency.chars().all(|c| c.is_ascii_alphabetic()) {
        anyhow::bail!(
            "currency must be a three-letter code, got '{}'",
            config.currency
        );
    }

    if config.completion.max_in_flight == 0 {
        anyhow::bail!("completion.max_in_flight must be >= 1");
    }

    Ok(())
}
