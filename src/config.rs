use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rationale: RationaleConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// API root, e.g. `https://api.openai.com/v1`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            base_url: None,
            max_retries: 1,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RationaleConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Upper bound on the stored collaboration description, in characters.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RationaleConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: default_chat_model(),
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_chars: default_max_chars(),
            max_retries: 1,
            timeout_secs: 30,
        }
    }
}

/// How the engine treats a failed candidate (or a failed need during a
/// DAO-wide refresh).
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure, commit everything else.
    #[default]
    Continue,
    /// Abort on the first failure.
    FailFast,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub prune_stale: bool,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            failure_policy: FailurePolicy::Continue,
            concurrency: default_concurrency(),
            prune_stale: false,
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    1
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_chat_model() -> String {
    "gpt-4".to_string()
}
fn default_max_tokens() -> u32 {
    200
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_chars() -> usize {
    600
}
fn default_similarity_threshold() -> f64 {
    0.7
}
fn default_concurrency() -> usize {
    4
}
fn default_call_timeout_secs() -> u64 {
    60
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl RationaleConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    // Rationale
    match config.rationale.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown rationale provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.rationale.max_tokens == 0 {
        anyhow::bail!("rationale.max_tokens must be > 0");
    }
    if !(0.0..=2.0).contains(&config.rationale.temperature) {
        anyhow::bail!("rationale.temperature must be in [0.0, 2.0]");
    }
    if config.rationale.max_chars == 0 {
        anyhow::bail!("rationale.max_chars must be > 0");
    }

    // Matching
    if !(0.0..=1.0).contains(&config.matching.similarity_threshold) {
        anyhow::bail!("matching.similarity_threshold must be in [0.0, 1.0]");
    }
    if config.matching.concurrency == 0 {
        anyhow::bail!("matching.concurrency must be >= 1");
    }
    if config.matching.call_timeout_secs == 0 {
        anyhow::bail!("matching.call_timeout_secs must be >= 1");
    }

    Ok(())
}
