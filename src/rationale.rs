//! Collaboration rationale generation.
//!
//! A [`RationaleGenerator`] explains, in a few sentences, how the DAO that
//! posted a need and a candidate DAO could work together. The matching
//! engine never stores an empty explanation: when generation fails it
//! falls back to [`fallback_rationale`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RationaleConfig;
use crate::openai::{api_key_from_env, ApiClient};

/// Inputs for one rationale.
#[derive(Debug, Clone)]
pub struct RationaleRequest {
    pub need_description: String,
    pub requesting_name: String,
    pub candidate_description: String,
    pub candidate_name: String,
}

#[async_trait]
pub trait RationaleGenerator: Send + Sync {
    async fn generate(&self, request: &RationaleRequest) -> Result<String>;
}

/// Deterministic sentence used when no generated rationale is available.
pub fn fallback_rationale(requesting_name: &str, candidate_name: &str) -> String {
    format!(
        "{} and {} might be able to collaborate based on their descriptions.",
        requesting_name, candidate_name
    )
}

/// Build the chat prompt for a rationale request.
pub fn build_prompt(request: &RationaleRequest) -> String {
    format!(
        "Given these two descriptions:\n\n\
         DAO Need ({}): \"{}\"\n\
         Potential Collaborator ({}): \"{}\"\n\n\
         Provide a brief, specific explanation of how these two could collaborate. \
         Refer to both organizations by name. Focus on concrete actions and mutual benefits.",
        request.requesting_name,
        request.need_description,
        request.candidate_name,
        request.candidate_description
    )
}

/// Trim `text` and cut it to at most `max_chars` characters.
pub fn bound_length(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => trimmed[..idx].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

// ============ Disabled ============

/// Always fails, so the engine stores the fallback sentence.
pub struct DisabledRationale;

#[async_trait]
impl RationaleGenerator for DisabledRationale {
    async fn generate(&self, _request: &RationaleRequest) -> Result<String> {
        bail!("Rationale provider is disabled")
    }
}

// ============ OpenAI ============

/// Rationale generator backed by `POST /chat/completions`.
pub struct OpenAIRationale {
    model: String,
    max_tokens: u32,
    temperature: f32,
    max_chars: usize,
    client: ApiClient,
}

impl OpenAIRationale {
    pub fn new(config: &RationaleConfig) -> Result<Self> {
        Self::with_api_key(config, api_key_from_env()?)
    }

    pub fn with_api_key(config: &RationaleConfig, api_key: String) -> Result<Self> {
        let client = ApiClient::new(
            config.base_url.as_deref(),
            api_key,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_chars: config.max_chars,
            client,
        })
    }
}

#[async_trait]
impl RationaleGenerator for OpenAIRationale {
    async fn generate(&self, request: &RationaleRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": build_prompt(request) }],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        let json = self.client.post_json("chat/completions", &body).await?;
        let content = parse_chat_response(&json)?;
        Ok(bound_length(&content, self.max_chars))
    }
}

/// Extract `choices[0].message.content`; a missing or null content is
/// returned as an empty string.
fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    let choice = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices"))?;

    Ok(choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string())
}

pub fn create_generator(config: &RationaleConfig) -> Result<Arc<dyn RationaleGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledRationale)),
        "openai" => Ok(Arc::new(OpenAIRationale::new(config)?)),
        other => bail!("Unknown rationale provider: {}", other),
    }
}
