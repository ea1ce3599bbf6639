//! Completion providers and the retry policy wrapped around them.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};

const NVIDIA_BASE_URL: &str = "https://integrate.api.nvidia.com/v1";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Sampling settings passed with every completion request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.5,
            top_p: 1.0,
        }
    }
}

/// A text-generation backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        system: &str,
        query: &str,
        params: &SamplingParams,
    ) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Nvidia,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Nvidia => "nvidia",
        }
    }

    pub fn api_key_env_var(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::Nvidia => "NVIDIA_API_KEY",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => OPENAI_BASE_URL,
            ProviderKind::Anthropic => ANTHROPIC_BASE_URL,
            ProviderKind::Nvidia => NVIDIA_BASE_URL,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::Anthropic => "claude-3-5-haiku-latest",
            ProviderKind::Nvidia => "meta/llama-3.1-8b-instruct",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "nvidia" => Ok(ProviderKind::Nvidia),
            other => Err(Error::Config(format!(
                "unknown completion provider '{other}' (expected openai, anthropic or nvidia)"
            ))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to reach a completion provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            api_key: None,
            base_url: None,
            model: None,
        }
    }
}

/// The explicit key if given, otherwise the provider's environment
/// variable as returned by `env`.
fn resolve_api_key(
    kind: ProviderKind,
    explicit: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<String> {
    explicit
        .map(str::to_string)
        .or_else(|| env(kind.api_key_env_var()))
        .filter(|key| !key.trim().is_empty())
        .ok_or(Error::ProviderAuth {
            provider: kind.as_str(),
            env_var: kind.api_key_env_var(),
        })
}

/// Build the provider described by `config`.
///
/// Fails with [`Error::ProviderAuth`] when no API key is available.
pub fn connect(config: &ProviderConfig) -> Result<Box<dyn CompletionProvider>> {
    let api_key = resolve_api_key(config.kind, config.api_key.as_deref(), |var| {
        std::env::var(var).ok()
    })?;
    let base_url = config
        .base_url
        .clone()
        .unwrap_or_else(|| config.kind.default_base_url().to_string());
    let model = config
        .model
        .clone()
        .unwrap_or_else(|| config.kind.default_model().to_string());
    let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

    tracing::debug!(provider = %config.kind, model = %model, "connecting completion provider");
    Ok(match config.kind {
        ProviderKind::OpenAi | ProviderKind::Nvidia => Box::new(OpenAiCompatible {
            provider: config.kind.as_str(),
            client,
            base_url,
            api_key,
            model,
        }),
        ProviderKind::Anthropic => Box::new(AnthropicMessages {
            client,
            base_url,
            api_key,
            model,
        }),
    })
}

/// An unsuccessful HTTP status as a provider error. Rate limits and server
/// errors are transient.
fn status_error(provider: &str, status: StatusCode, body: &str) -> Error {
    Error::Provider {
        message: format!("{provider} returned {status}: {body}"),
        transient: status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
    }
}

fn malformed_response(provider: &str) -> Error {
    Error::Provider {
        message: format!("{provider} returned a response without text"),
        transient: false,
    }
}

/// OpenAI-style `/chat/completions` endpoint.
pub struct OpenAiCompatible {
    provider: &'static str,
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl CompletionProvider for OpenAiCompatible {
    fn name(&self) -> &str {
        self.provider
    }

    async fn generate(
        &self,
        system: &str,
        query: &str,
        params: &SamplingParams,
    ) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": query},
                ],
                "max_tokens": params.max_tokens,
                "temperature": params.temperature,
                "top_p": params.top_p,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(self.provider, status, &body));
        }

        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| malformed_response(self.provider))
    }
}

/// Anthropic `/messages` endpoint.
pub struct AnthropicMessages {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[async_trait]
impl CompletionProvider for AnthropicMessages {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(
        &self,
        system: &str,
        query: &str,
        params: &SamplingParams,
    ) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": self.model,
                "system": system,
                "messages": [{"role": "user", "content": query}],
                "max_tokens": params.max_tokens,
                "temperature": params.temperature,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("anthropic", status, &body));
        }

        let body: MessagesResponse = response.json().await?;
        let text: String = body
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text)
            .collect();
        if text.is_empty() {
            return Err(malformed_response("anthropic"));
        }
        Ok(text)
    }
}

/// Exponential backoff for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// No retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or
    /// the attempts are used up.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(attempt, delay = ?delay, error = %e, "retrying completion request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
