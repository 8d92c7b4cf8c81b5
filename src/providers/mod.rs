//! Uniform contract over heterogeneous LLM backends.
//!
//! Each adapter maps one provider's wire shape onto `CompletionRequest` /
//! `Completion` and classifies upstream failures into the three retry
//! classes the rate-limited caller understands.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod perplexity;
pub mod pricing;
pub mod throttle;

pub use throttle::{RateLimitedCaller, RetryPolicy};

// ── Provider identity ───────────────────────────────────────────

/// Persistence ids for the supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Google,
    Perplexity,
}

impl ProviderId {
    pub const ALL: [ProviderId; 4] = [
        ProviderId::OpenAi,
        ProviderId::Anthropic,
        ProviderId::Google,
        ProviderId::Perplexity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Google => "google",
            ProviderId::Perplexity => "perplexity",
        }
    }

    /// `PROVIDER_<prefix>_API_KEY` etc.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "OPENAI",
            ProviderId::Anthropic => "ANTHROPIC",
            ProviderId::Google => "GOOGLE",
            ProviderId::Perplexity => "PERPLEXITY",
        }
    }

    pub fn parse(s: &str) -> Option<ProviderId> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Some(ProviderId::OpenAi),
            "anthropic" => Some(ProviderId::Anthropic),
            "google" | "gemini" => Some(ProviderId::Google),
            "perplexity" => Some(ProviderId::Perplexity),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Request / response shapes ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Provider-specific model override; adapters fall back to their default.
    pub model: Option<String>,
    /// Hard output cap. Leave unset unless truncation is genuinely wanted:
    /// a restrictive cap with a large prompt yields empty completions with
    /// `finish_reason = length`, which the caller then retries uncapped.
    pub max_output_tokens: Option<u32>,
    pub response_format: ResponseFormat,
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            max_output_tokens: None,
            response_format: ResponseFormat::Text,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn json(prompt: impl Into<String>) -> Self {
        Self {
            response_format: ResponseFormat::JsonObject,
            ..Self::text(prompt)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Rough token estimate for the tokens/min bucket: prompt chars / 4 plus
    /// headroom for the reply.
    pub fn estimated_tokens(&self) -> u32 {
        (self.prompt.len() / 4) as u32 + self.max_output_tokens.unwrap_or(1_000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

impl FinishReason {
    /// OpenAI-compatible `finish_reason` strings (also used by Perplexity).
    pub fn from_openai(s: &str) -> FinishReason {
        match s {
            "stop" | "tool_calls" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Error,
        }
    }

    /// Anthropic `stop_reason` strings.
    pub fn from_anthropic(s: &str) -> FinishReason {
        match s {
            "end_turn" | "stop_sequence" | "tool_use" => FinishReason::Stop,
            "max_tokens" => FinishReason::Length,
            "refusal" => FinishReason::ContentFilter,
            _ => FinishReason::Error,
        }
    }

    /// Gemini `finishReason` strings (upper-case on the wire).
    pub fn from_gemini(s: &str) -> FinishReason {
        match s.to_lowercase().as_str() {
            "stop" => FinishReason::Stop,
            "max_tokens" => FinishReason::Length,
            "safety" | "prohibited_content" | "blocklist" => FinishReason::ContentFilter,
            _ => FinishReason::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub finish_reason: FinishReason,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
}

// ── Error classification ────────────────────────────────────────

/// Retry class of a provider failure. `Transient` is retried with backoff,
/// `Quota` is retried with a longer backoff, `Permanent` propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Transient,
    Permanent,
    Quota,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderErrorKind::Transient => "transient",
            ProviderErrorKind::Permanent => "permanent",
            ProviderErrorKind::Quota => "quota",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Transient, message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Permanent, message: message.into() }
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Quota, message: message.into() }
    }

    /// Short form persisted on error response rows, e.g. `transient: 503 …`.
    pub fn row_label(&self) -> String {
        self.to_string()
    }
}

/// Classify an upstream HTTP failure by status code and body text.
///
/// 401/403 are auth/billing (quota class), 429 splits into quota vs plain
/// rate limiting by body markers, 400s are permanent unless they look like a
/// transient overload, and 5xx is always retryable.
pub fn classify_http_error(status: u16, body: &str) -> ProviderError {
    let snippet: String = body.chars().take(300).collect();
    let lower = snippet.to_lowercase();

    let kind = match status {
        401 | 403 => ProviderErrorKind::Quota,
        429 => {
            if lower.contains("quota") || lower.contains("billing") || lower.contains("insufficient")
            {
                ProviderErrorKind::Quota
            } else {
                ProviderErrorKind::Transient
            }
        }
        408 => ProviderErrorKind::Transient,
        400..=499 => ProviderErrorKind::Permanent,
        500..=599 => ProviderErrorKind::Transient,
        _ => ProviderErrorKind::Transient,
    };

    ProviderError { kind, message: format!("{status} from upstream: {snippet}") }
}

// ── The adapter contract ────────────────────────────────────────

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError>;
}

/// What pipeline stages program against: a provider behind its rate limiter.
/// Mocked in tests.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn provider(&self) -> ProviderId;
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError>;
}

// ── Shared HTTP client ──────────────────────────────────────────

/// One pooled client shared by every adapter.
pub fn build_http_client() -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .pool_max_idle_per_host(16)
        .connect_timeout(Duration::from_secs(5))
        .build()?;
    Ok(client)
}

// ── Registry ────────────────────────────────────────────────────

/// Process-wide set of rate-limited callers, one per configured provider.
/// Rate-limiter state is shared through `Arc`, so orchestrator concurrency
/// can never exceed a provider's declared RPM no matter how many audits run.
pub struct ProviderRegistry {
    callers: HashMap<ProviderId, Arc<RateLimitedCaller>>,
}

impl ProviderRegistry {
    pub fn from_config(cfg: &Config, client: &reqwest::Client) -> Self {
        let mut callers: HashMap<ProviderId, Arc<RateLimitedCaller>> = HashMap::new();
        for settings in &cfg.providers {
            let adapter: Arc<dyn ProviderAdapter> = match settings.id {
                ProviderId::OpenAi => {
                    Arc::new(openai::OpenAiAdapter::new(client.clone(), settings.api_key.clone()))
                }
                ProviderId::Anthropic => Arc::new(anthropic::AnthropicAdapter::new(
                    client.clone(),
                    settings.api_key.clone(),
                )),
                ProviderId::Google => {
                    Arc::new(google::GeminiAdapter::new(client.clone(), settings.api_key.clone()))
                }
                ProviderId::Perplexity => Arc::new(perplexity::PerplexityAdapter::new(
                    client.clone(),
                    settings.api_key.clone(),
                )),
            };
            callers.insert(
                settings.id,
                Arc::new(RateLimitedCaller::new(
                    adapter,
                    settings.rpm,
                    settings.tpm,
                    RetryPolicy::default(),
                )),
            );
        }
        Self { callers }
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<RateLimitedCaller>> {
        self.callers.get(&id).cloned()
    }

    pub fn available(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> =
            ProviderId::ALL.into_iter().filter(|id| self.callers.contains_key(id)).collect();
        ids.sort_by_key(|id| id.as_str());
        ids
    }

    /// Backend used for the engine's own prompts (generation, evaluation,
    /// extraction, summaries): first configured chat provider in preference
    /// order.
    pub fn primary(&self) -> Option<Arc<RateLimitedCaller>> {
        for id in [ProviderId::OpenAi, ProviderId::Anthropic, ProviderId::Google, ProviderId::Perplexity]
        {
            if let Some(c) = self.get(id) {
                return Some(c);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_ids_round_trip() {
        for id in ProviderId::ALL {
            assert_eq!(ProviderId::parse(id.as_str()), Some(id));
        }
        assert_eq!(ProviderId::parse("gemini"), Some(ProviderId::Google));
        assert_eq!(ProviderId::parse("  OpenAI "), Some(ProviderId::OpenAi));
        assert_eq!(ProviderId::parse("bing"), None);
    }

    #[test]
    fn provider_id_serializes_to_persistence_form() {
        assert_eq!(serde_json::to_string(&ProviderId::OpenAi).unwrap(), "\"openai\"");
        assert_eq!(serde_json::to_string(&ProviderId::Perplexity).unwrap(), "\"perplexity\"");
    }

    #[test]
    fn classify_auth_as_quota() {
        let e = classify_http_error(401, r#"{"error":{"message":"Invalid API key"}}"#);
        assert_eq!(e.kind, ProviderErrorKind::Quota);
        let e = classify_http_error(403, "forbidden");
        assert_eq!(e.kind, ProviderErrorKind::Quota);
    }

    #[test]
    fn classify_429_splits_quota_from_rate_limit() {
        let rate = classify_http_error(429, r#"{"error":{"message":"Rate limit exceeded"}}"#);
        assert_eq!(rate.kind, ProviderErrorKind::Transient);

        let quota =
            classify_http_error(429, r#"{"error":{"message":"You exceeded your current quota"}}"#);
        assert_eq!(quota.kind, ProviderErrorKind::Quota);

        let billing = classify_http_error(429, r#"{"error":{"type":"billing_hard_limit"}}"#);
        assert_eq!(billing.kind, ProviderErrorKind::Quota);
    }

    #[test]
    fn classify_400_as_permanent_and_5xx_as_transient() {
        assert_eq!(classify_http_error(400, "bad request").kind, ProviderErrorKind::Permanent);
        assert_eq!(classify_http_error(404, "no such model").kind, ProviderErrorKind::Permanent);
        assert_eq!(classify_http_error(500, "oops").kind, ProviderErrorKind::Transient);
        assert_eq!(classify_http_error(503, "overloaded").kind, ProviderErrorKind::Transient);
    }

    #[test]
    fn finish_reason_mappings() {
        assert_eq!(FinishReason::from_openai("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_openai("length"), FinishReason::Length);
        assert_eq!(FinishReason::from_openai("content_filter"), FinishReason::ContentFilter);
        assert_eq!(FinishReason::from_anthropic("end_turn"), FinishReason::Stop);
        assert_eq!(FinishReason::from_anthropic("max_tokens"), FinishReason::Length);
        assert_eq!(FinishReason::from_gemini("STOP"), FinishReason::Stop);
        assert_eq!(FinishReason::from_gemini("MAX_TOKENS"), FinishReason::Length);
        assert_eq!(FinishReason::from_gemini("SAFETY"), FinishReason::ContentFilter);
    }

    #[test]
    fn estimated_tokens_includes_reply_headroom() {
        let req = CompletionRequest::text("x".repeat(4_000));
        assert_eq!(req.estimated_tokens(), 2_000);
        let capped = CompletionRequest { max_output_tokens: Some(64), ..req };
        assert_eq!(capped.estimated_tokens(), 1_064);
    }
}
