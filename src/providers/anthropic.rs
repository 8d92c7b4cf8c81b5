//! Anthropic messages adapter.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    classify_http_error, Completion, CompletionRequest, FinishReason, ProviderAdapter,
    ProviderError, ProviderId, ResponseFormat,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const API_VERSION: &str = "2023-06-01";

/// The messages API requires `max_tokens` on every request. When the caller
/// sets no cap we send a window-sized ceiling rather than a restrictive cap,
/// so long prompts still get full completions.
const UNCAPPED_MAX_TOKENS: u32 = 8_192;

pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn body(&self, req: &CompletionRequest) -> Value {
        // No response_format on this API; JSON replies are prompt-constrained.
        let prompt = match req.response_format {
            ResponseFormat::JsonObject => format!(
                "{}\n\nRespond with a single JSON object and nothing else.",
                req.prompt
            ),
            ResponseFormat::Text => req.prompt.clone(),
        };
        json!({
            "model": req.model.as_deref().unwrap_or(&self.model),
            "max_tokens": req.max_output_tokens.unwrap_or(UNCAPPED_MAX_TOKENS),
            "messages": [{"role": "user", "content": prompt}],
        })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        let started = Instant::now();
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.body(req))
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("anthropic request failed: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ProviderError::transient(format!("anthropic body read failed: {e}")))?;
        if status >= 400 {
            return Err(classify_http_error(status, &body));
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|e| {
            ProviderError::transient(format!("anthropic returned invalid JSON: {e}"))
        })?;

        // content[*] where type == "text"
        let text = parsed
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let finish_reason = parsed
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(FinishReason::from_anthropic)
            .unwrap_or(FinishReason::Stop);

        Ok(Completion {
            text,
            finish_reason,
            input_tokens: parsed.pointer("/usage/input_tokens").and_then(Value::as_u64).unwrap_or(0)
                as u32,
            output_tokens: parsed
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}
