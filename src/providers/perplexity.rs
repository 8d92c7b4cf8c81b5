//! Perplexity adapter — the web-grounded answer engine.
//!
//! OpenAI-compatible wire shape plus a `citations` array. Citations are
//! appended to the text as a Sources block so downstream brand-citation
//! checks see the URLs the answer was grounded on.

use std::fmt::Write as _;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    classify_http_error, Completion, CompletionRequest, FinishReason, ProviderAdapter,
    ProviderError, ProviderId, ResponseFormat,
};

const DEFAULT_BASE_URL: &str = "https://api.perplexity.ai";
const DEFAULT_MODEL: &str = "sonar";

pub struct PerplexityAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl PerplexityAdapter {
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
        let prompt = match req.response_format {
            ResponseFormat::JsonObject => format!(
                "{}\n\nRespond with a single JSON object and nothing else.",
                req.prompt
            ),
            ResponseFormat::Text => req.prompt.clone(),
        };
        let mut body = json!({
            "model": req.model.as_deref().unwrap_or(&self.model),
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(cap) = req.max_output_tokens {
            body["max_tokens"] = json!(cap);
        }
        body
    }
}

#[async_trait]
impl ProviderAdapter for PerplexityAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Perplexity
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        let started = Instant::now();
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.body(req))
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("perplexity request failed: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ProviderError::transient(format!("perplexity body read failed: {e}")))?;
        if status >= 400 {
            return Err(classify_http_error(status, &body));
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|e| {
            ProviderError::transient(format!("perplexity returned invalid JSON: {e}"))
        })?;
        let choice = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| ProviderError::transient("perplexity reply had no choices"))?;

        let mut text = choice
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // JSON replies must stay parseable; only plain answers get sources.
        if req.response_format == ResponseFormat::Text {
            if let Some(citations) = parsed.get("citations").and_then(Value::as_array) {
                let urls: Vec<&str> = citations.iter().filter_map(Value::as_str).collect();
                if !urls.is_empty() {
                    let _ = write!(text, "\n\nSources:");
                    for url in urls {
                        let _ = write!(text, "\n- {url}");
                    }
                }
            }
        }

        let finish_reason = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(FinishReason::from_openai)
            .unwrap_or(FinishReason::Stop);

        Ok(Completion {
            text,
            finish_reason,
            input_tokens: parsed.pointer("/usage/prompt_tokens").and_then(Value::as_u64).unwrap_or(0)
                as u32,
            output_tokens: parsed
                .pointer("/usage/completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}
