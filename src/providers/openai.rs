//! OpenAI chat completions adapter.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    classify_http_error, Completion, CompletionRequest, FinishReason, ProviderAdapter,
    ProviderError, ProviderId, ResponseFormat,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiAdapter {
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
        let mut body = json!({
            "model": req.model.as_deref().unwrap_or(&self.model),
            "messages": [{"role": "user", "content": req.prompt}],
        });
        if let Some(cap) = req.max_output_tokens {
            body["max_tokens"] = json!(cap);
        }
        if req.response_format == ResponseFormat::JsonObject {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        let started = Instant::now();
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.body(req))
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("openai request failed: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ProviderError::transient(format!("openai body read failed: {e}")))?;
        if status >= 400 {
            return Err(classify_http_error(status, &body));
        }

        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| ProviderError::transient(format!("openai returned invalid JSON: {e}")))?;
        let choice = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| ProviderError::transient("openai reply had no choices"))?;

        let text = choice
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
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
