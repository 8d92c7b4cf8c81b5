//! Google Gemini adapter (multimodal family; we use the text surface).

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    classify_http_error, Completion, CompletionRequest, FinishReason, ProviderAdapter,
    ProviderError, ProviderId, ResponseFormat,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

pub struct GeminiAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiAdapter {
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
        let mut generation_config = json!({});
        if let Some(cap) = req.max_output_tokens {
            generation_config["maxOutputTokens"] = json!(cap);
        }
        if req.response_format == ResponseFormat::JsonObject {
            generation_config["responseMimeType"] = json!("application/json");
        }
        json!({
            "contents": [{"parts": [{"text": req.prompt}]}],
            "generationConfig": generation_config,
        })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Google
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        let started = Instant::now();
        let model = req.model.as_deref().unwrap_or(&self.model);
        let resp = self
            .client
            .post(format!("{}/v1beta/models/{model}:generateContent", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .json(&self.body(req))
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("gemini request failed: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ProviderError::transient(format!("gemini body read failed: {e}")))?;
        if status >= 400 {
            return Err(classify_http_error(status, &body));
        }

        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| ProviderError::transient(format!("gemini returned invalid JSON: {e}")))?;
        let candidate = parsed
            .get("candidates")
            .and_then(|c| c.get(0))
            .ok_or_else(|| ProviderError::transient("gemini reply had no candidates"))?;

        let text = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let finish_reason = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .map(FinishReason::from_gemini)
            .unwrap_or(FinishReason::Stop);

        Ok(Completion {
            text,
            finish_reason,
            input_tokens: parsed
                .pointer("/usageMetadata/promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            output_tokens: parsed
                .pointer("/usageMetadata/candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}
