use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::error::ModelError;
use crate::model::ModelApi;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub temperature: f32,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            model: DEFAULT_MODEL.to_owned(),
            timeout: Duration::from_secs(300),
            temperature: 0.7,
        }
    }
}

impl GeminiConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(base_url) = std::env::var("LECTUREGEN_GEMINI_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(model) = std::env::var("LECTUREGEN_GEMINI_MODEL")
            && !model.trim().is_empty()
        {
            config.model = model.trim().to_owned();
        }
        if let Ok(raw) = std::env::var("LECTUREGEN_GEMINI_TIMEOUT_SECS") {
            let secs = raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid LECTUREGEN_GEMINI_TIMEOUT_SECS={raw:?}"))?;
            config.timeout = Duration::from_secs(secs.max(1));
        }

        url::Url::parse(&config.base_url)
            .with_context(|| format!("invalid Gemini base URL: {}", config.base_url))?;
        Ok(config)
    }

    pub fn endpoint(&self) -> String {
        let base_url = self.base_url.trim_end_matches('/');
        format!("{base_url}/models/{}:generateContent", self.model)
    }
}

pub struct GeminiApi {
    client: reqwest::Client,
    config: GeminiConfig,
    endpoint: String,
}

impl GeminiApi {
    pub fn new(config: GeminiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build http client")?;
        let endpoint = config.endpoint();
        Ok(Self {
            client,
            config,
            endpoint,
        })
    }
}

#[async_trait]
impl ModelApi for GeminiApi {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, prompt: &str, api_key: &str) -> Result<String, ModelError> {
        let body = serde_json::json!({
            "contents": [
                { "role": "user", "parts": [ { "text": prompt } ] }
            ],
            "generationConfig": {
                "temperature": self.config.temperature,
                "responseMimeType": "application/json",
            },
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ModelError::Transient(format!("POST {}: {err}", self.endpoint)))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|err| ModelError::Transient(format!("read Gemini response body: {err}")))?;
        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), &raw));
        }

        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|err| ModelError::Malformed(format!("parse Gemini response: {err}")))?;
        extract_candidate_text(&value)
    }
}

fn classify_failure(status: u16, raw: &str) -> ModelError {
    let (message, error_status) = parse_error(raw).unwrap_or_else(|| (raw.to_owned(), None));
    let detail = format!("Gemini API error ({status}): {message}");
    let error_status = error_status.unwrap_or_default();
    let lowered = message.to_lowercase();

    if status == 429 || error_status == "RESOURCE_EXHAUSTED" || lowered.contains("quota") {
        return ModelError::RateLimited(detail);
    }
    if status == 401
        || status == 403
        || error_status == "UNAUTHENTICATED"
        || error_status == "PERMISSION_DENIED"
        || raw.contains("API_KEY_INVALID")
    {
        return ModelError::Auth(detail);
    }
    ModelError::Transient(detail)
}

fn parse_error(raw_json: &str) -> Option<(String, Option<String>)> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let error = value.get("error")?;
    let message = error.get("message")?.as_str()?.to_owned();
    let status = error
        .get("status")
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    Some((message, status))
}

fn extract_candidate_text(value: &serde_json::Value) -> Result<String, ModelError> {
    let candidates = value
        .get("candidates")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ModelError::Malformed("missing `candidates` array in response".to_owned()))?;

    let mut text = String::new();
    for candidate in candidates {
        let Some(parts) = candidate.pointer("/content/parts").and_then(|v| v.as_array()) else {
            continue;
        };
        for part in parts {
            let Some(part_text) = part.get("text").and_then(|v| v.as_str()) else {
                continue;
            };
            text.push_str(part_text);
        }
        if !text.is_empty() {
            break;
        }
    }

    if text.trim().is_empty() {
        return Err(ModelError::Malformed("Gemini output text is empty".to_owned()));
    }
    Ok(text)
}
