use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use thiserror::Error;

use crate::core::config::Config;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub structure_model: Option<String>,
    #[serde(default)]
    pub chapter_model: Option<String>,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    /// Falls back to `GEMINI_API_KEY` / `API_KEY` when absent.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_chapter_model")]
    pub chapter_model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_gemini_chapter_model() -> String {
    "gemini-2.5-pro".to_string()
}

impl LlmConfig {
    /// Model used for the outline call: explicit override, else the provider default.
    pub fn structure_model(&self) -> Option<String> {
        self.structure_model.clone()
    }

    /// Model used for chapter calls: explicit override, else the provider's chapter model.
    pub fn chapter_model(&self) -> Option<String> {
        self.chapter_model.clone().or_else(|| match self.provider.as_str() {
            "gemini" => self.gemini.as_ref().map(|g| g.chapter_model.clone()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// The request quota was exceeded; safe to retry after a pause.
    RateLimited,
    /// Network trouble or a server-side failure.
    Transient,
    Permanent,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmErrorKind::RateLimited => f.write_str("rate limited"),
            LlmErrorKind::Transient => f.write_str("transient failure"),
            LlmErrorKind::Permanent => f.write_str("request failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::RateLimited, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Permanent, message)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == LlmErrorKind::RateLimited
    }

    fn from_http(provider: &str, status: u16, body: &str) -> Self {
        Self::new(
            classify_status(status, body),
            format!("{} API error (HTTP {}): {}", provider, status, body),
        )
    }

    fn from_transport(provider: &str, err: reqwest::Error) -> Self {
        Self::transient(format!("{} request failed: {}", provider, err))
    }
}

/// Maps an HTTP failure onto an error kind.
pub fn classify_status(status: u16, body: &str) -> LlmErrorKind {
    if status == 429 || body.contains("RESOURCE_EXHAUSTED") {
        LlmErrorKind::RateLimited
    } else if status == 408 || (500..600).contains(&status) {
        LlmErrorKind::Transient
    } else {
        LlmErrorKind::Permanent
    }
}

/// One call to the remote model.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    /// Overrides the client's configured model.
    pub model: Option<String>,
    pub system: Option<String>,
    pub prompt: String,
    /// JSON schema the response must follow; `None` asks for free text.
    pub response_schema: Option<serde_json::Value>,
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError>;
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>> {
    match config.llm.provider.as_str() {
        "gemini" => {
            let cfg = config.llm.gemini.as_ref().context("Gemini config missing")?;
            let api_key = cfg
                .api_key
                .clone()
                .or_else(|| std::env::var("GEMINI_API_KEY").ok())
                .or_else(|| std::env::var("API_KEY").ok())
                .context("Gemini API key missing: set llm.gemini.api_key or GEMINI_API_KEY")?;
            Ok(Box::new(GeminiClient::new(&api_key, &cfg.model)))
        }
        "ollama" => {
            let cfg = config.llm.ollama.as_ref().context("Ollama config missing")?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url, &cfg.model)))
        }
        "openai" => {
            let cfg = config.llm.openai.as_ref().context("OpenAI config missing")?;
            Ok(Box::new(OpenAIClient::new(
                &cfg.api_key,
                &cfg.model,
                cfg.base_url.as_deref(),
            )))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.llm.provider)),
    }
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, model: &str) -> Result<url::Url, LlmError> {
        let base = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            model
        );
        url::Url::parse_with_params(&base, &[("key", self.api_key.as_str())])
            .map_err(|e| LlmError::permanent(format!("Invalid Gemini endpoint: {}", e)))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    response_mime_type: String,
    response_schema: serde_json::Value,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
    #[serde(default)]
    status: Option<String>,
}

impl GeminiRequest {
    fn from_request(request: &GenerationRequest) -> Self {
        Self {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: request.prompt.clone(),
                }],
            }],
            system_instruction: request.system.as_ref().map(|system| GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: system.clone(),
                }],
            }),
            generation_config: request
                .response_schema
                .as_ref()
                .map(|schema| GeminiGenerationConfig {
                    response_mime_type: "application/json".to_string(),
                    response_schema: schema.clone(),
                }),
        }
    }
}

fn extract_gemini_text(result: GeminiResponse, raw: &str) -> Result<String, LlmError> {
    if let Some(err) = result.error {
        let status = err.status.unwrap_or_default();
        let kind = if status == "RESOURCE_EXHAUSTED" {
            LlmErrorKind::RateLimited
        } else {
            LlmErrorKind::Permanent
        };
        return Err(LlmError::new(
            kind,
            format!("Gemini API returned error: {} {}", status, err.message),
        ));
    }

    if let Some(candidates) = result.candidates {
        if let Some(first) = candidates.first() {
            if let Some(content) = &first.content {
                let text: String = content.parts.iter().map(|p| p.text.as_str()).collect();
                if !text.is_empty() {
                    return Ok(text);
                }
            }

            // If we get here, content or parts are missing
            let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
            return Err(LlmError::permanent(format!(
                "Gemini response empty. Finish reason: {}",
                reason
            )));
        }
    }

    Err(LlmError::permanent(format!(
        "Gemini response format unexpected or empty. Body: {}",
        raw
    )))
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let url = self.endpoint(model)?;
        let request_body = GeminiRequest::from_request(request);

        let resp = self
            .client
            .post(url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| LlmError::from_transport("Gemini", e))?;

        let status = resp.status();
        let response_text = resp
            .text()
            .await
            .map_err(|e| LlmError::from_transport("Gemini", e))?;

        if !status.is_success() {
            return Err(LlmError::from_http("Gemini", status.as_u16(), &response_text));
        }

        let result: GeminiResponse = serde_json::from_str(&response_text).map_err(|e| {
            LlmError::permanent(format!(
                "Failed to parse Gemini response: {}. Body: {}",
                e, response_text
            ))
        })?;

        extract_gemini_text(result, &response_text)
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let url = format!("{}/api/chat", self.base_url);

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(OllamaMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(OllamaMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        let request_body = OllamaRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            messages,
            stream: false,
            format: request.response_schema.clone(),
        };

        let resp = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| LlmError::from_transport("Ollama", e))?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_http("Ollama", status.as_u16(), &error_text));
        }

        let result: OllamaResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::permanent(format!("Failed to parse Ollama response: {}", e)))?;
        Ok(result.message.content)
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(OpenAIMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        let request_body = OpenAIRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            messages,
            response_format: request.response_schema.as_ref().map(|schema| {
                serde_json::json!({
                    "type": "json_schema",
                    "json_schema": { "name": "structured_output", "schema": schema }
                })
            }),
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await
            .map_err(|e| LlmError::from_transport("OpenAI", e))?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_http("OpenAI", status.as_u16(), &error_text));
        }

        let result: OpenAIResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::permanent(format!("Failed to parse OpenAI response: {}", e)))?;
        if let Some(choice) = result.choices.first() {
            if let Some(content) = &choice.message.content {
                return Ok(content.clone());
            }
        }

        Err(LlmError::permanent("OpenAI response empty or missing content"))
    }
}
