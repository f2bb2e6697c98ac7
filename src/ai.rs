//! LLM access for article enrichment.
//!
//! [`AiService`] is the narrow seam the enricher talks through: one request
//! in, the model's raw text out. [`OpenAiCompatClient`] implements it
//! against any OpenAI-compatible `/chat/completions` endpoint (OpenAI,
//! OpenRouter, a local vLLM or llama.cpp server). Retries and deadlines are
//! not handled here; the enricher wraps every call in a
//! [`CallPolicy`](crate::policy::CallPolicy).

use crate::errors::EnrichmentError;
use crate::models::Category;
use crate::utils::truncate_for_log;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// What the model is asked about one article.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentRequest {
    pub title: String,
    pub raw_summary: Option<String>,
}

impl EnrichmentRequest {
    /// The user message sent to the model.
    pub fn prompt(&self) -> String {
        match self.raw_summary.as_deref() {
            Some(summary) if !summary.trim().is_empty() => {
                format!("Title: {}\nSummary: {}", self.title, summary)
            }
            _ => format!("Title: {}", self.title),
        }
    }
}

/// Trait for async LLM interaction.
pub trait AiService {
    /// Send one enrichment request and return the model's raw reply.
    async fn complete(&self, request: &EnrichmentRequest) -> Result<String, EnrichmentError>;
}

pub fn system_prompt() -> String {
    let categories = Category::ALL
        .iter()
        .filter(|c| **c != Category::Uncategorized)
        .map(Category::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "You are a news desk editor. Classify the article into exactly one category from this list: \
         {categories}. Then write a neutral summary of one or two sentences. \
         Reply with a single JSON object and nothing else, shaped as \
         {{\"category\": \"<category>\", \"summary\": \"<summary>\"}}."
    )
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Client for an OpenAI-compatible chat completions API.
#[derive(Clone)]
pub struct OpenAiCompatClient {
    api_base: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    http: reqwest::Client,
}

impl fmt::Debug for OpenAiCompatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCompatClient")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_deref().map(|_| "<redacted>"))
            .finish()
    }
}

impl OpenAiCompatClient {
    pub fn new(api_base: &str, model: &str, api_key: Option<String>, http: reqwest::Client) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.to_string(),
            temperature: 0.2,
            max_tokens: 300,
            http,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

impl AiService for OpenAiCompatClient {
    #[instrument(level = "debug", skip_all, fields(model = %self.model))]
    async fn complete(&self, request: &EnrichmentRequest) -> Result<String, EnrichmentError> {
        let t0 = Instant::now();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt(),
                },
                ChatMessage {
                    role: "user",
                    content: request.prompt(),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EnrichmentError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::PAYMENT_REQUIRED {
            let text = response.text().await.unwrap_or_default();
            return Err(EnrichmentError::Quota(truncate_for_log(&text, 200)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, elapsed_ms = t0.elapsed().as_millis() as u64, "AI call failed");
            return Err(EnrichmentError::Http {
                status: status.as_u16(),
                body: truncate_for_log(&text, 200),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| EnrichmentError::Malformed(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| EnrichmentError::Malformed("no choices in response".to_string()))?;

        debug!(elapsed_ms = t0.elapsed().as_millis() as u64, "AI call succeeded");
        Ok(content)
    }
}
