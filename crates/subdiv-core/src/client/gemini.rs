//! Gemini backend.
//!
//! Calls `models/{model}:streamGenerateContent?alt=sse` with a JSON
//! response schema and turns each server-sent event into [`ModelChunk`]s.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use subdiv_db::models::TokenUsage;
use tracing::{debug, info};

use super::trait_def::{GenerationCall, GenerationClient, ModelResponse};
use crate::error::GenerationError;
use crate::stream::ModelChunk;

/// Wait assumed for a 429 without a usable `Retry-After` header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Characters of an error body kept in error messages.
const ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    /// USD per million input tokens.
    pub input_price_per_mtok: f64,
    /// USD per million output tokens.
    pub output_price_per_mtok: f64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.4,
            input_price_per_mtok: 0.30,
            output_price_per_mtok: 2.50,
        }
    }
}

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    config: GeminiConfig,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, config: GeminiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    fn body(&self, call: &GenerationCall) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": call.prompt }]
            }],
            "generationConfig": {
                "temperature": self.config.temperature,
                "responseMimeType": "application/json",
                "responseJsonSchema": call.schema,
            }
        })
    }
}

#[async_trait]
impl GenerationClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, call: &GenerationCall) -> Result<ModelResponse, GenerationError> {
        info!(model = %self.config.model, prompt_len = call.prompt.len(), "calling gemini");

        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&self.body(call))
            .send()
            .await
            .map_err(|e| GenerationError::TransientCall(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer = SseBuffer::default();
            while let Some(item) = bytes.next().await {
                let data = match item {
                    Ok(data) => data,
                    Err(e) => {
                        yield Err(GenerationError::TransientCall(format!("stream interrupted: {e}")));
                        return;
                    }
                };
                for event in buffer.push(&data) {
                    match parse_sse_event(&event) {
                        Ok(chunks) => {
                            for chunk in chunks {
                                yield Ok(chunk);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            if let Some(event) = buffer.finish() {
                match parse_sse_event(&event) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            yield Ok(chunk);
                        }
                    }
                    Err(e) => yield Err(e),
                }
            }
        };

        Ok(ModelResponse::Streaming(Box::pin(stream)))
    }

    fn estimate_cost(&self, usage: &TokenUsage) -> f64 {
        usage.input_tokens as f64 / 1_000_000.0 * self.config.input_price_per_mtok
            + usage.output_tokens as f64 / 1_000_000.0 * self.config.output_price_per_mtok
    }
}

// ---------------------------------------------------------------------------
// HTTP status mapping
// ---------------------------------------------------------------------------

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> GenerationError {
    let excerpt: String = body.chars().take(ERROR_BODY_CHARS).collect();
    debug!(status = %status, body = %excerpt, "gemini returned an error status");

    if status == StatusCode::TOO_MANY_REQUESTS {
        GenerationError::RateLimited {
            service: "gemini".to_string(),
            retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
        }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        GenerationError::TransientCall(format!("status={status} body={excerpt}"))
    } else {
        GenerationError::FatalCall(format!("status={status} body={excerpt}"))
    }
}

// ---------------------------------------------------------------------------
// SSE framing
// ---------------------------------------------------------------------------

/// Splits a byte stream into SSE events (blank-line separated).
#[derive(Debug, Default)]
struct SseBuffer {
    pending: Vec<u8>,
}

impl SseBuffer {
    /// Append bytes and return every event completed by them.
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend(data.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        while let Some(pos) = self.pending.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.pending.drain(..pos + 2).collect();
            events.push(String::from_utf8_lossy(&event[..pos]).into_owned());
        }
        events
    }

    /// Whatever remains once the connection closes.
    fn finish(self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        if rest.trim().is_empty() { None } else { Some(rest) }
    }
}

/// Decode one SSE event from `streamGenerateContent` into chunks.
///
/// Events without `data:` lines (comments, keep-alives) yield nothing.
fn parse_sse_event(event: &str) -> Result<Vec<ModelChunk>, GenerationError> {
    let data: Vec<&str> = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let v: Value = serde_json::from_str(&data.join("\n"))
        .map_err(|e| GenerationError::TransientCall(format!("invalid stream event: {e}")))?;

    if let Some(err) = v.get("error") {
        let code = err.get("code").and_then(Value::as_u64).unwrap_or(0);
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let status = u16::try_from(code)
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Err(classify_status(status, None, message));
    }

    let mut chunks = Vec::new();
    let parts = v
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array);
    for part in parts.into_iter().flatten() {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                chunks.push(ModelChunk::Text(text.to_string()));
            }
        }
    }

    if let Some(usage) = v.get("usageMetadata") {
        let count = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
        chunks.push(ModelChunk::Usage(TokenUsage {
            input_tokens: count("promptTokenCount"),
            output_tokens: count("candidatesTokenCount"),
        }));
    }

    Ok(chunks)
}
