use super::models::{ChatMessage, ChatReply, SamplingParams, Usage};
use crate::error::GatewayError;
use crate::util::truncate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Per-request timeout for chat completions.
pub const REQUEST_TIMEOUT_SECS: u64 = 45;

/// How much of a provider body to echo back inside an error.
const ERROR_PREVIEW_CHARS: usize = 200;

/// The single capability the harness needs from a model: transcript in,
/// text and usage out. Provider quirks live in configuration, not in
/// implementations of this trait.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(
        &self,
        transcript: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<ChatReply, GatewayError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Deserialize, Default)]
struct UsageEnvelope {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    extra_headers: Vec<(String, String)>,
}

impl OpenAiCompatClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        extra_headers: Vec<(String, String)>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            extra_headers,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChatGateway for OpenAiCompatClient {
    async fn chat(
        &self,
        transcript: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<ChatReply, GatewayError> {
        let request = ChatRequest {
            model: &self.model,
            messages: transcript,
            temperature: params.temperature,
            max_tokens: params.max_output_tokens,
            seed: params.seed,
        };

        // Most providers accept a bearer token; some only look at x-api-key.
        let mut builder = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("x-api-key", &self.api_key);
        for (name, value) in &self.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let start = Instant::now();
        let response = builder.json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        let elapsed = start.elapsed();

        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: truncate(&body, ERROR_PREVIEW_CHARS),
            });
        }

        let mut reply = parse_completion_body(&body)?;
        reply.usage.elapsed_s = elapsed.as_secs_f64();
        tracing::debug!(
            model = %self.model,
            elapsed_ms = elapsed.as_millis() as u64,
            total_tokens = reply.usage.total_tokens,
            "chat completion"
        );
        Ok(reply)
    }
}

/// Read `choices[0].message.content` and the optional usage block out of a
/// completion response body.
pub fn parse_completion_body(body: &str) -> Result<ChatReply, GatewayError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| GatewayError::InvalidJson {
            message: e.to_string(),
            preview: truncate(body, ERROR_PREVIEW_CHARS),
        })?;

    let text = value
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| GatewayError::MissingContent {
            preview: truncate(body, ERROR_PREVIEW_CHARS),
        })?
        .to_string();

    let usage = value
        .get("usage")
        .and_then(|u| serde_json::from_value::<UsageEnvelope>(u.clone()).ok())
        .unwrap_or_default();

    Ok(ChatReply {
        text,
        usage: Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            ..Default::default()
        },
    })
}
