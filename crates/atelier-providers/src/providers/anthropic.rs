//! Anthropic provider implementation
//!
//! Supports the Claude 3 and 3.5 families via the Messages API. All system
//! content is lifted out of the message list into the top-level `system`
//! field. Streaming uses typed Server-Sent Events ending in `message_stop`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::{
    config::ProviderConfig,
    error::{check_response, classify_transport, ProviderError},
    health_check::PROBE_TIMEOUT,
    models::{
        Capability, ChatRequest, ChatResponse, FinishReason, MessageRole, ModelDescriptor,
        TokenUsage,
    },
    provider::{Billing, Provider, ProviderCore, ProviderKind},
    streaming::{decode_events, EventStream, StreamDecoder, StreamEvent},
};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const FALLBACK_MAX_TOKENS: u32 = 4096;

static DEFAULT_MODELS: Lazy<Vec<ModelDescriptor>> = Lazy::new(|| {
    let caps = [Capability::Chat, Capability::Vision, Capability::Streaming];
    vec![
        ModelDescriptor::new("claude-3-5-sonnet-20241022", "Claude 3.5 Sonnet", 200_000, 8_192)
            .with_capabilities(&caps)
            .with_pricing(0.003, 0.015),
        ModelDescriptor::new("claude-3-5-haiku-20241022", "Claude 3.5 Haiku", 200_000, 8_192)
            .with_capabilities(&[Capability::Chat, Capability::Streaming])
            .with_pricing(0.0008, 0.004),
        ModelDescriptor::new("claude-3-opus-20240229", "Claude 3 Opus", 200_000, 4_096)
            .with_capabilities(&caps)
            .with_pricing(0.015, 0.075),
        ModelDescriptor::new("claude-3-haiku-20240307", "Claude 3 Haiku", 200_000, 4_096)
            .with_capabilities(&caps)
            .with_pricing(0.00025, 0.00125),
    ]
});

/// Anthropic provider implementation
pub struct AnthropicProvider {
    core: Arc<ProviderCore>,
    client: Arc<Client>,
}

impl AnthropicProvider {
    /// Create a provider; unset fields take the Anthropic defaults
    pub fn new(mut config: ProviderConfig) -> Result<Self, ProviderError> {
        config.fill_defaults("Anthropic", DEFAULT_BASE_URL, &DEFAULT_MODELS);
        let client = Client::builder()
            .build()
            .map_err(|e| ProviderError::config(&config.name, e.to_string()))?;

        Ok(Self {
            core: Arc::new(ProviderCore::new(config, Billing::PerToken)),
            client: Arc::new(client),
        })
    }

    /// Built-in model catalog
    pub fn default_models() -> Vec<ModelDescriptor> {
        DEFAULT_MODELS.clone()
    }

    fn messages_request(&self) -> RequestBuilder {
        let config = self.core.config();
        self.client
            .post(format!("{}/messages", config.base_url.trim_end_matches('/')))
            .header("x-api-key", &config.api_key)
            .header("anthropic-version", API_VERSION)
    }

    fn build_request(&self, request: &ChatRequest, model: &str, stream: bool) -> AnthropicRequest {
        let config = self.core.config();

        let system_parts: Vec<&str> = request
            .system_prompt
            .as_deref()
            .into_iter()
            .chain(
                request
                    .messages
                    .iter()
                    .filter(|m| m.role == MessageRole::System)
                    .map(|m| m.content.as_str()),
            )
            .filter(|s| !s.is_empty())
            .collect();

        let max_tokens = request
            .max_tokens
            .or(config.max_tokens)
            .or_else(|| self.core.model(model).map(|m| m.max_tokens))
            .unwrap_or(FALLBACK_MAX_TOKENS);

        AnthropicRequest {
            model: model.to_string(),
            max_tokens,
            messages: request
                .messages
                .iter()
                .filter(|m| m.role != MessageRole::System)
                .map(|m| AnthropicMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
            temperature: request.temperature.or(config.temperature),
            stream,
        }
    }

    async fn post_messages(&self, body: &AnthropicRequest) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .messages_request()
            .timeout(self.core.timeout_or(DEFAULT_TIMEOUT))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!("Anthropic API request failed: {}", e);
                classify_transport(self.name(), &e)
            })?;
        check_response(self.name(), response).await
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn core(&self) -> &Arc<ProviderCore> {
        &self.core
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    /// Minimal completion. The API answers 400 for an empty conversation,
    /// which still proves reachability and a valid key.
    async fn probe(&self) -> Result<(), ProviderError> {
        let body = AnthropicRequest {
            model: self.core.resolve_model(None),
            max_tokens: 1,
            messages: Vec::new(),
            system: None,
            temperature: None,
            stream: false,
        };
        let response = self
            .messages_request()
            .timeout(PROBE_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(self.name(), &e))?;

        if response.status() == StatusCode::BAD_REQUEST {
            return Ok(());
        }
        check_response(self.name(), response).await?;
        Ok(())
    }

    async fn chat(&self, request: &ChatRequest, model: &str) -> Result<ChatResponse, ProviderError> {
        let body = self.build_request(request, model, false);
        let response = self.post_messages(&body).await?;
        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| classify_transport(self.name(), &e))?;

        let content: String = parsed
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect();
        if content.is_empty() && parsed.content.is_empty() {
            return Err(ProviderError::parse(self.name(), "No content in response"));
        }

        Ok(ChatResponse {
            content,
            model: model.to_string(),
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
            finish_reason: parsed.stop_reason.as_deref().and_then(map_stop_reason),
        })
    }

    async fn open_stream(&self, request: &ChatRequest, model: &str) -> Result<EventStream, ProviderError> {
        let body = self.build_request(request, model, true);
        let response = self.post_messages(&body).await?;
        let name = self.name().to_string();
        let bytes = response
            .bytes_stream()
            .map(move |read| read.map_err(|e| classify_transport(&name, &e)));
        Ok(decode_events(bytes, AnthropicDecoder::new(self.name())))
    }
}

fn map_stop_reason(reason: &str) -> Option<FinishReason> {
    match reason {
        "end_turn" | "stop_sequence" => Some(FinishReason::Stop),
        "max_tokens" => Some(FinishReason::Length),
        "tool_use" => Some(FinishReason::ToolCalls),
        _ => None,
    }
}

/// Decoder for the Messages API event stream
///
/// Only `data:` lines are read; each payload carries its own `type`, so the
/// preceding `event:` line is redundant.
pub struct AnthropicDecoder {
    provider: String,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    stop_reason: Option<FinishReason>,
}

impl AnthropicDecoder {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            input_tokens: None,
            output_tokens: None,
            stop_reason: None,
        }
    }

    fn usage(&self) -> Option<TokenUsage> {
        match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (input, output) => Some(TokenUsage::new(input.unwrap_or(0), output.unwrap_or(0))),
        }
    }
}

impl StreamDecoder for AnthropicDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamEvent>, ProviderError> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(vec![]);
        };

        let event: AnthropicStreamEvent = match serde_json::from_str(data.trim()) {
            Ok(event) => event,
            Err(e) => {
                debug!("Skipping malformed stream line from {}: {}", self.provider, e);
                return Ok(vec![]);
            }
        };

        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.input_tokens = usage.input_tokens;
                    self.output_tokens = usage.output_tokens;
                }
                Ok(vec![])
            }
            AnthropicStreamEvent::ContentBlockDelta { delta } => {
                Ok(delta.text.map(StreamEvent::Delta).into_iter().collect())
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    self.stop_reason = map_stop_reason(reason);
                }
                if let Some(output) = usage.and_then(|u| u.output_tokens) {
                    self.output_tokens = Some(output);
                }
                Ok(vec![])
            }
            AnthropicStreamEvent::MessageStop => {
                trace!("Stream completed with message_stop");
                Ok(vec![StreamEvent::Done {
                    usage: self.usage(),
                    finish_reason: self.stop_reason.take(),
                }])
            }
            AnthropicStreamEvent::Error { error } => Err(stream_error(&self.provider, error)),
            AnthropicStreamEvent::Other => Ok(vec![]),
        }
    }
}

fn stream_error(provider: &str, error: AnthropicErrorBody) -> ProviderError {
    match error.error_type.as_deref() {
        Some("authentication_error") => ProviderError::Authentication {
            provider: provider.to_string(),
        },
        Some("rate_limit_error") => ProviderError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        },
        _ => ProviderError::Provider {
            provider: provider.to_string(),
            message: error.message.unwrap_or_else(|| "stream error".to_string()),
            code: error.error_type,
            status: None,
        },
    }
}

/// Anthropic API request format
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

/// Anthropic API response format
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicStartMessage,
    },
    ContentBlockDelta {
        delta: AnthropicBlockDelta,
    },
    MessageDelta {
        delta: AnthropicMessageDelta,
        usage: Option<AnthropicPartialUsage>,
    },
    MessageStop,
    Error {
        error: AnthropicErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicStartMessage {
    usage: Option<AnthropicPartialUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicPartialUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlockDelta {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: Option<String>,
}
