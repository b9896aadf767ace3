//! OpenAI provider implementation
//!
//! Supports the GPT-4o, GPT-4 and GPT-3.5 families via the chat completions
//! API. System messages travel inline in the message array. Streaming uses
//! Server-Sent Events terminated by a `[DONE]` sentinel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::{
    config::ProviderConfig,
    error::{backend_code, check_response, classify_transport, ProviderError},
    models::{Capability, ChatRequest, ChatResponse, FinishReason, ModelDescriptor, TokenUsage},
    provider::{Billing, Provider, ProviderCore, ProviderKind},
    streaming::{decode_events, EventStream, StreamDecoder, StreamEvent},
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

static DEFAULT_MODELS: Lazy<Vec<ModelDescriptor>> = Lazy::new(|| {
    let full = [
        Capability::Chat,
        Capability::Vision,
        Capability::FunctionCalling,
        Capability::Streaming,
    ];
    vec![
        ModelDescriptor::new("gpt-4o", "GPT-4o", 128_000, 16_384)
            .with_capabilities(&full)
            .with_pricing(0.0025, 0.01),
        ModelDescriptor::new("gpt-4o-mini", "GPT-4o Mini", 128_000, 16_384)
            .with_capabilities(&full)
            .with_pricing(0.00015, 0.0006),
        ModelDescriptor::new("gpt-4-turbo", "GPT-4 Turbo", 128_000, 4_096)
            .with_capabilities(&full)
            .with_pricing(0.01, 0.03),
        ModelDescriptor::new("gpt-4", "GPT-4", 8_192, 4_096)
            .with_capabilities(&[Capability::Chat, Capability::FunctionCalling, Capability::Streaming])
            .with_pricing(0.03, 0.06),
        ModelDescriptor::new("gpt-3.5-turbo", "GPT-3.5 Turbo", 16_385, 4_096)
            .with_capabilities(&[Capability::Chat, Capability::FunctionCalling, Capability::Streaming])
            .with_pricing(0.0005, 0.0015),
    ]
});

/// OpenAI provider implementation
pub struct OpenAiProvider {
    core: Arc<ProviderCore>,
    client: Arc<Client>,
}

impl OpenAiProvider {
    /// Create a provider; unset fields take the OpenAI defaults
    pub fn new(mut config: ProviderConfig) -> Result<Self, ProviderError> {
        config.fill_defaults("OpenAI", DEFAULT_BASE_URL, &DEFAULT_MODELS);
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

    fn endpoint(&self, path: &str) -> String {
        let config = self.core.config();
        format!("{}/{}", config.base_url.trim_end_matches('/'), path)
    }

    fn build_request(&self, request: &ChatRequest, model: &str, stream: bool) -> OpenAiChatRequest {
        let config = self.core.config();
        OpenAiChatRequest {
            model: model.to_string(),
            messages: request
                .inline_messages()
                .into_iter()
                .map(|m| OpenAiMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content,
                })
                .collect(),
            temperature: request.temperature.or(config.temperature),
            max_tokens: request.max_tokens.or(config.max_tokens),
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        }
    }

    async fn post_chat(&self, body: &OpenAiChatRequest) -> Result<reqwest::Response, ProviderError> {
        let config = self.core.config();
        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&config.api_key)
            .timeout(self.core.timeout_or(DEFAULT_TIMEOUT))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!("OpenAI API request failed: {}", e);
                classify_transport(self.name(), &e)
            })?;
        check_response(self.name(), response).await
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn core(&self) -> &Arc<ProviderCore> {
        &self.core
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        let config = self.core.config();
        let response = self
            .client
            .get(self.endpoint("models"))
            .bearer_auth(&config.api_key)
            .timeout(crate::health_check::PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify_transport(self.name(), &e))?;
        check_response(self.name(), response).await?;
        Ok(())
    }

    async fn chat(&self, request: &ChatRequest, model: &str) -> Result<ChatResponse, ProviderError> {
        let body = self.build_request(request, model, false);
        let response = self.post_chat(&body).await?;
        let parsed: OpenAiChatResponse = response
            .json()
            .await
            .map_err(|e| classify_transport(self.name(), &e))?;
        convert_response(self.name(), parsed, model)
    }

    async fn open_stream(&self, request: &ChatRequest, model: &str) -> Result<EventStream, ProviderError> {
        let body = self.build_request(request, model, true);
        let response = self.post_chat(&body).await?;
        let name = self.name().to_string();
        let bytes = response
            .bytes_stream()
            .map(move |read| read.map_err(|e| classify_transport(&name, &e)));
        Ok(decode_events(bytes, OpenAiDecoder::new(self.name())))
    }
}

fn map_finish_reason(reason: &str) -> Option<FinishReason> {
    match reason {
        "stop" => Some(FinishReason::Stop),
        "length" => Some(FinishReason::Length),
        "content_filter" => Some(FinishReason::ContentFilter),
        "tool_calls" | "function_call" => Some(FinishReason::ToolCalls),
        _ => None,
    }
}

fn convert_response(
    provider: &str,
    response: OpenAiChatResponse,
    model: &str,
) -> Result<ChatResponse, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::parse(provider, "No choices in response"))?;
    let content = choice
        .message
        .and_then(|m| m.content)
        .ok_or_else(|| ProviderError::parse(provider, "No content in response"))?;

    Ok(ChatResponse {
        content,
        model: model.to_string(),
        usage: response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        finish_reason: choice.finish_reason.as_deref().and_then(map_finish_reason),
    })
}

/// Decoder for `data:` lines of the chat completions event stream
pub struct OpenAiDecoder {
    provider: String,
    usage: Option<TokenUsage>,
    finish_reason: Option<FinishReason>,
}

impl OpenAiDecoder {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            usage: None,
            finish_reason: None,
        }
    }
}

impl StreamDecoder for OpenAiDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamEvent>, ProviderError> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(vec![]);
        };
        let data = data.trim();

        if data == "[DONE]" {
            trace!("Stream completed with [DONE] marker");
            return Ok(vec![StreamEvent::Done {
                usage: self.usage.take(),
                finish_reason: self.finish_reason.take(),
            }]);
        }

        let chunk: OpenAiStreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("Skipping malformed stream line from {}: {}", self.provider, e);
                return Ok(vec![]);
            }
        };

        if let Some(err) = chunk.error {
            return Err(ProviderError::Provider {
                provider: self.provider.clone(),
                message: err.message.unwrap_or_else(|| "stream error".to_string()),
                code: err.code.map(backend_code),
                status: None,
            });
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens));
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason.as_deref() {
                self.finish_reason = map_finish_reason(reason);
            }
            if let Some(content) = choice.delta.and_then(|d| d.content) {
                events.push(StreamEvent::Delta(content));
            }
        }
        Ok(events)
    }
}

/// OpenAI API request format
#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// OpenAI API message format
#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

/// OpenAI API response format
#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: Option<OpenAiResponseMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
    error: Option<OpenAiStreamError>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: Option<OpenAiDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(ProviderConfig::new("openai").with_api_key("sk-test")).unwrap()
    }

    #[test]
    fn test_defaults_filled() {
        let provider = provider();
        let config = provider.config();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.display_name, "OpenAI");
        assert!(provider.models().iter().any(|m| m.id == "gpt-4o"));
        assert!(provider.models().iter().all(|m| m.pricing.is_some()));
    }

    #[test]
    fn test_empty_key_is_accepted_at_construction() {
        assert!(OpenAiProvider::new(ProviderConfig::new("openai")).is_ok());
    }

    #[test]
    fn test_system_prompt_goes_inline() {
        let request = ChatRequest::new(vec![Message::user("hi")])
            .with_system_prompt("be brief")
            .with_max_tokens(20);
        let body = serde_json::to_value(provider().build_request(&request, "gpt-4o", false)).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["max_tokens"], 20);
        assert!(body.get("stream").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_stream_request_asks_for_usage() {
        let request = ChatRequest::new(vec![Message::user("hi")]);
        let body = serde_json::to_value(provider().build_request(&request, "gpt-4o", true)).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_decoder_deltas_usage_and_done() {
        let mut decoder = OpenAiDecoder::new("openai");
        assert_eq!(
            decoder
                .decode_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#)
                .unwrap(),
            vec![StreamEvent::Delta("Hel".to_string())]
        );
        assert!(decoder
            .decode_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#)
            .unwrap()
            .is_empty());
        assert!(decoder
            .decode_line(r#"data: {"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#)
            .unwrap()
            .is_empty());
        assert_eq!(
            decoder.decode_line("data: [DONE]").unwrap(),
            vec![StreamEvent::Done {
                usage: Some(TokenUsage::new(3, 2)),
                finish_reason: Some(FinishReason::Stop),
            }]
        );
    }

    #[test]
    fn test_decoder_skips_noise() {
        let mut decoder = OpenAiDecoder::new("openai");
        assert!(decoder.decode_line("").unwrap().is_empty());
        assert!(decoder.decode_line(": keep-alive").unwrap().is_empty());
        assert!(decoder.decode_line("data: {not json").unwrap().is_empty());
    }

    #[test]
    fn test_decoder_surfaces_stream_error() {
        let mut decoder = OpenAiDecoder::new("openai");
        let err = decoder
            .decode_line(r#"data: {"error":{"message":"overloaded","code":"server_error"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn test_decoder_numeric_error_code() {
        let mut decoder = OpenAiDecoder::new("openai");
        let err = decoder
            .decode_line(r#"data: {"error":{"message":"context too long","code":400}}"#)
            .unwrap_err();
        match err {
            ProviderError::Provider { message, code, .. } => {
                assert_eq!(message, "context too long");
                assert_eq!(code.as_deref(), Some("400"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_convert_response_without_content() {
        let parsed: OpenAiChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null},"finish_reason":"stop"}]}"#).unwrap();
        let err = convert_response("openai", parsed, "gpt-4o").unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
    }
}
