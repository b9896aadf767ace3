//! Ollama provider implementation
//!
//! Supports local model execution via Ollama. No API key is needed and no
//! cost is ever reported. Streaming responses are newline-delimited JSON
//! objects, the last of which carries `"done": true`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::ProviderConfig,
    error::{check_response, classify_transport, ProviderError},
    health_check::PROBE_TIMEOUT,
    models::{Capability, ChatRequest, ChatResponse, FinishReason, ModelDescriptor, TokenUsage},
    provider::{Billing, Provider, ProviderCore, ProviderKind},
    streaming::{decode_events, EventStream, LineBuffer, StreamDecoder, StreamEvent},
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
/// Upper bound on a model download
const PULL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Context window assumed for discovered models the catalog doesn't know
const DISCOVERED_CONTEXT_WINDOW: u32 = 4_096;
const DISCOVERED_MAX_TOKENS: u32 = 2_048;

static DEFAULT_MODELS: Lazy<Vec<ModelDescriptor>> = Lazy::new(|| {
    let caps = [Capability::Chat, Capability::Streaming];
    vec![
        ModelDescriptor::new("llama3.2", "Llama 3.2", 128_000, 4_096).with_capabilities(&caps),
        ModelDescriptor::new("mistral", "Mistral 7B", 32_768, 4_096).with_capabilities(&caps),
        ModelDescriptor::new("codellama", "Code Llama", 16_384, 4_096).with_capabilities(&caps),
        ModelDescriptor::new("qwen2.5-coder", "Qwen 2.5 Coder", 32_768, 4_096).with_capabilities(&caps),
    ]
});

/// Progress report of a model pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    /// Backend status text, `success` once the pull is complete
    pub status: String,
    /// Layer being downloaded
    #[serde(default)]
    pub digest: Option<String>,
    /// Layer size in bytes
    #[serde(default)]
    pub total: Option<u64>,
    /// Bytes downloaded so far
    #[serde(default)]
    pub completed: Option<u64>,
}

impl PullProgress {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// A stream of pull progress reports
pub type PullStream = BoxStream<'static, Result<PullProgress, ProviderError>>;

/// Ollama provider implementation
pub struct OllamaProvider {
    core: Arc<ProviderCore>,
    client: Arc<Client>,
}

impl OllamaProvider {
    /// Create a provider; unset fields take the local Ollama defaults
    pub fn new(mut config: ProviderConfig) -> Result<Self, ProviderError> {
        config.fill_defaults("Ollama", DEFAULT_BASE_URL, &DEFAULT_MODELS);
        let client = Client::builder()
            .build()
            .map_err(|e| ProviderError::config(&config.name, e.to_string()))?;

        Ok(Self {
            core: Arc::new(ProviderCore::new(config, Billing::Free)),
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

    fn build_request(&self, request: &ChatRequest, model: &str, stream: bool) -> OllamaChatRequest {
        let config = self.core.config();
        OllamaChatRequest {
            model: model.to_string(),
            messages: request
                .inline_messages()
                .into_iter()
                .map(|m| OllamaMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content,
                })
                .collect(),
            stream,
            options: OllamaOptions {
                temperature: request.temperature.or(config.temperature),
                num_predict: request.max_tokens.or(config.max_tokens),
            },
        }
    }

    async fn post_chat(&self, body: &OllamaChatRequest) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("api/chat"))
            .timeout(self.core.timeout_or(DEFAULT_TIMEOUT))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!("Ollama request failed: {}", e);
                classify_transport(self.name(), &e)
            })?;
        check_response(self.name(), response).await
    }

    async fn fetch_tags(&self, timeout: Duration) -> Result<OllamaTagsResponse, ProviderError> {
        let response = self
            .client
            .get(self.endpoint("api/tags"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_transport(self.name(), &e))?;
        check_response(self.name(), response)
            .await?
            .json()
            .await
            .map_err(|e| classify_transport(self.name(), &e))
    }

    /// Download a model, streaming progress until the backend reports
    /// `success`. A body that ends without it yields a network error.
    pub async fn pull_model(&self, model: &str) -> Result<PullStream, ProviderError> {
        info!("Pulling model {} via {}", model, self.name());
        let response = self
            .client
            .post(self.endpoint("api/pull"))
            .timeout(PULL_TIMEOUT)
            .json(&OllamaPullRequest {
                name: model.to_string(),
                stream: true,
            })
            .send()
            .await
            .map_err(|e| classify_transport(self.name(), &e))?;
        let response = check_response(self.name(), response).await?;

        let provider = self.name().to_string();
        let mut body = Box::pin(response.bytes_stream());
        let stream = async_stream::stream! {
            let mut buffer = LineBuffer::new();
            let mut exhausted = false;
            while !exhausted {
                let lines = match body.next().await {
                    Some(Ok(bytes)) => buffer.push(&bytes),
                    Some(Err(e)) => {
                        yield Err(classify_transport(&provider, &e));
                        return;
                    }
                    None => {
                        exhausted = true;
                        buffer.finish().into_iter().collect()
                    }
                };

                for line in lines {
                    match parse_pull_line(&provider, &line) {
                        Some(Ok(progress)) => {
                            let done = progress.is_success();
                            yield Ok(progress);
                            if done {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            yield Err(err);
                            return;
                        }
                        None => {}
                    }
                }
            }
            warn!("Pull from {} ended before completion", provider);
            yield Err(ProviderError::network(&provider, "pull ended before completion"));
        };
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn core(&self) -> &Arc<ProviderCore> {
        &self.core
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn requires_api_key(&self) -> bool {
        false
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        self.fetch_tags(PROBE_TIMEOUT).await.map(|_| ())
    }

    async fn chat(&self, request: &ChatRequest, model: &str) -> Result<ChatResponse, ProviderError> {
        let body = self.build_request(request, model, false);
        let response = self.post_chat(&body).await?;
        let parsed: OllamaChatChunk = response
            .json()
            .await
            .map_err(|e| classify_transport(self.name(), &e))?;

        if let Some(message) = parsed.error {
            return Err(ProviderError::provider(self.name(), message));
        }
        let usage = parsed.usage();
        let finish_reason = parsed.finish_reason();
        let content = parsed
            .message
            .map(|m| m.content)
            .ok_or_else(|| ProviderError::parse(self.name(), "No message in response"))?;

        Ok(ChatResponse {
            content,
            model: model.to_string(),
            usage,
            finish_reason: Some(finish_reason),
        })
    }

    async fn open_stream(&self, request: &ChatRequest, model: &str) -> Result<EventStream, ProviderError> {
        let body = self.build_request(request, model, true);
        let response = self.post_chat(&body).await?;
        let name = self.name().to_string();
        let bytes = response
            .bytes_stream()
            .map(move |read| read.map_err(|e| classify_transport(&name, &e)));
        Ok(decode_events(bytes, OllamaDecoder::new(self.name())))
    }

    /// Replace the catalog with the locally installed models, keeping known
    /// metadata for ids already in the catalog
    async fn refresh_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
        let tags = self.fetch_tags(self.core.timeout_or(DEFAULT_TIMEOUT)).await?;
        let known = self.core.models();

        let models: Vec<ModelDescriptor> = tags
            .models
            .into_iter()
            .map(|tag| {
                known
                    .iter()
                    .find(|m| m.id == tag.name || tag.name.strip_suffix(":latest") == Some(m.id.as_str()))
                    .map(|m| ModelDescriptor {
                        id: tag.name.clone(),
                        ..m.clone()
                    })
                    .unwrap_or_else(|| {
                        ModelDescriptor::new(
                            tag.name.clone(),
                            tag.name.clone(),
                            DISCOVERED_CONTEXT_WINDOW,
                            DISCOVERED_MAX_TOKENS,
                        )
                        .with_capabilities(&[Capability::Chat, Capability::Streaming])
                    })
            })
            .collect();

        debug!("Discovered {} models on {}", models.len(), self.name());
        self.core.replace_models(models.clone());
        Ok(models)
    }
}

fn parse_pull_line(provider: &str, line: &str) -> Option<Result<PullProgress, ProviderError>> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<OllamaPullLine>(line) {
        Ok(OllamaPullLine::Failed { error }) => Some(Err(ProviderError::provider(provider, error))),
        Ok(OllamaPullLine::Progress(progress)) => Some(Ok(progress)),
        Err(e) => {
            debug!("Skipping malformed pull line from {}: {}", provider, e);
            None
        }
    }
}

/// Decoder for newline-delimited chat chunks
pub struct OllamaDecoder {
    provider: String,
}

impl OllamaDecoder {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
        }
    }
}

impl StreamDecoder for OllamaDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamEvent>, ProviderError> {
        if line.trim().is_empty() {
            return Ok(vec![]);
        }

        let chunk: OllamaChatChunk = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("Skipping malformed stream line from {}: {}", self.provider, e);
                return Ok(vec![]);
            }
        };

        if let Some(message) = chunk.error {
            return Err(ProviderError::provider(&self.provider, message));
        }

        let mut events = Vec::new();
        if let Some(message) = chunk.message.as_ref() {
            events.push(StreamEvent::Delta(message.content.clone()));
        }
        if chunk.done {
            trace!("Stream completed with done flag");
            events.push(StreamEvent::Done {
                usage: chunk.usage(),
                finish_reason: Some(chunk.finish_reason()),
            });
        }
        Ok(events)
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

/// One `/api/chat` object, streamed or not
#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
    error: Option<String>,
}

impl OllamaChatChunk {
    fn usage(&self) -> Option<TokenUsage> {
        match (self.prompt_eval_count, self.eval_count) {
            (None, None) => None,
            (prompt, completion) => Some(TokenUsage::new(prompt.unwrap_or(0), completion.unwrap_or(0))),
        }
    }

    fn finish_reason(&self) -> FinishReason {
        match self.done_reason.as_deref() {
            Some("length") => FinishReason::Length,
            _ => FinishReason::Stop,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaTag {
    name: String,
}

#[derive(Debug, Serialize)]
struct OllamaPullRequest {
    name: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OllamaPullLine {
    Failed { error: String },
    Progress(PullProgress),
}
