//! Data models for providers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::token_counter::estimate_tokens;

/// Information about an available model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Provider-specific model identifier used in requests
    pub id: String,
    /// Human-readable model name
    pub name: String,
    /// Maximum context window in tokens (input + output)
    pub context_window: u32,
    /// Default cap on output tokens
    pub max_tokens: u32,
    /// Model capabilities
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Optional pricing information
    #[serde(default)]
    pub pricing: Option<Pricing>,
}

impl ModelDescriptor {
    /// Create a chat model descriptor without pricing
    pub fn new(id: impl Into<String>, name: impl Into<String>, context_window: u32, max_tokens: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            context_window,
            max_tokens,
            capabilities: vec![Capability::Chat],
            pricing: None,
        }
    }

    /// Attach capabilities
    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    /// Attach per-1K-token pricing
    pub fn with_pricing(mut self, input_per_1k_tokens: f64, output_per_1k_tokens: f64) -> Self {
        self.pricing = Some(Pricing {
            input_per_1k_tokens,
            output_per_1k_tokens,
        });
        self
    }

    /// Whether the model advertises a capability
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Model capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Chat completion capability
    Chat,
    /// Vision/image understanding capability
    Vision,
    /// Function calling capability
    FunctionCalling,
    /// Streaming capability
    Streaming,
}

/// Pricing information for a model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Cost per 1K input tokens (in the provider's billing currency)
    pub input_per_1k_tokens: f64,
    /// Cost per 1K output tokens
    pub output_per_1k_tokens: f64,
}

impl Pricing {
    /// Cost of a prompt/completion token split
    pub fn cost(&self, input_tokens: f64, output_tokens: f64) -> f64 {
        input_tokens / 1000.0 * self.input_per_1k_tokens
            + output_tokens / 1000.0 * self.output_per_1k_tokens
    }
}

/// Role of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions for the model
    System,
    /// End-user input
    User,
    /// Model output
    Assistant,
}

impl MessageRole {
    /// Wire name shared by every supported backend
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// When the message was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Stamp the message with the current time
    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(Utc::now());
        self
    }
}

/// Chat completion request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Messages in the conversation, oldest first
    pub messages: Vec<Message>,
    /// Model to use; the provider's default when absent
    #[serde(default)]
    pub model: Option<String>,
    /// Temperature for sampling (typically 0.0 to 2.0)
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Maximum tokens to generate
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// System prompt kept apart from the message list
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Whether the caller wants a streamed response
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Create a request from a conversation
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Total characters of prompt text, system prompt included
    pub fn prompt_chars(&self) -> usize {
        self.system_prompt.as_ref().map_or(0, |s| s.len())
            + self.messages.iter().map(|m| m.content.len()).sum::<usize>()
    }

    /// Rough prompt token estimate
    pub fn estimated_prompt_tokens(&self) -> u64 {
        estimate_tokens(self.prompt_chars())
    }

    /// Messages with the separate system prompt prepended as a system message,
    /// for backends that accept system content inline
    pub fn inline_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = self.system_prompt.as_ref().filter(|p| !p.is_empty()) {
            messages.push(Message::system(prompt.clone()));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }
}

/// Reason for chat completion finish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Model finished normally
    Stop,
    /// Maximum tokens reached
    Length,
    /// Output withheld by a content filter
    ContentFilter,
    /// Model requested a tool call
    ToolCalls,
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the prompt
    pub prompt_tokens: u64,
    /// Number of tokens in the completion
    pub completion_tokens: u64,
    /// Total tokens used
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Length-based estimate for backends that report no counts
    pub fn estimated(prompt_chars: usize, completion_chars: usize) -> Self {
        Self::new(estimate_tokens(prompt_chars), estimate_tokens(completion_chars))
    }
}

/// Chat completion response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Generated content
    pub content: String,
    /// Model actually used
    pub model: String,
    /// Token usage, when reported
    pub usage: Option<TokenUsage>,
    /// Reason for completion, when reported
    pub finish_reason: Option<FinishReason>,
}

/// One element of a streamed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Everything produced so far
    pub content: String,
    /// The increment this chunk adds
    pub delta: String,
    /// Set only on the final chunk, whose delta is empty
    pub finished: bool,
    /// Model producing the stream
    pub model: String,
}
