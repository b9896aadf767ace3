//! Atelier AI Providers - LLM provider orchestration
//!
//! This crate provides a uniform interface over OpenAI-style, Anthropic-style
//! and local Ollama chat APIs, and a manager that adds retry, rate-limit
//! backoff, provider fallback and per-provider usage accounting.

pub mod config;
pub mod error;
pub mod health_check;
pub mod models;
pub mod provider;
pub mod providers;
pub mod streaming;
pub mod token_counter;
pub mod usage;

// Re-export commonly used types
pub use config::{
    ManagerConfig, ProviderConfig, ProviderConfigPatch, ProviderEntry, ProvidersFile,
};
pub use error::{ErrorKind, ProviderError};
pub use health_check::{ProviderStatus, StatusCache};
pub use models::{
    Capability, ChatRequest, ChatResponse, FinishReason, Message, MessageRole, ModelDescriptor,
    Pricing, StreamChunk, TokenUsage,
};
pub use provider::{
    Billing, ChatStream, Provider, ProviderCore, ProviderKind, ProviderManager, ProviderRegistry,
};
pub use providers::{AnthropicProvider, OllamaProvider, OpenAiProvider, PullProgress, PullStream};
pub use streaming::{EventStream, LineBuffer, StreamDecoder, StreamEvent};
pub use token_counter::{estimate_text_tokens, estimate_tokens};
pub use usage::UsageStats;
