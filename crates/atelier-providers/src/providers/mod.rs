//! Provider implementations for the supported backends

pub mod anthropic;
pub mod ollama;
pub mod openai;

pub use anthropic::{AnthropicDecoder, AnthropicProvider};
pub use ollama::{OllamaDecoder, OllamaProvider, PullProgress, PullStream};
pub use openai::{OpenAiDecoder, OpenAiProvider};
