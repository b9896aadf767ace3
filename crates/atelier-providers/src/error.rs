//! Error types for the providers module
//!
//! Provider failures are classified once, at the HTTP boundary, into the
//! variants below. The manager's retry and fallback policy keys off
//! [`ErrorKind`], so classification must stay consistent across backends.

use std::time::Duration;

use reqwest::{header::HeaderMap, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::error;

/// Machine-checkable category of a [`ProviderError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No provider could be resolved for the request
    NoProvider,
    /// A named provider is not registered
    NotFound,
    /// A provider with the same name is already registered
    DuplicateProvider,
    /// Bad or missing credentials
    Authentication,
    /// The backend throttled the request
    RateLimit,
    /// Transport or connectivity failure, including timeouts
    Network,
    /// Any other backend failure
    Provider,
    /// Invalid configuration
    Config,
    /// A backend payload could not be decoded
    Parse,
    /// Every retry and fallback was exhausted without a concrete error
    AllFailed,
}

impl ErrorKind {
    /// Stable code string for display layers
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NoProvider => "NO_PROVIDER",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::DuplicateProvider => "DUPLICATE_PROVIDER",
            ErrorKind::Authentication => "AUTH_ERROR",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::Provider => "PROVIDER_ERROR",
            ErrorKind::Config => "CONFIG_ERROR",
            ErrorKind::Parse => "PARSE_ERROR",
            ErrorKind::AllFailed => "ALL_FAILED",
        }
    }
}

/// Errors that can occur when interacting with providers
#[derive(Debug, Error, PartialEq, Clone)]
pub enum ProviderError {
    /// No provider registered, or the requested one is unknown
    #[error("No provider available{}", .requested.as_ref().map(|n| format!(": {}", n)).unwrap_or_default())]
    NoProvider { requested: Option<String> },

    /// Provider not found by name
    #[error("Provider not found: {0}")]
    NotFound(String),

    /// Provider name already taken
    #[error("Provider already registered: {0}")]
    DuplicateProvider(String),

    /// Authentication failed (never includes key details)
    #[error("Authentication failed for provider {provider}")]
    Authentication { provider: String },

    /// Rate limited by provider
    #[error("Rate limited by provider {provider}{}", .retry_after.map(|d| format!(", retry after {} seconds", d.as_secs())).unwrap_or_default())]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    /// Network error occurred
    #[error("Network error from provider {provider}: {message}")]
    Network { provider: String, message: String },

    /// Generic provider error
    #[error("Provider error from {provider}: {message}")]
    Provider {
        provider: String,
        message: String,
        code: Option<String>,
        status: Option<u16>,
    },

    /// Configuration error
    #[error("Configuration error for provider {provider}: {message}")]
    Config { provider: String, message: String },

    /// A providers file could not be read or parsed
    #[error("Configuration file error: {0}")]
    ConfigFile(String),

    /// A response body could not be decoded
    #[error("Parse error from provider {provider}: {message}")]
    Parse { provider: String, message: String },

    /// Every avenue was exhausted without a recorded error
    #[error("All providers failed: {0}")]
    AllFailed(String),
}

impl ProviderError {
    /// Shorthand for a generic provider error without status or code
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Provider {
            provider: provider.into(),
            message: message.into(),
            code: None,
            status: None,
        }
    }

    /// Shorthand for a network error
    pub fn network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Network {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a configuration error
    pub fn config(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Config {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a parse error
    pub fn parse(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Parse {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::NoProvider { .. } => ErrorKind::NoProvider,
            ProviderError::NotFound(_) => ErrorKind::NotFound,
            ProviderError::DuplicateProvider(_) => ErrorKind::DuplicateProvider,
            ProviderError::Authentication { .. } => ErrorKind::Authentication,
            ProviderError::RateLimited { .. } => ErrorKind::RateLimit,
            ProviderError::Network { .. } => ErrorKind::Network,
            ProviderError::Provider { .. } => ErrorKind::Provider,
            ProviderError::Config { .. } | ProviderError::ConfigFile(_) => ErrorKind::Config,
            ProviderError::Parse { .. } => ErrorKind::Parse,
            ProviderError::AllFailed(_) => ErrorKind::AllFailed,
        }
    }

    /// Stable code string, e.g. `AUTH_ERROR`
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Name of the provider the error originated from, if any
    pub fn provider_name(&self) -> Option<&str> {
        match self {
            ProviderError::NoProvider { requested } => requested.as_deref(),
            ProviderError::NotFound(name) | ProviderError::DuplicateProvider(name) => Some(name),
            ProviderError::Authentication { provider }
            | ProviderError::RateLimited { provider, .. }
            | ProviderError::Network { provider, .. }
            | ProviderError::Provider { provider, .. }
            | ProviderError::Config { provider, .. }
            | ProviderError::Parse { provider, .. } => Some(provider),
            ProviderError::ConfigFile(_) | ProviderError::AllFailed(_) => None,
        }
    }

    /// Server-suggested wait before retrying, for rate-limit errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether the manager may retry the same provider after this error
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Authentication
                | ErrorKind::NoProvider
                | ErrorKind::NotFound
                | ErrorKind::DuplicateProvider
                | ErrorKind::Config
        )
    }
}

/// Error envelope shared by the OpenAI and Anthropic APIs, and the flat
/// `{"error": "..."}` shape used by Ollama
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Nested { error: ErrorDetail },
    Flat { error: String },
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<serde_json::Value>,
}

/// Backend error codes arrive as strings or numbers
pub(crate) fn backend_code(code: serde_json::Value) -> String {
    match code {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Parse a `retry-after` header expressed in seconds
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Classify a non-success HTTP response
pub fn classify_status(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ProviderError {
    match status.as_u16() {
        401 => ProviderError::Authentication {
            provider: provider.to_string(),
        },
        429 => ProviderError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        code => {
            let (message, backend_code) = match serde_json::from_str::<ErrorBody>(body) {
                Ok(ErrorBody::Nested { error }) => (
                    error.message.unwrap_or_else(|| body.to_string()),
                    error.code.map(backend_code).or(error.error_type),
                ),
                Ok(ErrorBody::Flat { error }) => (error, None),
                Err(_) if body.trim().is_empty() => (status.to_string(), None),
                Err(_) => (body.trim().to_string(), None),
            };
            ProviderError::Provider {
                provider: provider.to_string(),
                message,
                code: backend_code,
                status: Some(code),
            }
        }
    }
}

/// Classify a transport-level failure raised by reqwest
pub fn classify_transport(provider: &str, err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::network(provider, "Request timeout")
    } else if err.is_connect() || err.is_request() {
        ProviderError::network(provider, err.to_string())
    } else if err.is_decode() {
        ProviderError::parse(provider, err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(provider, status, None, "")
    } else {
        ProviderError::provider(provider, err.to_string())
    }
}

/// Pass a successful response through, or read and classify a failed one
pub async fn check_response(provider: &str, response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    error!("{} API error ({}): {}", provider, status, body);
    Err(classify_status(provider, status, retry_after, &body))
}
