//! End-to-End Test Suite: provider orchestration over HTTP
//!
//! Builds a manager from a providers file pointing at mock backends and
//! drives provider switching, retry with fallback, streaming and usage
//! reporting through the public API.

use std::io::Write;

use atelier_providers::{
    ChatRequest, ErrorKind, Message, Provider, ProviderManager, ProvidersFile,
};
use futures::StreamExt;
use serde_json::json;
use tempfile::NamedTempFile;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}

/// Write a providers file for an OpenAI-style and an Ollama-style mock
fn providers_file(openai_url: &str, ollama_url: &str) -> NamedTempFile {
    let yaml = format!(
        r#"
manager:
  retry_attempts: 3
  retry_delay_ms: 10
  fallback_providers: [openai, local]
providers:
  - kind: openai
    name: openai
    api_key: sk-e2e
    base_url: {openai_url}
    default_model: gpt-4o-mini
  - kind: ollama
    name: local
    base_url: {ollama_url}
    default_model: llama3.2
"#
    );
    let mut file = NamedTempFile::new().expect("Failed to create providers file");
    file.write_all(yaml.as_bytes())
        .expect("Failed to write providers file");
    file
}

fn manager_for(file: &NamedTempFile) -> ProviderManager {
    let loaded = ProvidersFile::load_from_file(file.path()).expect("Failed to load providers file");
    ProviderManager::from_configs(loaded.manager_config(), loaded.providers)
}

fn request(text: &str) -> ChatRequest {
    ChatRequest::new(vec![Message::user(text)])
}

/// Primary keeps failing with server errors, so the manager retries it and
/// then answers from the local fallback.
#[tokio::test]
async fn test_retry_then_fallback_workflow() {
    init_tracing();
    let mut openai = mockito::Server::new_async().await;
    let mut ollama = mockito::Server::new_async().await;

    let failing = openai
        .mock("POST", "/chat/completions")
        .with_status(503)
        .with_body(r#"{"error":{"message":"overloaded","type":"server_error"}}"#)
        .expect(3)
        .create_async()
        .await;
    ollama
        .mock("GET", "/api/tags")
        .with_status(200)
        .with_body(r#"{"models":[{"name":"llama3.2:latest"}]}"#)
        .create_async()
        .await;
    let local_chat = ollama
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_body(
            json!({
                "message": {"role": "assistant", "content": "served locally"},
                "done": true,
                "prompt_eval_count": 6,
                "eval_count": 3
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let file = providers_file(&openai.url(), &ollama.url());
    let manager = manager_for(&file);
    assert_eq!(manager.active_provider_name().as_deref(), Some("openai"));

    let response = manager
        .send_message(&request("explain lifetimes"), None)
        .await
        .expect("fallback should answer");
    assert_eq!(response.content, "served locally");
    assert_eq!(response.model, "llama3.2");

    failing.assert_async().await;
    local_chat.assert_async().await;

    let openai_stats = manager.usage_stats("openai").unwrap();
    assert_eq!(openai_stats.total_requests, 3);
    assert_eq!(openai_stats.error_rate(), 1.0);

    let local_stats = manager.usage_stats("local").unwrap();
    assert_eq!(local_stats.total_tokens, 9);
    assert_eq!(local_stats.total_cost, 0.0);

    assert_eq!(manager.total_usage_stats().total_requests, 4);
}

/// Switching the active provider routes requests and streams to it
#[tokio::test]
async fn test_provider_switching_and_streaming() {
    init_tracing();
    let mut openai = mockito::Server::new_async().await;
    let ollama = mockito::Server::new_async().await;

    let sse = [
        r#"data: {"choices":[{"delta":{"content":"fn "}}]}"#,
        r#"data: {"choices":[{"delta":{"content":"main()"},"finish_reason":"stop"}]}"#,
        r#"data: {"choices":[],"usage":{"prompt_tokens":4,"completion_tokens":2}}"#,
        "data: [DONE]",
    ]
    .join("\n\n");
    openai
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-e2e")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse)
        .create_async()
        .await;

    let file = providers_file(&openai.url(), &ollama.url());
    let manager = manager_for(&file);

    manager.set_active("local").unwrap();
    assert_eq!(manager.active_provider().unwrap().name(), "local");
    assert_eq!(
        manager.set_active("missing").unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(manager.active_provider_name().as_deref(), Some("local"));

    manager.set_active("openai").unwrap();
    let chunks: Vec<_> = manager
        .send_message_stream(&request("write main"), None)
        .await
        .expect("stream should open")
        .collect()
        .await;

    let last = chunks.last().unwrap().as_ref().unwrap();
    assert!(last.finished);
    assert_eq!(last.content, "fn main()");
    assert_eq!(last.model, "gpt-4o-mini");
    assert_eq!(chunks.len(), 3);

    let stats = manager.usage_stats("openai").unwrap();
    assert_eq!(stats.total_tokens, 6);
    assert!(stats.total_cost > 0.0);
}

/// Status checks run per provider and reflect reachability
#[tokio::test]
async fn test_status_overview() {
    init_tracing();
    let mut openai = mockito::Server::new_async().await;
    let mut ollama = mockito::Server::new_async().await;

    openai
        .mock("GET", "/models")
        .with_status(401)
        .with_body(r#"{"error":{"message":"bad key"}}"#)
        .create_async()
        .await;
    ollama
        .mock("GET", "/api/tags")
        .with_status(200)
        .with_body(r#"{"models":[]}"#)
        .create_async()
        .await;

    let file = providers_file(&openai.url(), &ollama.url());
    let manager = manager_for(&file);

    let statuses = manager.get_all_statuses().await;
    let names: Vec<_> = statuses.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["openai", "local"]);
    assert!(!statuses[0].1.available);
    assert!(statuses[1].1.available);

    assert!(!manager.validate_provider_config("openai").await.unwrap());
    assert!(manager.validate_provider_config("local").await.unwrap());

    let cost = manager.estimate_cost(&request(&"x".repeat(4000)), Some("openai"));
    assert!(cost > 0.0);
    assert_eq!(manager.estimate_cost(&request("hi"), Some("local")), 0.0);
}
