//! Wire-level tests for the OpenAI provider against a mock server

use std::time::Duration;

use atelier_providers::{
    ChatRequest, ErrorKind, FinishReason, Message, OpenAiProvider, Provider, ProviderConfig,
    ProviderError,
};
use futures::stream::StreamExt;
use mockito::Matcher;
use serde_json::json;

fn provider_for(server: &mockito::Server) -> OpenAiProvider {
    OpenAiProvider::new(
        ProviderConfig::new("openai")
            .with_api_key("sk-test")
            .with_base_url(server.url()),
    )
    .unwrap()
}

fn request() -> ChatRequest {
    ChatRequest::new(vec![Message::user("Hello")])
        .with_model("gpt-4o-mini")
        .with_system_prompt("Be brief")
}

#[test]
fn test_defaults_are_filled() {
    let provider = OpenAiProvider::new(ProviderConfig::new("openai")).unwrap();
    let config = provider.config();
    assert_eq!(config.base_url, "https://api.openai.com/v1");
    assert_eq!(config.display_name, "OpenAI");
    assert!(provider.models().iter().any(|m| m.id == "gpt-4o"));
    assert!(provider.models().iter().all(|m| m.pricing.is_some()));
}

#[tokio::test]
async fn test_chat_completion() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({
            "model": "gpt-4o-mini",
            "messages": [
                {"role": "system", "content": "Be brief"},
                {"role": "user", "content": "Hello"}
            ]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "id": "chatcmpl-1",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hi there"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let provider = provider_for(&server);
    let response = provider.send_message(&request()).await.unwrap();

    mock.assert_async().await;
    assert_eq!(response.content, "Hi there");
    assert_eq!(response.model, "gpt-4o-mini");
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    assert_eq!(response.usage.unwrap().total_tokens, 15);

    let stats = provider.usage_stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_tokens, 15);
    // 12 * 0.00015 / 1000 + 3 * 0.0006 / 1000
    assert!((stats.total_cost - 0.0000036).abs() < 1e-12);
}

#[tokio::test]
async fn test_unauthorized_maps_to_authentication() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body(r#"{"error":{"message":"Incorrect API key provided: sk-test","type":"invalid_request_error"}}"#)
        .create_async()
        .await;

    let provider = provider_for(&server);
    let err = provider.send_message(&request()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert!(!err.to_string().contains("sk-test"));
    assert_eq!(provider.usage_stats().total_errors, 1);
}

#[tokio::test]
async fn test_too_many_requests_carries_retry_after() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_header("retry-after", "2")
        .with_body(r#"{"error":{"message":"Rate limit reached"}}"#)
        .create_async()
        .await;

    let err = provider_for(&server).send_message(&request()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimit);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
}

#[tokio::test]
async fn test_oversized_retry_after_is_ignored() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_header("retry-after", "1e20")
        .with_body(r#"{"error":{"message":"Rate limit reached"}}"#)
        .create_async()
        .await;

    let err = provider_for(&server).send_message(&request()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimit);
    assert_eq!(err.retry_after(), None);
}

#[tokio::test]
async fn test_server_error_keeps_backend_message() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(500)
        .with_body(r#"{"error":{"message":"The server had an error","type":"server_error"}}"#)
        .create_async()
        .await;

    match provider_for(&server).send_message(&request()).await.unwrap_err() {
        ProviderError::Provider { message, status, code, .. } => {
            assert_eq!(message, "The server had an error");
            assert_eq!(status, Some(500));
            assert_eq!(code.as_deref(), Some("server_error"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_choices_is_parse_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(r#"{"choices":[]}"#)
        .create_async()
        .await;

    let err = provider_for(&server).send_message(&request()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
}

#[tokio::test]
async fn test_streaming_chat() {
    let mut server = mockito::Server::new_async().await;
    let body = [
        r#"data: {"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#,
        "",
        r#"data: {"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#,
        "",
        "data: {not json",
        "",
        r#"data: {"choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
        "",
        r#"data: {"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
        "",
        "data: [DONE]",
        "",
    ]
    .join("\n");
    server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({
            "stream": true,
            "stream_options": {"include_usage": true}
        })))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let provider = provider_for(&server);
    let chunks: Vec<_> = provider
        .send_message_stream(&request())
        .await
        .unwrap()
        .collect()
        .await;

    let chunks: Vec<_> = chunks.into_iter().map(Result::unwrap).collect();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].delta, "Hel");
    assert_eq!(chunks[1].content, "Hello");
    assert!(chunks[2].finished);
    assert!(chunks[2].delta.is_empty());
    assert_eq!(chunks[2].content, "Hello");

    let stats = provider.usage_stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_tokens, 7);
}

#[tokio::test]
async fn test_stream_error_event_ends_stream() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
        "data: {\"error\":{\"message\":\"upstream failure\",\"code\":\"server_error\"}}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n",
    );
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let provider = provider_for(&server);
    let items: Vec<_> = provider
        .send_message_stream(&request())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap().content, "partial");
    assert!(items[1].as_ref().unwrap_err().to_string().contains("upstream failure"));
    assert_eq!(provider.usage_stats().total_errors, 1);
}

#[tokio::test]
async fn test_stream_error_with_numeric_code() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body("data: {\"error\":{\"message\":\"context too long\",\"code\":400}}\n\n")
        .create_async()
        .await;

    let provider = provider_for(&server);
    let items: Vec<_> = provider
        .send_message_stream(&request())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    match items[0].as_ref().unwrap_err() {
        ProviderError::Provider { message, code, .. } => {
            assert_eq!(message, "context too long");
            assert_eq!(code.as_deref(), Some("400"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(provider.usage_stats().total_errors, 1);
}

#[tokio::test]
async fn test_probe_and_validate() {
    let mut server = mockito::Server::new_async().await;
    let models = server
        .mock("GET", "/models")
        .match_header("authorization", "Bearer sk-test")
        .with_status(200)
        .with_body(r#"{"data":[{"id":"gpt-4o"}]}"#)
        .expect(2)
        .create_async()
        .await;

    let provider = provider_for(&server);
    let status = provider.get_status().await;
    assert!(status.available);
    assert!(status.response_time.is_some());
    assert!(provider.is_available().await);
    assert!(provider.validate_config().await);
    models.assert_async().await;
}

#[tokio::test]
async fn test_validate_rejects_missing_key() {
    let server = mockito::Server::new_async().await;
    let provider = OpenAiProvider::new(ProviderConfig::new("openai").with_base_url(server.url())).unwrap();
    assert!(!provider.validate_config().await);
}

#[tokio::test]
async fn test_unreachable_server_is_network_error() {
    let provider = OpenAiProvider::new(
        ProviderConfig::new("openai")
            .with_api_key("sk-test")
            .with_base_url("http://127.0.0.1:1"),
    )
    .unwrap();

    let err = provider.send_message(&request()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(!provider.get_status().await.available);
}

#[test]
fn test_estimate_cost_uses_catalog_pricing() {
    let provider = OpenAiProvider::new(ProviderConfig::new("openai")).unwrap();
    let request = ChatRequest::new(vec![Message::user("a".repeat(4000))])
        .with_model("gpt-4")
        .with_max_tokens(500);
    // 1000 input tokens at 0.03, 500 output tokens at 0.06
    assert!((provider.estimate_cost(&request) - 0.06).abs() < 1e-12);
}
