//! LLM backend client and process handle against a mock backend.

use napier::backend::LlmBackend;
use napier::llm::{ChatMessage, LlmError, OllamaClient};
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn backend_with_models(models: &[&str]) -> MockServer {
    let server = MockServer::start().await;
    let models: Vec<_> = models.iter().map(|m| json!({"name": m, "size": 1})).collect();
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": models })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_list_models_and_is_running() {
    let server = backend_with_models(&["llama3:latest", "mistral"]).await;
    let client = OllamaClient::new(&server.uri()).unwrap();

    assert!(client.is_running().await);
    assert_eq!(client.list_models().await.unwrap(), ["llama3:latest", "mistral"]);
}

#[tokio::test]
async fn test_is_running_false_on_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let client = OllamaClient::new(&server.uri()).unwrap();
    assert!(!client.is_running().await);
}

/// Multi-turn history is sent whole, non-streamed; the assistant content comes back.
#[tokio::test]
async fn test_chat_sends_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_json(json!({
            "model": "llama3",
            "messages": [
                {"role": "user", "content": "Hi"},
                {"role": "assistant", "content": "Hello"},
                {"role": "user", "content": "2+2?"}
            ],
            "stream": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama3",
            "message": {"role": "assistant", "content": "4"},
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;
    let client = OllamaClient::new(&server.uri()).unwrap();

    let history = vec![
        ChatMessage::user("Hi"),
        ChatMessage::assistant("Hello"),
        ChatMessage::user("2+2?"),
    ];
    assert_eq!(client.chat("llama3", &history).await.unwrap(), "4");
}

#[tokio::test]
async fn test_chat_error_status_keeps_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
        .mount(&server)
        .await;
    let client = OllamaClient::new(&server.uri()).unwrap();

    let err = client
        .chat("nope", &[ChatMessage::user("Hi")])
        .await
        .unwrap_err();
    match err {
        LlmError::Status { status, body } => {
            assert_eq!(status.as_u16(), 404);
            assert_eq!(body, "model not found");
        }
        other => panic!("expected Status error, got {other:?}"),
    }
}

/// Absent model → one pull; present model → none.
#[tokio::test]
async fn test_ensure_model_pulls_only_when_missing() {
    let server = backend_with_models(&["llama3"]).await;
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .and(body_partial_json(json!({"name": "gemma:2b", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
        .expect(1)
        .mount(&server)
        .await;
    let client = OllamaClient::new(&server.uri()).unwrap();

    client.ensure_model("llama3").await;
    client.ensure_model("gemma:2b").await;
}

#[tokio::test]
async fn test_pull_failure_is_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .respond_with(ResponseTemplate::new(500).set_body_string("pull model manifest: file does not exist"))
        .mount(&server)
        .await;
    let client = OllamaClient::new(&server.uri()).unwrap();
    assert!(matches!(client.pull("nope").await, Err(LlmError::Status { .. })));
}

/// A backend that already answers is used as is; nothing is spawned or owned.
#[tokio::test]
async fn test_backend_start_when_already_running() {
    let server = backend_with_models(&[]).await;
    let client = OllamaClient::new(&server.uri()).unwrap();
    let mut backend = LlmBackend::new(client).with_program("napier-no-such-binary");

    assert!(backend.start().await.unwrap());
    assert!(!backend.is_managed());
    backend.stop().await;
}
