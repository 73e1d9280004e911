//! LLM backend client (Ollama HTTP API): model list, chat, pull, raw chat proxy.
//!
//! No streaming; every request asks for a single JSON response.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// Default backend base URL.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Local models can take minutes for a long answer.
const CHAT_TIMEOUT: Duration = Duration::from_secs(300);
/// Pulls download gigabytes.
const PULL_TIMEOUT: Duration = Duration::from_secs(3600);

/// Chat message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm config: {0}")]
    Config(String),
    #[error("llm http: {0}")]
    Http(String),
    #[error("llm status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("llm parse: {0}")]
    Parse(String),
}

// --- Request/response (raw API shape for serde) ---

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}

#[derive(Serialize)]
struct PullRequest<'a> {
    name: &'a str,
    stream: bool,
}

// --- Client ---

#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Result<Self, LlmError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(LlmError::Config("base url is empty".into()));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::Config(format!("reqwest client: {e}")))?;
        Ok(Self {
            base_url: base_url.to_string(),
            client,
        })
    }

    #[inline]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// True when `/api/tags` answers 200.
    pub async fn is_running(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map(|r| r.status() == StatusCode::OK)
            .unwrap_or(false)
    }

    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let res = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        let text = check_status(res).await?;
        let tags: TagsResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::Parse(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// One non-streamed chat turn; returns the assistant's content.
    pub async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let body = ChatRequest {
            model,
            messages,
            stream: false,
        };
        let res = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(CHAT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        let text = check_status(res).await?;
        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::Parse(e.to_string()))?;
        parsed
            .message
            .map(|m| m.content)
            .ok_or_else(|| LlmError::Parse("response has no message".into()))
    }

    /// Forward a caller-built chat body unchanged. Streaming is turned off unless the caller set it.
    pub async fn chat_raw(&self, mut body: Value) -> Result<Value, LlmError> {
        if let Some(obj) = body.as_object_mut() {
            obj.entry("stream").or_insert(Value::Bool(false));
        }
        let res = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(CHAT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        let text = check_status(res).await?;
        serde_json::from_str(&text).map_err(|e| LlmError::Parse(e.to_string()))
    }

    pub async fn pull(&self, name: &str) -> Result<(), LlmError> {
        info!(model = name, "pulling model");
        let res = self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .timeout(PULL_TIMEOUT)
            .json(&PullRequest {
                name,
                stream: false,
            })
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        check_status(res).await?;
        info!(model = name, "model pulled");
        Ok(())
    }

    /// Pull `name` unless the backend already lists it. Failures are logged, not returned.
    pub async fn ensure_model(&self, name: &str) {
        match self.list_models().await {
            Ok(models) if models.iter().any(|m| m == name) => {}
            Ok(_) => {
                warn!(model = name, "model not found; pulling");
                if let Err(e) = self.pull(name).await {
                    warn!(model = name, error = %e, "failed to pull model");
                }
            }
            Err(e) => warn!(model = name, error = %e, "could not list models"),
        }
    }
}

async fn check_status(res: reqwest::Response) -> Result<String, LlmError> {
    let status = res.status();
    let text = res
        .text()
        .await
        .map_err(|e| LlmError::Http(e.to_string()))?;
    if !status.is_success() {
        return Err(LlmError::Status { status, body: text });
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_shape() {
        let messages = vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello")];
        let body = ChatRequest {
            model: "llama3",
            messages: &messages,
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "llama3");
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][1]["role"], "assistant");
        assert_eq!(json["messages"][1]["content"], "Hello");
    }

    #[test]
    fn new_trims_base_url() {
        let c = OllamaClient::new(" http://localhost:11434/ ").unwrap();
        assert_eq!(c.base_url(), "http://localhost:11434");
        assert!(matches!(OllamaClient::new(""), Err(LlmError::Config(_))));
    }

    #[test]
    fn tags_without_models_is_empty() {
        let tags: TagsResponse = serde_json::from_str("{}").unwrap();
        assert!(tags.models.is_empty());
    }
}
