#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use napier::config::{Document, MemoryStore, ToolDescriptor};
use napier::control::ControlPlane;
use napier::llm::OllamaClient;
use napier::tools::ToolRegistry;

/// Nothing listens here; connections are refused immediately.
pub const UNREACHABLE_URL: &str = "http://127.0.0.1:9";

pub struct TestDir {
    // Keep TempDir alive so dir isn't deleted until struct drop
    _tmp: TempDir,
    pub root: PathBuf,
}

impl TestDir {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let root = tmp.path().to_path_buf();
        Self { _tmp: tmp, root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config").join("napier_config.json")
    }
}

/// A tool server speaking the `/status`, `/capabilities`, `/actions/{action}` protocol.
pub struct MockTool {
    pub server: MockServer,
}

impl MockTool {
    /// Answers `/status` with 200.
    pub async fn up() -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;
        Self { server }
    }

    pub fn url(&self) -> String {
        self.server.uri()
    }

    pub async fn with_capabilities(self, caps: &[&str]) -> Self {
        Mock::given(method("GET"))
            .and(path("/capabilities"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "capabilities": caps })),
            )
            .mount(&self.server)
            .await;
        self
    }

    pub async fn with_capabilities_status(self, status: u16) -> Self {
        Mock::given(method("GET"))
            .and(path("/capabilities"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
        self
    }

    pub async fn with_action(self, action: &str, status: u16, body: Value) -> Self {
        Mock::given(method("POST"))
            .and(path(format!("/actions/{action}")))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&self.server)
            .await;
        self
    }
}

pub fn tool(id: &str, url: &str) -> ToolDescriptor {
    ToolDescriptor {
        url: Some(url.to_string()),
        ..ToolDescriptor::new(id)
    }
}

pub fn document_with(tools: Vec<ToolDescriptor>) -> Document {
    let mut doc = Document::default();
    doc.tools = tools;
    doc
}

pub fn registry_with(tools: Vec<ToolDescriptor>) -> (Arc<MemoryStore>, Arc<ToolRegistry>) {
    let store = Arc::new(MemoryStore::new(document_with(tools)));
    let registry = Arc::new(ToolRegistry::new(store.clone()));
    registry.initialize();
    (store, registry)
}

pub fn plane_with(tools: Vec<ToolDescriptor>, llm_url: &str) -> Arc<ControlPlane> {
    let (_, registry) = registry_with(tools);
    let llm = OllamaClient::new(llm_url).expect("llm client");
    Arc::new(ControlPlane::new(registry, llm))
}
