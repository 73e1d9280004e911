//! Persisted tool-registry document: schema, defaults, file and in-memory stores.
//!
//! The document is decoded once into explicit structs. Keys this crate does not
//! know about are kept in `extra` maps so a load/save cycle leaves them intact.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

/// Config path used when neither `--config` nor `NAPIER_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/napier_config.json";

const DEFAULT_NAME: &str = "napier-cli";
const DEFAULT_DESCRIPTION: &str = "Local LLM agent with MCP capabilities";
const DEFAULT_MODEL: &str = "llama3";
const DEFAULT_VERSION: &str = "0.1.0";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_API_VERSION: &str = "v1";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io ({}): {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse ({}): {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config serialize: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("config store unavailable: {0}")]
    Unavailable(String),
}

// --- Schema ---

/// Root document: baseline settings plus the tool list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_host: Option<HostSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ollama: Option<OllamaSettings>,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `mcp_host` section: where the control API binds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `ollama` section: the LLM backend endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OllamaSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Document {
    /// The baseline document written when no config file exists yet.
    fn default() -> Self {
        Self {
            name: Some(DEFAULT_NAME.to_string()),
            description: Some(DEFAULT_DESCRIPTION.to_string()),
            default_model: Some(DEFAULT_MODEL.to_string()),
            version: Some(DEFAULT_VERSION.to_string()),
            mcp_host: Some(HostSettings {
                host: Some(DEFAULT_HOST.to_string()),
                port: Some(DEFAULT_PORT),
                extra: Map::new(),
            }),
            ollama: Some(OllamaSettings {
                url: Some(DEFAULT_OLLAMA_URL.to_string()),
                api_version: Some(DEFAULT_OLLAMA_API_VERSION.to_string()),
                extra: Map::new(),
            }),
            tools: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl Document {
    /// No settings and no tools. Returned in place of a document that failed to parse.
    pub fn empty() -> Self {
        Self {
            name: None,
            description: None,
            default_model: None,
            version: None,
            mcp_host: None,
            ollama: None,
            tools: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }

    pub fn display_description(&self) -> &str {
        self.description.as_deref().unwrap_or(DEFAULT_DESCRIPTION)
    }

    pub fn default_model(&self) -> &str {
        self.default_model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_MODEL)
    }

    /// `host:port` for the control API listener.
    pub fn host_addr(&self) -> String {
        let host = self
            .mcp_host
            .as_ref()
            .and_then(|h| h.host.as_deref())
            .unwrap_or(DEFAULT_HOST);
        let port = self
            .mcp_host
            .as_ref()
            .and_then(|h| h.port)
            .unwrap_or(DEFAULT_PORT);
        format!("{host}:{port}")
    }

    pub fn ollama_url(&self) -> &str {
        self.ollama
            .as_ref()
            .and_then(|o| o.url.as_deref())
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(DEFAULT_OLLAMA_URL)
    }

    /// Descriptors that can be addressed (non-empty id), in document order.
    pub fn addressable_tools(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter().filter(|t| !t.id.is_empty())
    }

    pub fn find_tool(&self, id: &str) -> Option<&ToolDescriptor> {
        self.addressable_tools().find(|t| t.id == id)
    }

    /// Keep only the last entry for each id, in place. Entries without an id are left alone.
    /// Returns the ids that had duplicates.
    pub fn dedup_tools(&mut self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        let mut duplicated = std::collections::BTreeSet::new();
        let mut kept = Vec::with_capacity(self.tools.len());
        for tool in std::mem::take(&mut self.tools).into_iter().rev() {
            if tool.id.is_empty() || seen.insert(tool.id.clone()) {
                kept.push(tool);
            } else {
                duplicated.insert(tool.id);
            }
        }
        kept.reverse();
        self.tools = kept;
        duplicated.into_iter().collect()
    }
}

/// A command given either as one string or as an argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Line(String),
    Argv(Vec<String>),
}

impl CommandLine {
    /// Argument vector for a direct launch: a string is split on whitespace, a list is used verbatim.
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Self::Argv(args) => args.clone(),
        }
    }

    /// Argument vector for a shell run: a string goes through the platform shell, a list is used verbatim.
    pub fn shell_argv(&self) -> Vec<String> {
        match self {
            Self::Line(line) if cfg!(windows) => {
                vec!["cmd".to_string(), "/C".to_string(), line.clone()]
            }
            Self::Line(line) => vec!["sh".to_string(), "-c".to_string(), line.clone()],
            Self::Argv(args) => args.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Line(line) => line.trim().is_empty(),
            Self::Argv(args) => args.is_empty(),
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Line(line) => f.write_str(line),
            Self::Argv(args) => f.write_str(&args.join(" ")),
        }
    }
}

/// One configured tool: identity, endpoint, static capabilities and launch recipe.
///
/// Only `id` is structurally required, and even that is checked by the registry
/// rather than by decoding: a missing, null or non-string id decodes as empty
/// and the entry is skipped at registration instead of failing the whole file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "String::is_empty"
    )]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<CommandLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_command: Option<CommandLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_directory: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Strings as is, numbers in their decimal form, anything else as no id.
fn lenient_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(id) => id,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

impl ToolDescriptor {
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// `name`, falling back to `id`.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.id)
    }

    /// Absent `active` means active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.unwrap_or(true)
    }

    #[inline]
    pub fn capabilities(&self) -> &[String] {
        self.capabilities.as_deref().unwrap_or(&[])
    }

    /// Base URL without trailing slash; `None` when unset or blank.
    pub fn base_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(|u| u.trim_end_matches('/'))
    }

    /// Working directory for launches; the current directory when unset.
    pub fn command_dir(&self) -> PathBuf {
        self.command_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Where the installation command runs; `command_dir()` when unset.
    pub fn installation_dir(&self) -> PathBuf {
        self.installation_directory
            .clone()
            .unwrap_or_else(|| self.command_dir())
    }
}

// --- Stores ---

/// Durable home of the document. `load` never fails; `save` reports why it could not persist.
pub trait DocumentStore: Send + Sync {
    fn load(&self) -> Document;
    fn save(&self, document: &Document) -> Result<(), ConfigError>;
    /// Human-readable location for logs and the interactive view.
    fn location(&self) -> String;
}

/// File-backed store with create-on-first-load and tmp+rename saves.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    #[inline]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document. A missing file is replaced by a persisted default; a corrupt one is an error
    /// and is left untouched on disk.
    pub fn read(&self) -> Result<Document, ConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let document = Document::default();
                self.save(&document)?;
                info!(path = %self.path.display(), "created default config");
                Ok(document)
            }
            Err(source) => Err(ConfigError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

impl DocumentStore for ConfigStore {
    fn load(&self) -> Document {
        match self.read() {
            Ok(document) => document,
            Err(e) => {
                error!(error = %e, "error loading configuration; using empty configuration");
                Document::empty()
            }
        }
    }

    fn save(&self, document: &Document) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let bytes = to_pretty_json(document)?;
        let tmp = self.tmp_path();
        std::fs::write(&tmp, &bytes).map_err(|source| ConfigError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| {
            let _ = std::fs::remove_file(&tmp);
            ConfigError::Io {
                path: self.path.clone(),
                source,
            }
        })
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Four-space indented JSON, the layout operators already edit by hand.
pub fn to_pretty_json(document: &Document) -> Result<Vec<u8>, ConfigError> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    document
        .serialize(&mut ser)
        .map_err(ConfigError::Serialize)?;
    out.push(b'\n');
    Ok(out)
}

/// In-memory store for embedding and tests. Saves can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<Option<Document>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new(document: Document) -> Self {
        Self {
            document: Mutex::new(Some(document)),
            fail_saves: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
        }
    }

    /// While set, every `save` returns `ConfigError::Unavailable` and keeps the previous document.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Last successfully saved (or initial) document.
    pub fn snapshot(&self) -> Document {
        self.document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self) -> Document {
        let mut guard = self.document.lock().unwrap_or_else(PoisonError::into_inner);
        guard.get_or_insert_with(Document::default).clone()
    }

    fn save(&self, document: &Document) -> Result<(), ConfigError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            warn!("memory store rejecting save");
            return Err(ConfigError::Unavailable("saves disabled".into()));
        }
        *self.document.lock().unwrap_or_else(PoisonError::into_inner) = Some(document.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults() {
        let t = ToolDescriptor::new("search");
        assert_eq!(t.display_name(), "search");
        assert!(t.is_active());
        assert!(t.capabilities().is_empty());
        assert!(t.base_url().is_none());
        assert_eq!(t.command_dir(), PathBuf::from("."));
        assert_eq!(t.installation_dir(), PathBuf::from("."));
    }

    #[test]
    fn descriptor_base_url_trims_trailing_slash() {
        let t = ToolDescriptor {
            url: Some(" http://localhost:3000/ ".into()),
            ..ToolDescriptor::new("a")
        };
        assert_eq!(t.base_url(), Some("http://localhost:3000"));
        let blank = ToolDescriptor {
            url: Some("   ".into()),
            ..ToolDescriptor::new("b")
        };
        assert!(blank.base_url().is_none());
    }

    #[test]
    fn command_line_string_or_list() {
        let line: CommandLine = serde_json::from_value(serde_json::json!("npm  run start")).unwrap();
        assert_eq!(line.argv(), vec!["npm", "run", "start"]);
        assert_eq!(line.shell_argv().last().map(String::as_str), Some("npm  run start"));

        let argv: CommandLine =
            serde_json::from_value(serde_json::json!(["node", "server.js", "--port 3000"])).unwrap();
        assert_eq!(argv.argv(), vec!["node", "server.js", "--port 3000"]);
        assert_eq!(argv.shell_argv(), argv.argv());
        assert!(CommandLine::Line("  ".into()).is_empty());
    }

    #[test]
    fn descriptor_keeps_unknown_fields_and_omits_absent_ones() {
        let raw = serde_json::json!({
            "id": "fs",
            "url": "http://localhost:3001",
            "vendor": {"tier": 2}
        });
        let t: ToolDescriptor = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(t.extra.get("vendor"), Some(&serde_json::json!({"tier": 2})));
        assert_eq!(serde_json::to_value(&t).unwrap(), raw);
    }

    #[test]
    fn document_accessors_fall_back_to_defaults() {
        let doc = Document::empty();
        assert_eq!(doc.default_model(), "llama3");
        assert_eq!(doc.host_addr(), "0.0.0.0:8000");
        assert_eq!(doc.ollama_url(), "http://localhost:11434");
        assert_eq!(doc.display_name(), "napier-cli");
    }

    #[test]
    fn find_tool_ignores_entries_without_id() {
        let mut doc = Document::empty();
        doc.tools.push(ToolDescriptor::default());
        doc.tools.push(ToolDescriptor::new("a"));
        assert_eq!(doc.addressable_tools().count(), 1);
        assert!(doc.find_tool("a").is_some());
        assert!(doc.find_tool("").is_none());
    }

    #[test]
    fn null_or_numeric_id_does_not_fail_decoding() {
        let doc: Document = serde_json::from_value(serde_json::json!({
            "tools": [{"id": null, "name": "orphan"}, {"id": 7}, {"id": ["x"]}]
        }))
        .unwrap();
        assert_eq!(doc.tools[0].id, "");
        assert_eq!(doc.tools[0].name.as_deref(), Some("orphan"));
        assert_eq!(doc.tools[1].id, "7");
        assert_eq!(doc.tools[2].id, "");
    }

    #[test]
    fn dedup_tools_keeps_last_entry_in_its_position() {
        let mut doc = Document::empty();
        doc.tools = vec![
            ToolDescriptor {
                url: Some("http://first:1".into()),
                ..ToolDescriptor::new("x")
            },
            ToolDescriptor::new("a"),
            ToolDescriptor::default(),
            ToolDescriptor {
                url: Some("http://second:2".into()),
                ..ToolDescriptor::new("x")
            },
            ToolDescriptor::default(),
        ];
        assert_eq!(doc.dedup_tools(), vec!["x"]);
        let ids: Vec<_> = doc.tools.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["a", "", "x", ""]);
        assert_eq!(doc.find_tool("x").unwrap().url.as_deref(), Some("http://second:2"));
    }

    #[test]
    fn pretty_json_uses_four_space_indent() {
        let bytes = to_pretty_json(&Document::default()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\n    \"name\": \"napier-cli\""));
    }

    #[test]
    fn memory_store_failing_save_keeps_previous_document() {
        let store = MemoryStore::new(Document::empty());
        let mut next = Document::empty();
        next.tools.push(ToolDescriptor::new("x"));
        store.set_fail_saves(true);
        assert!(matches!(store.save(&next), Err(ConfigError::Unavailable(_))));
        assert!(store.snapshot().tools.is_empty());
        store.set_fail_saves(false);
        store.save(&next).unwrap();
        assert_eq!(store.snapshot().tools.len(), 1);
        assert_eq!(store.save_count(), 1);
    }
}
