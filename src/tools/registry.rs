//! Tool registry: id → client, kept in step with the persisted document.
//!
//! One lock guards both the in-memory map and the document copy it was built
//! from. Mutations build the next document, write it through the store, and only
//! then swap it in, so memory is never ahead of disk.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{ConfigError, Document, DocumentStore, ToolDescriptor};
use crate::tools::client::{ActionError, ToolClient};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool id is required")]
    MissingId,
    #[error("tool {0} not found")]
    UnknownId(String),
    #[error("failed to persist tool registry: {0}")]
    WriteThrough(#[from] ConfigError),
}

#[derive(Default)]
struct RegistryState {
    document: Document,
    clients: BTreeMap<String, ToolClient>,
}

/// Registry of configured tools. Thread-safe; share it behind an `Arc`.
pub struct ToolRegistry {
    store: Arc<dyn DocumentStore>,
    http: reqwest::Client,
    state: RwLock<RegistryState>,
}

impl ToolRegistry {
    /// Empty registry over `store`. Call [`ToolRegistry::initialize`] to load it.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_http(store, reqwest::Client::new())
    }

    pub fn with_http(store: Arc<dyn DocumentStore>, http: reqwest::Client) -> Self {
        Self {
            store,
            http,
            state: RwLock::new(RegistryState {
                document: Document::empty(),
                clients: BTreeMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Shared HTTP client handed to every tool client.
    #[inline]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// (Re)load the document and rebuild the client map from its active, addressable tools.
    /// Duplicate ids collapse to their last entry. Returns the number of registered tools.
    pub fn initialize(&self) -> usize {
        let mut guard = self.write();
        let mut document = self.store.load();
        for id in document.dedup_tools() {
            warn!(tool = %id, "duplicate tool id in configuration; keeping the last entry");
        }
        let mut clients = BTreeMap::new();
        for tool in &document.tools {
            if !tool.is_active() {
                continue;
            }
            if tool.id.is_empty() {
                warn!(name = ?tool.name, "skipping tool without id");
                continue;
            }
            clients.insert(tool.id.clone(), self.client_for(tool));
            info!(tool = %tool.display_name(), "initialized tool client");
        }
        let count = clients.len();
        *guard = RegistryState { document, clients };
        count
    }

    fn client_for(&self, descriptor: &ToolDescriptor) -> ToolClient {
        ToolClient::new(descriptor.clone(), self.http.clone())
    }

    pub fn get(&self, id: &str) -> Option<ToolClient> {
        self.read().clients.get(id).cloned()
    }

    pub fn list_all(&self) -> BTreeMap<String, ToolClient> {
        self.read().clients.clone()
    }

    /// Sorted ids of registered (active) tools.
    pub fn ids(&self) -> Vec<String> {
        self.read().clients.keys().cloned().collect()
    }

    pub fn document(&self) -> Document {
        self.read().document.clone()
    }

    /// Persisted descriptor for `id`, active or not.
    pub fn descriptor(&self, id: &str) -> Option<ToolDescriptor> {
        self.read().document.find_tool(id).cloned()
    }

    /// Every addressable persisted descriptor, in document order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.read().document.addressable_tools().cloned().collect()
    }

    /// Register `descriptor`, replacing any persisted entry with the same id.
    pub fn add(&self, descriptor: ToolDescriptor) -> Result<(), RegistryError> {
        if descriptor.id.trim().is_empty() {
            error!("tool id is required");
            return Err(RegistryError::MissingId);
        }
        let mut guard = self.write();
        let mut next = guard.document.clone();
        next.tools.retain(|t| t.id != descriptor.id);
        next.tools.push(descriptor.clone());
        self.persist(&next)?;

        guard.document = next;
        if descriptor.is_active() {
            guard
                .clients
                .insert(descriptor.id.clone(), self.client_for(&descriptor));
        } else {
            guard.clients.remove(&descriptor.id);
        }
        info!(tool = %descriptor.display_name(), "added tool");
        Ok(())
    }

    /// Remove `id` from the document and the map.
    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let mut guard = self.write();
        if !guard.clients.contains_key(id) && guard.document.find_tool(id).is_none() {
            warn!(tool = id, "tool not found");
            return Err(RegistryError::UnknownId(id.to_string()));
        }
        let mut next = guard.document.clone();
        next.tools.retain(|t| t.id != id);
        self.persist(&next)?;

        guard.document = next;
        guard.clients.remove(id);
        info!(tool = id, "removed tool");
        Ok(())
    }

    /// Apply `edit` to a copy of the document, write it through, then commit and rebuild clients.
    pub fn update_document<F>(&self, edit: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Document),
    {
        let mut guard = self.write();
        let mut next = guard.document.clone();
        edit(&mut next);
        self.persist(&next)?;

        let clients = next
            .addressable_tools()
            .filter(|t| t.is_active())
            .map(|t| (t.id.clone(), self.client_for(t)))
            .collect();
        *guard = RegistryState {
            document: next,
            clients,
        };
        Ok(())
    }

    fn persist(&self, next: &Document) -> Result<(), RegistryError> {
        self.store.save(next).map_err(|e| {
            error!(error = %e, location = %self.store.location(), "error saving configuration");
            RegistryError::WriteThrough(e)
        })
    }

    /// Probe every registered tool concurrently.
    pub async fn check_all_connections(&self) -> BTreeMap<String, bool> {
        let mut set = JoinSet::new();
        for (id, client) in self.list_all() {
            set.spawn(async move { (id, client.check_connection().await) });
        }
        let mut results = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, up)) => {
                    results.insert(id, up);
                }
                Err(e) => error!(error = %e, "connection check task failed"),
            }
        }
        results
    }

    /// Capabilities of every reachable tool; unreachable tools are left out.
    pub async fn get_all_capabilities(&self) -> BTreeMap<String, Vec<String>> {
        let mut set = JoinSet::new();
        for (id, client) in self.list_all() {
            set.spawn(async move {
                if client.check_connection().await {
                    Some((id, client.connected_capabilities().await))
                } else {
                    None
                }
            });
        }
        let mut results = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some((id, caps))) => {
                    results.insert(id, caps);
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "capability task failed"),
            }
        }
        results
    }

    /// Run `action` on tool `id`. Unknown ids fail without any network call.
    pub async fn execute_action(
        &self,
        id: &str,
        action: &str,
        params: Value,
    ) -> Result<Value, ActionError> {
        let Some(client) = self.get(id) else {
            error!(tool = id, "tool not found");
            return Err(ActionError::NotFound(id.to_string()));
        };
        client.execute_action(action, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;

    fn registry_with(tools: Vec<ToolDescriptor>) -> (Arc<MemoryStore>, ToolRegistry) {
        let mut doc = Document::default();
        doc.tools = tools;
        let store = Arc::new(MemoryStore::new(doc));
        let registry = ToolRegistry::new(store.clone());
        registry.initialize();
        (store, registry)
    }

    #[test]
    fn initialize_skips_inactive_and_unnamed_tools() {
        let (_, reg) = registry_with(vec![
            ToolDescriptor::new("a"),
            ToolDescriptor {
                active: Some(false),
                ..ToolDescriptor::new("b")
            },
            ToolDescriptor {
                name: Some("orphan".into()),
                ..ToolDescriptor::default()
            },
        ]);
        assert_eq!(reg.ids(), vec!["a"]);
        assert!(reg.descriptor("b").is_some(), "inactive tools stay addressable");
        assert_eq!(reg.descriptors().len(), 2);
    }

    #[test]
    fn add_rejects_empty_id_without_saving() {
        let (store, reg) = registry_with(vec![]);
        let err = reg.add(ToolDescriptor::new("  ")).unwrap_err();
        assert!(matches!(err, RegistryError::MissingId));
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn add_existing_id_replaces_single_entry() {
        let (store, reg) = registry_with(vec![ToolDescriptor::new("a")]);
        reg.add(ToolDescriptor {
            url: Some("http://localhost:9".into()),
            ..ToolDescriptor::new("a")
        })
        .unwrap();
        let saved = store.snapshot();
        assert_eq!(saved.tools.len(), 1);
        assert_eq!(saved.tools[0].url.as_deref(), Some("http://localhost:9"));
        assert_eq!(
            reg.get("a").and_then(|c| c.url().map(String::from)),
            Some("http://localhost:9".to_string())
        );
    }

    #[test]
    fn remove_unknown_id_fails() {
        let (_, reg) = registry_with(vec![]);
        assert!(matches!(reg.remove("nope"), Err(RegistryError::UnknownId(id)) if id == "nope"));
    }

    #[test]
    fn remove_inactive_tool_by_id() {
        let (store, reg) = registry_with(vec![ToolDescriptor {
            active: Some(false),
            ..ToolDescriptor::new("b")
        }]);
        reg.remove("b").unwrap();
        assert!(store.snapshot().tools.is_empty());
    }

    #[test]
    fn failed_update_leaves_document_unchanged() {
        let (store, reg) = registry_with(vec![]);
        store.set_fail_saves(true);
        let err = reg
            .update_document(|d| d.default_model = Some("mistral".into()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::WriteThrough(_)));
        assert_eq!(reg.document().default_model(), "llama3");
    }

    #[test]
    fn duplicate_ids_resolve_to_last_entry_everywhere() {
        let (_, reg) = registry_with(vec![
            ToolDescriptor {
                url: Some("http://first:1".into()),
                ..ToolDescriptor::new("x")
            },
            ToolDescriptor {
                url: Some("http://second:2".into()),
                ..ToolDescriptor::new("x")
            },
        ]);
        assert_eq!(reg.descriptors().len(), 1);
        assert_eq!(
            reg.descriptor("x").and_then(|t| t.url),
            Some("http://second:2".to_string())
        );
        assert_eq!(
            reg.get("x").and_then(|c| c.url().map(String::from)),
            Some("http://second:2".to_string())
        );
    }

    #[test]
    fn update_document_rebuilds_clients() {
        let (_, reg) = registry_with(vec![ToolDescriptor::new("a")]);
        reg.update_document(|d| d.tools.push(ToolDescriptor::new("c")))
            .unwrap();
        assert_eq!(reg.ids(), vec!["a", "c"]);
    }
}
