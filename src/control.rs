//! The control-plane context shared by the HTTP surface and the interactive session.
//!
//! Holds the registry, the lifecycle manager, the LLM client and the backend
//! process handle. Both front ends receive it explicitly; nothing is global.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::backend::{BackendError, LlmBackend};
use crate::config::ToolDescriptor;
use crate::llm::OllamaClient;
use crate::tools::{
    EnsureOutcome, LifecycleError, LifecycleManager, RegistryError, ToolClient, ToolRegistry,
};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Tool {0} not found")]
    UnknownTool(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Where one tool stands, as seen through the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ToolState {
    Unknown,
    Registered,
    Launching,
    /// Process alive at the last probe; `/status` not confirmed yet.
    Launched,
    Reachable,
    Failed { detail: String },
}

impl ToolState {
    fn after(result: &Result<EnsureOutcome, LifecycleError>) -> Self {
        match result {
            Ok(EnsureOutcome::AlreadyRunning) => Self::Reachable,
            Ok(EnsureOutcome::Started) => Self::Launched,
            Err(e) => Self::Failed {
                detail: e.to_string(),
            },
        }
    }
}

pub struct ControlPlane {
    registry: Arc<ToolRegistry>,
    lifecycle: LifecycleManager,
    llm: OllamaClient,
    backend: Mutex<LlmBackend>,
    /// Last recorded state per id, with the descriptor it was recorded for.
    states: RwLock<HashMap<String, (ToolDescriptor, ToolState)>>,
}

impl ControlPlane {
    /// Build over an already initialized registry.
    pub fn new(registry: Arc<ToolRegistry>, llm: OllamaClient) -> Self {
        let lifecycle = LifecycleManager::new(registry.http().clone());
        let backend = LlmBackend::new(llm.clone());
        Self {
            registry,
            lifecycle,
            llm,
            backend: Mutex::new(backend),
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleManager) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_backend(mut self, backend: LlmBackend) -> Self {
        self.backend = Mutex::new(backend);
        self
    }

    #[inline]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    #[inline]
    pub fn llm(&self) -> &OllamaClient {
        &self.llm
    }

    /// Persisted descriptors sorted by id.
    pub fn tool_views(&self) -> Vec<ToolDescriptor> {
        let mut tools = self.registry.descriptors();
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        tools
    }

    fn set_state(&self, descriptor: &ToolDescriptor, state: ToolState) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(descriptor.id.clone(), (descriptor.clone(), state));
    }

    fn forget_state(&self, id: &str) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// State recorded for exactly this descriptor. A record left by an earlier,
    /// different descriptor under the same id does not count.
    fn recorded_state(&self, descriptor: &ToolDescriptor) -> Option<ToolState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&descriptor.id)
            .filter(|(recorded_for, _)| recorded_for == descriptor)
            .map(|(_, state)| state.clone())
    }

    /// Register a tool and start its state history afresh.
    pub fn add_tool(&self, descriptor: ToolDescriptor) -> Result<(), RegistryError> {
        let id = descriptor.id.clone();
        self.registry.add(descriptor)?;
        self.forget_state(&id);
        Ok(())
    }

    /// Remove a tool along with its recorded state.
    pub fn remove_tool(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.remove(id)?;
        self.forget_state(id);
        Ok(())
    }

    /// Start tool `id` if it is not already answering.
    pub async fn ensure_tool(
        &self,
        id: &str,
    ) -> Result<(ToolDescriptor, EnsureOutcome), ControlError> {
        let descriptor = self
            .registry
            .descriptor(id)
            .ok_or_else(|| ControlError::UnknownTool(id.to_string()))?;
        let outcome = self.ensure_descriptor(&descriptor).await?;
        Ok((descriptor, outcome))
    }

    async fn ensure_descriptor(
        &self,
        descriptor: &ToolDescriptor,
    ) -> Result<EnsureOutcome, LifecycleError> {
        self.set_state(descriptor, ToolState::Launching);
        let result = self.lifecycle.ensure_running(descriptor).await;
        self.set_state(descriptor, ToolState::after(&result));
        result
    }

    /// Ensure every active tool concurrently. Results are in document order.
    pub async fn ensure_all(&self) -> Vec<(ToolDescriptor, Result<EnsureOutcome, LifecycleError>)> {
        let active: Vec<ToolDescriptor> = self
            .registry
            .descriptors()
            .into_iter()
            .filter(ToolDescriptor::is_active)
            .collect();
        if active.is_empty() {
            info!("no active tools configured");
            return Vec::new();
        }

        for tool in &active {
            self.set_state(tool, ToolState::Launching);
        }
        let mut set = JoinSet::new();
        for (index, tool) in active.iter().cloned().enumerate() {
            let lifecycle = self.lifecycle.clone();
            set.spawn(async move {
                let result = lifecycle.ensure_running(&tool).await;
                (index, tool, result)
            });
        }
        let mut done = Vec::with_capacity(active.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => done.push(entry),
                Err(e) => error!(error = %e, "ensure task failed"),
            }
        }
        done.sort_by_key(|(index, _, _)| *index);

        done.into_iter()
            .map(|(_, tool, result)| {
                if let Err(e) = &result {
                    warn!(tool = %tool.display_name(), error = %e, "tool failed to start");
                }
                self.set_state(&tool, ToolState::after(&result));
                (tool, result)
            })
            .collect()
    }

    /// Current state of `id`. A live `/status` answer wins over anything recorded except an in-flight launch.
    pub async fn tool_state(&self, id: &str) -> ToolState {
        let Some(descriptor) = self.registry.descriptor(id) else {
            self.forget_state(id);
            return ToolState::Unknown;
        };
        let recorded = self.recorded_state(&descriptor);
        if recorded == Some(ToolState::Launching) {
            return ToolState::Launching;
        }
        let client = ToolClient::new(descriptor, self.registry.http().clone());
        if client.check_connection().await {
            return ToolState::Reachable;
        }
        match recorded {
            Some(state @ (ToolState::Failed { .. } | ToolState::Launched)) => state,
            _ => ToolState::Registered,
        }
    }

    /// Persist a new default model.
    pub fn set_default_model(&self, model: &str) -> Result<(), RegistryError> {
        let model = model.to_string();
        self.registry
            .update_document(move |doc| doc.default_model = Some(model))
    }

    pub async fn start_backend(&self) -> Result<bool, BackendError> {
        self.backend.lock().await.start().await
    }

    pub async fn stop_backend(&self) {
        self.backend.lock().await.stop().await;
    }
}
