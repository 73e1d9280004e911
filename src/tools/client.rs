//! Per-tool HTTP adapter: `/status`, `/capabilities`, `/actions/{action}`.
//!
//! Every failure is converted at this boundary: liveness becomes `false`,
//! capability discovery falls back to the configured list, and actions return
//! a typed [`ActionError`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::ToolDescriptor;

/// Liveness probes must answer quickly or the tool counts as down.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(2);
/// Capability discovery and actions.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Tool {0} not found")]
    NotFound(String),
    #[error("Tool {0} is not connected")]
    NotConnected(String),
    #[error("Failed to execute action {action} on {tool}: {status}")]
    Status {
        tool: String,
        action: String,
        status: StatusCode,
        body: String,
    },
    #[error("Error executing action {action} on {tool}: {message}")]
    Transport {
        tool: String,
        action: String,
        message: String,
    },
    #[error("Invalid response for action {action} on {tool}: {message}")]
    Decode {
        tool: String,
        action: String,
        message: String,
    },
}

impl ActionError {
    /// Response body forwarded by the tool, if any.
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Status { body, .. } if !body.is_empty() => Some(body),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct CapabilitiesBody {
    capabilities: Vec<String>,
}

/// Stateless client for one tool. Cheap to clone; rebuilt whenever its descriptor changes.
#[derive(Debug, Clone)]
pub struct ToolClient {
    descriptor: Arc<ToolDescriptor>,
    http: reqwest::Client,
}

impl ToolClient {
    #[inline]
    pub fn new(descriptor: ToolDescriptor, http: reqwest::Client) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            http,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.descriptor.display_name()
    }

    #[inline]
    pub fn url(&self) -> Option<&str> {
        self.descriptor.base_url()
    }

    #[inline]
    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    /// `GET {url}/status`; true iff HTTP 200 within [`STATUS_TIMEOUT`].
    pub async fn check_connection(&self) -> bool {
        let Some(url) = self.url() else {
            error!(tool = %self.name(), "no URL defined for tool");
            return false;
        };
        let res = self
            .http
            .get(format!("{url}/status"))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await;
        match res {
            Ok(r) if r.status() == StatusCode::OK => {
                info!(tool = %self.name(), url, "connected");
                true
            }
            Ok(r) => {
                warn!(tool = %self.name(), url, status = %r.status(), "unexpected status from tool");
                false
            }
            Err(e) => {
                error!(tool = %self.name(), url, error = %e, "failed to connect to tool");
                false
            }
        }
    }

    /// Live capabilities when the tool answers, otherwise the configured list.
    pub async fn get_capabilities(&self) -> Vec<String> {
        if !self.check_connection().await {
            return self.descriptor.capabilities().to_vec();
        }
        self.connected_capabilities().await
    }

    /// Capability discovery for a tool the caller has just seen answer `/status`; `/status` is not asked again.
    pub async fn connected_capabilities(&self) -> Vec<String> {
        match self.fetch_capabilities().await {
            Ok(caps) => {
                info!(tool = %self.name(), ?caps, "got capabilities");
                caps
            }
            Err(reason) => {
                warn!(tool = %self.name(), %reason, "using configured capabilities");
                self.descriptor.capabilities().to_vec()
            }
        }
    }

    async fn fetch_capabilities(&self) -> Result<Vec<String>, String> {
        let url = self.url().ok_or("no URL")?;
        let res = self
            .http
            .get(format!("{url}/capabilities"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = res.status();
        if status != StatusCode::OK {
            return Err(format!("status {status}"));
        }
        let body: CapabilitiesBody = res.json().await.map_err(|e| e.to_string())?;
        Ok(body.capabilities)
    }

    /// `POST {url}/actions/{action}` with `params` as the JSON body. `Null` params send `{}`.
    pub async fn execute_action(&self, action: &str, params: Value) -> Result<Value, ActionError> {
        if !self.check_connection().await {
            return Err(ActionError::NotConnected(self.name().to_string()));
        }
        let url = self
            .url()
            .ok_or_else(|| ActionError::NotConnected(self.name().to_string()))?;
        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };
        let res = self
            .http
            .post(format!("{url}/actions/{action}"))
            .timeout(REQUEST_TIMEOUT)
            .json(&params)
            .send()
            .await
            .map_err(|e| {
                error!(tool = %self.name(), action, error = %e, "action request failed");
                ActionError::Transport {
                    tool: self.name().to_string(),
                    action: action.to_string(),
                    message: e.to_string(),
                }
            })?;

        let status = res.status();
        if status != StatusCode::OK {
            let body = res.text().await.unwrap_or_default();
            error!(tool = %self.name(), action, %status, "action failed");
            return Err(ActionError::Status {
                tool: self.name().to_string(),
                action: action.to_string(),
                status,
                body,
            });
        }
        let value = res.json::<Value>().await.map_err(|e| ActionError::Decode {
            tool: self.name().to_string(),
            action: action.to_string(),
            message: e.to_string(),
        })?;
        info!(tool = %self.name(), action, "action executed");
        Ok(value)
    }
}
