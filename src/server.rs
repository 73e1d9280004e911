//! Control API: a small HTTP surface over the shared [`ControlPlane`].
//!
//! Runs on its own task next to the interactive session. Handlers never hold a
//! registry lock across an await; every tool call goes through cloned clients.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::ToolDescriptor;
use crate::control::{ControlError, ControlPlane, ToolState};
use crate::tools::EnsureOutcome;

pub mod error;

pub use error::ApiError;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Running control API. Shuts down when dropped.
pub struct Server {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Server {
    /// Bind `addr` and serve in the background.
    pub async fn start(plane: Arc<ControlPlane>, addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let app = router(plane);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "control API stopped with error");
            }
        });
        info!(%addr, "control API listening");

        Ok(Server {
            addr,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&mut self) {
        if let Some(sender) = self.shutdown.take() {
            let _ = sender.send(());
            info!("control API shut down");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub fn router(plane: Arc<ControlPlane>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/", get(root))
        .route("/tools", get(list_tools))
        .route("/tools/status", get(tools_status))
        .route("/tools/capabilities", get(tools_capabilities))
        .route("/tools/:id", get(get_tool))
        .route("/tools/:id/start", post(start_tool))
        .route("/tools/:id/state", get(tool_state))
        .route("/tools/:id/actions/:action", post(execute_action))
        .route("/chat", post(chat))
        .with_state(plane)
        .layer(cors)
}

#[derive(Serialize)]
struct ToolsResponse {
    tools: Vec<ToolDescriptor>,
}

#[derive(Serialize)]
struct StatusResponse {
    checked_at: String,
    tools: BTreeMap<String, bool>,
}

#[derive(Serialize)]
struct CapabilitiesResponse {
    capabilities: BTreeMap<String, Vec<String>>,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Serialize)]
struct StateResponse {
    id: String,
    #[serde(flatten)]
    state: ToolState,
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "NAPIER MCP Host API is running",
        "status": "active",
    }))
}

async fn list_tools(State(plane): State<Arc<ControlPlane>>) -> Json<ToolsResponse> {
    Json(ToolsResponse {
        tools: plane.tool_views(),
    })
}

async fn tools_status(State(plane): State<Arc<ControlPlane>>) -> Json<StatusResponse> {
    let tools = plane.registry().check_all_connections().await;
    Json(StatusResponse {
        checked_at: chrono::Utc::now().to_rfc3339(),
        tools,
    })
}

async fn tools_capabilities(State(plane): State<Arc<ControlPlane>>) -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        capabilities: plane.registry().get_all_capabilities().await,
    })
}

async fn get_tool(
    State(plane): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> ApiResult<ToolDescriptor> {
    plane
        .registry()
        .descriptor(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Tool {id} not found")))
}

async fn start_tool(
    State(plane): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> ApiResult<MessageResponse> {
    let name = plane
        .registry()
        .descriptor(&id)
        .map(|t| t.display_name().to_string())
        .unwrap_or_else(|| id.clone());
    let message = match plane.ensure_tool(&id).await {
        Ok((_, EnsureOutcome::AlreadyRunning)) => format!("Tool {name} is already running"),
        Ok((_, EnsureOutcome::Started)) => format!("Tool {name} started successfully"),
        Err(ControlError::Lifecycle(e)) => {
            return Err(ApiError::internal(format!("Failed to start tool {name}: {e}")));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Json(MessageResponse { message }))
}

async fn tool_state(
    State(plane): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> Json<StateResponse> {
    let state = plane.tool_state(&id).await;
    Json(StateResponse { id, state })
}

/// Body is passed through as the action's parameters; an empty body means `{}`.
async fn execute_action(
    State(plane): State<Arc<ControlPlane>>,
    Path((id, action)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Value> {
    let params = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {e}")))?
    };
    let value = plane.registry().execute_action(&id, &action, params).await?;
    Ok(Json(value))
}

async fn chat(State(plane): State<Arc<ControlPlane>>, body: Bytes) -> ApiResult<Value> {
    let missing = || ApiError::bad_request("Request must include 'model' and 'messages'");
    let request: Value = serde_json::from_slice(&body).map_err(|_| missing())?;
    let complete = request
        .as_object()
        .is_some_and(|o| o.contains_key("model") && o.contains_key("messages"));
    if !complete {
        return Err(missing());
    }
    let reply = plane.llm().chat_raw(request).await?;
    Ok(Json(reply))
}
