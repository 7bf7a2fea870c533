//! HTTP and WebSocket façade.
//!
//! Thin handlers over the stores, the checkpoint manager, and the event
//! bus hooks. The only writes that originate here are task creation and
//! checkpoint resolution; everything else is read-only.

use crate::{
    checkpoints::CheckpointManager,
    config::Settings,
    memory::{MemoryClient, MemoryNamespace},
    models::{AgentRecord, AgentRole, Checkpoint, CostBreakdown, Task, TaskStatus},
    reactor::EventBus,
    spawner::AgentSpawner,
    store::{CostStore, StateStore, TaskStore},
    LegatusError,
};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "legatus-orchestrator";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_HEALTH: &str = "/health";
const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASK_HISTORY: &str = "/tasks/history";
const ROUTE_TASK_BY_ID: &str = "/tasks/{task_id}";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_CHECKPOINTS: &str = "/checkpoints";
const ROUTE_CHECKPOINT_BY_ID: &str = "/checkpoints/{checkpoint_id}";
const ROUTE_CHECKPOINT_APPROVE: &str = "/checkpoints/{checkpoint_id}/approve";
const ROUTE_CHECKPOINT_REJECT: &str = "/checkpoints/{checkpoint_id}/reject";
const ROUTE_LOGS: &str = "/logs";
const ROUTE_COSTS: &str = "/costs";
const ROUTE_MEMORY: &str = "/memory";
const ROUTE_MEMORY_SEARCH: &str = "/memory/search";
const ROUTE_MEMORY_BY_ID: &str = "/memory/{memory_id}";
const ROUTE_SYSTEM_PAUSE: &str = "/system/pause";
const ROUTE_SYSTEM_RESUME: &str = "/system/resume";
const ROUTE_SYSTEM_STATUS: &str = "/system/status";
const ROUTE_WS: &str = "/ws";

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub tasks: TaskStore,
    pub state: StateStore,
    pub costs: CostStore,
    pub checkpoints: CheckpointManager,
    pub memory: MemoryClient,
    pub spawner: Arc<AgentSpawner>,
    pub event_bus: Arc<EventBus>,
}

pub struct ApiServer {
    state: AppState,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub prompt: String,
    pub title: Option<String>,
    pub project: Option<String>,
    /// Bypass PM decomposition and spawn a dev agent directly.
    #[serde(default)]
    pub direct: bool,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RejectQuery {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CostsQuery {
    pub project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MemoryQuery {
    pub namespace: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MemorySearchQuery {
    pub query: String,
    pub namespace: Option<String>,
    pub project_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct SystemStatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub paused: bool,
    pub agents: usize,
    pub pending_checkpoints: usize,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn internal_error(e: LegatusError) -> ApiError {
    error!("API handler error: {}", e);
    match e {
        LegatusError::TaskNotFound(_)
        | LegatusError::CheckpointNotFound(_)
        | LegatusError::NotFound(_) => api_error(StatusCode::NOT_FOUND, e.to_string()),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn run(&self) -> crate::Result<()> {
        let app = self.build_router();

        let addr = format!(
            "{}:{}",
            self.state.settings.orchestrator.host, self.state.settings.orchestrator.port
        );
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| LegatusError::Internal(e.into()))?;
        info!("API server listening on {}", addr);

        axum::serve(listener, app)
            .await
            .map_err(|e| LegatusError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route(ROUTE_HEALTH, get(health))
            .route(ROUTE_TASKS, post(create_task).get(list_tasks))
            .route(ROUTE_TASK_HISTORY, get(task_history))
            .route(ROUTE_TASK_BY_ID, get(get_task))
            .route(ROUTE_AGENTS, get(list_agents))
            .route(ROUTE_CHECKPOINTS, get(list_checkpoints))
            .route(ROUTE_CHECKPOINT_BY_ID, get(get_checkpoint))
            .route(ROUTE_CHECKPOINT_APPROVE, post(approve_checkpoint))
            .route(ROUTE_CHECKPOINT_REJECT, post(reject_checkpoint))
            .route(ROUTE_LOGS, get(get_logs))
            .route(ROUTE_COSTS, get(get_costs))
            .route(ROUTE_MEMORY, get(list_memories))
            .route(ROUTE_MEMORY_SEARCH, get(search_memories))
            .route(ROUTE_MEMORY_BY_ID, delete(delete_memory))
            .route(ROUTE_SYSTEM_PAUSE, post(pause_system))
            .route(ROUTE_SYSTEM_RESUME, post(resume_system))
            .route(ROUTE_SYSTEM_STATUS, get(system_status))
            .route(ROUTE_WS, get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "status": "ok",
    }))
}

/// Create a campaign and spawn its first agent: PM for decomposition, or
/// a dev agent directly when `direct` is set.
async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "prompt must not be empty"));
    }

    let title = req
        .title
        .clone()
        .unwrap_or_else(|| req.prompt.chars().take(80).collect());
    let mut task = Task::new(title, req.prompt.clone());
    task.prompt = Some(req.prompt.clone());
    task.project = req.project.clone();

    let task = state.tasks.create(task).await.map_err(internal_error)?;
    state
        .tasks
        .update_status(&task.id, TaskStatus::Planned, "orchestrator", "auto-planned")
        .await
        .map_err(internal_error)?;

    let role = if req.direct { AgentRole::Dev } else { AgentRole::Pm };
    let agent = state
        .spawner
        .spawn_agent(&task, role, None)
        .await
        .map_err(|e| {
            error!("Failed to spawn {} agent for task {}: {}", role, task.id, e);
            api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Failed to spawn agent container: {e}"),
            )
        })?;

    state.state.set_agent(&agent).await.map_err(internal_error)?;
    state
        .tasks
        .update_status(
            &task.id,
            TaskStatus::Active,
            "orchestrator",
            &format!("agent={} role={}", agent.id, role),
        )
        .await
        .map_err(internal_error)?;

    let mut task = state
        .tasks
        .get_required(&task.id)
        .await
        .map_err(internal_error)?;
    task.assigned_to = Some(agent.id.clone());
    let task = state.tasks.update(task).await.map_err(internal_error)?;

    Ok(Json(task))
}

async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.tasks.list_all().await.map_err(internal_error)?))
}

/// Finished tasks (done or rejected) by most recent activity.
async fn task_history(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let limit = query.limit.unwrap_or(20);
    let mut finished: Vec<Task> = state
        .tasks
        .list_all()
        .await
        .map_err(internal_error)?
        .into_iter()
        .filter(|t| t.status.is_terminal())
        .collect();
    finished.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    finished.truncate(limit);
    Ok(Json(finished))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    match state.tasks.get(&task_id).await.map_err(internal_error)? {
        Some(task) => Ok(Json(task)),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Task {task_id} not found"),
        )),
    }
}

async fn list_agents(State(state): State<AppState>) -> Result<Json<Vec<AgentRecord>>, ApiError> {
    Ok(Json(state.state.list_agents().await.map_err(internal_error)?))
}

async fn list_checkpoints(
    State(state): State<AppState>,
) -> Result<Json<Vec<Checkpoint>>, ApiError> {
    Ok(Json(
        state.checkpoints.get_pending().await.map_err(internal_error)?,
    ))
}

async fn get_checkpoint(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<String>,
) -> Result<Json<Checkpoint>, ApiError> {
    match state
        .checkpoints
        .get(&checkpoint_id)
        .await
        .map_err(internal_error)?
    {
        Some(cp) => Ok(Json(cp)),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Checkpoint {checkpoint_id} not found"),
        )),
    }
}

async fn approve_checkpoint(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<String>,
) -> Result<Json<Checkpoint>, ApiError> {
    let cp = state
        .checkpoints
        .approve(&checkpoint_id)
        .await
        .map_err(internal_error)?;

    // The hook decides what the approval means. A hook failure does not
    // undo the recorded resolution.
    if let Err(e) = state
        .event_bus
        .on_checkpoint_approved(&cp.task_id, cp.source_role)
        .await
    {
        error!("Checkpoint approval hook failed for {}: {}", cp.id, e);
    }

    Ok(Json(cp))
}

async fn reject_checkpoint(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<String>,
    Query(query): Query<RejectQuery>,
) -> Result<Json<Checkpoint>, ApiError> {
    let reason = query.reason.unwrap_or_default();
    let cp = state
        .checkpoints
        .reject(&checkpoint_id, &reason)
        .await
        .map_err(internal_error)?;

    if let Err(e) = state
        .event_bus
        .on_checkpoint_rejected(&cp.task_id, cp.source_role, &reason)
        .await
    {
        error!("Checkpoint rejection hook failed for {}: {}", cp.id, e);
    }

    Ok(Json(cp))
}

async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let limit = query.limit.unwrap_or(50);
    Ok(Json(state.state.get_logs(limit).await.map_err(internal_error)?))
}

async fn get_costs(
    State(state): State<AppState>,
    Query(query): Query<CostsQuery>,
) -> Result<Json<CostBreakdown>, ApiError> {
    Ok(Json(
        state
            .costs
            .get_breakdown(query.project_id.as_deref())
            .await
            .map_err(internal_error)?,
    ))
}

async fn list_memories(
    State(state): State<AppState>,
    Query(query): Query<MemoryQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let ns = MemoryNamespace::from_query(
        query.namespace.as_deref().unwrap_or("project"),
        query.project_id.as_deref(),
    );
    // Memory is advisory; an unreachable service reads as empty.
    match state.memory.list(&ns).await {
        Ok(memories) => Ok(Json(memories)),
        Err(e) => {
            warn!("Memory service unavailable: {}", e);
            Ok(Json(Vec::new()))
        }
    }
}

async fn search_memories(
    State(state): State<AppState>,
    Query(query): Query<MemorySearchQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let ns = MemoryNamespace::from_query(
        query.namespace.as_deref().unwrap_or("project"),
        query.project_id.as_deref(),
    );
    match state
        .memory
        .search(&query.query, &ns, query.limit.unwrap_or(10))
        .await
    {
        Ok(memories) => Ok(Json(memories)),
        Err(e) => {
            warn!("Memory service unavailable: {}", e);
            Ok(Json(Vec::new()))
        }
    }
}

async fn delete_memory(
    State(state): State<AppState>,
    Path(memory_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .memory
        .delete(&memory_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "deleted": memory_id })))
}

async fn pause_system(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.state.set_paused(true).await.map_err(internal_error)?;
    info!("Dispatch paused");
    Ok(Json(serde_json::json!({ "paused": true })))
}

async fn resume_system(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.state.set_paused(false).await.map_err(internal_error)?;
    info!("Dispatch resumed; re-scanning for ready work");
    if let Err(e) = state.event_bus.resume_dispatch().await {
        error!("Resume re-scan failed: {}", e);
    }
    Ok(Json(serde_json::json!({ "paused": false })))
}

async fn system_status(
    State(state): State<AppState>,
) -> Result<Json<SystemStatusResponse>, ApiError> {
    let paused = state.state.is_paused().await.map_err(internal_error)?;
    let agents = state.state.list_agents().await.map_err(internal_error)?;
    let pending = state.checkpoints.get_pending().await.map_err(internal_error)?;
    Ok(Json(SystemStatusResponse {
        service: SERVICE_NAME,
        version: SERVICE_VERSION,
        paused,
        agents: agents.len(),
        pending_checkpoints: pending.len(),
    }))
}

/// Stream every agent message to the client for the lifetime of the
/// connection.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: AppState) {
    let mut events = state.event_bus.subscribe_ws();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(json) => {
                        if socket.send(WsMessage::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged by {} messages", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            // Drain pings/messages from the client; a closed socket ends
            // the loop.
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
}
