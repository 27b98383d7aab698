use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::eviction::SweepReport;
use crate::engine::hub::Subscription;
use crate::engine::types::{ChangeEvent, LifecycleEvent, WorkflowHandle, WorkflowRecord};

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum EventResponse {
    Started(WorkflowHandle),
    Applied { applied: bool },
}

#[derive(Deserialize)]
pub struct RegisterProcessRequest {
    pub pid: u32,
    #[serde(default)]
    pub sub_agent_pid: Option<u32>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

// --- Handlers ---

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<WorkflowRecord>>, AppError> {
    Ok(Json(state.handle.snapshot().await?))
}

/// GET /workflows/{name}
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<WorkflowRecord>, AppError> {
    state
        .handle
        .snapshot_one(&name)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Workflow '{}' not found", name)))
}

/// DELETE /workflows/{name}
pub async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.handle.delete(&name).await? {
        return Err(AppError::NotFound(format!("Workflow '{}' not found", name)));
    }
    Ok(Json(serde_json::json!({ "deleted": name })))
}

/// POST /events
///
/// A `start` answers with the workflow handle; every other event answers
/// `{"applied": true}` or 404 when it names an unknown workflow.
pub async fn post_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<LifecycleEvent>,
) -> Result<Json<EventResponse>, AppError> {
    if let LifecycleEvent::Start {
        name,
        total_steps,
        execution_id,
        correlation_seed,
    } = event
    {
        if name.trim().is_empty() {
            return Err(AppError::BadRequest(
                "Workflow name must not be empty".to_string(),
            ));
        }
        let handle = state
            .handle
            .start(&name, total_steps, execution_id, correlation_seed)
            .await?;
        return Ok(Json(EventResponse::Started(handle)));
    }

    let name = event.workflow_name().to_string();
    if !state.handle.apply(event).await? {
        return Err(AppError::NotFound(format!("Workflow '{}' not found", name)));
    }
    Ok(Json(EventResponse::Applied { applied: true }))
}

/// GET /events/stream
///
/// Server-sent events: a `snapshot` first, then every change in order.
pub async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let subscription = state.handle.subscribe().await?;
    Ok(Sse::new(subscription_stream(subscription)).keep_alive(KeepAlive::default()))
}

fn subscription_stream(subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(subscription, |mut subscription| async move {
        let change = subscription.recv().await?;
        Some((Ok(to_sse(&change)), subscription))
    })
}

fn to_sse(change: &ChangeEvent) -> Event {
    Event::default()
        .event(change.kind.as_str())
        .json_data(change)
        .unwrap_or_else(|e| {
            warn!(kind = %change.kind, error = %e, "Failed to encode change event");
            Event::default().event(change.kind.as_str()).data("{}")
        })
}

/// POST /sweep
pub async fn sweep(State(state): State<Arc<AppState>>) -> Result<Json<SweepReport>, AppError> {
    Ok(Json(state.handle.sweep_now().await?))
}

/// PUT /processes/{execution_id}
pub async fn register_process(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
    Json(req): Json<RegisterProcessRequest>,
) -> Result<StatusCode, AppError> {
    state.processes.register(&execution_id, req.pid)?;
    state
        .processes
        .set_sub_agent(&execution_id, req.sub_agent_pid)?;
    if let Some(code) = req.exit_code {
        state.processes.mark_exited(&execution_id, code)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /processes/{execution_id}
pub async fn remove_process(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state.processes.remove(&execution_id)? {
        return Err(AppError::NotFound(format!(
            "Process for execution '{}' not found",
            execution_id
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}
