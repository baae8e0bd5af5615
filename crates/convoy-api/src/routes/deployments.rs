//! Deployment control surface routes.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use convoy_core::DeploymentId;
use convoy_core::deployment::{Deployment, DeploymentStatus};
use convoy_core::manifest::Manifest;
use convoy_core::store::ListFilter;
use convoy_engine::StatusSummary;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_deployment).get(list_deployments))
        .route("/{id}", get(get_deployment))
        .route("/{id}/status", get(get_status))
        .route("/{id}/events", get(get_events))
        .route("/{id}/start", post(start_deployment))
        .route("/{id}/pause", post(pause_deployment))
        .route("/{id}/resume", post(resume_deployment))
        .route("/{id}/cancel", post(cancel_deployment))
        .route("/{id}/rollback", post(rollback_deployment))
        .route("/{id}/approve", post(approve_deployment))
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    pub id: DeploymentId,
    pub name: String,
    pub namespace: String,
    pub status: DeploymentStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub manifest: Manifest,
}

impl From<Deployment> for DeploymentResponse {
    fn from(d: Deployment) -> Self {
        Self {
            id: d.id,
            name: d.name,
            namespace: d.namespace,
            status: d.status,
            created_by: d.created_by,
            created_at: d.created_at,
            updated_at: d.updated_at,
            manifest: d.manifest,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub namespace: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
    pub page_token: Option<String>,
}

fn default_page_size() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub deployments: Vec<DeploymentResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Replay events with seq strictly greater than this cursor.
    #[serde(default)]
    pub after: i64,
    #[serde(default = "default_event_limit")]
    pub limit: i64,
    /// Include per-device events.
    #[serde(default = "default_true")]
    pub include_device: bool,
}

fn default_event_limit() -> i64 {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub event_type: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<EventResponse>,
    /// Pass back as `after` to resume the stream.
    pub cursor: i64,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub id: DeploymentId,
    pub status: DeploymentStatus,
}

// ============================================================================
// Handlers
// ============================================================================

fn created_by(headers: &HeaderMap) -> String {
    headers
        .get("x-convoy-user")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

/// Accepts the raw manifest body, YAML or JSON.
async fn create_deployment(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AckResponse>, ApiError> {
    let deployment = state
        .orchestrator
        .create_deployment(&body, &created_by(&headers))
        .await?;
    Ok(Json(AckResponse {
        id: deployment.id,
        status: deployment.status,
    }))
}

async fn list_deployments(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<DeploymentStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let offset: i64 = match &query.page_token {
        Some(token) => token
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("invalid page token {:?}", token)))?,
        None => 0,
    };
    let limit = query.page_size.clamp(1, 500);

    let filter = ListFilter {
        namespace: query.namespace,
        status,
    };
    let deployments = state.orchestrator.list(&filter, limit, offset).await?;

    let next_page_token = if deployments.len() as i64 == limit {
        Some((offset + limit).to_string())
    } else {
        None
    };
    Ok(Json(ListResponse {
        deployments: deployments.into_iter().map(Into::into).collect(),
        next_page_token,
    }))
}

async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<DeploymentId>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let deployment = state.orchestrator.get_deployment(id).await?;
    Ok(Json(deployment.into()))
}

async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<DeploymentId>,
) -> Result<Json<StatusSummary>, ApiError> {
    let summary = state.orchestrator.get_status(id).await?;
    Ok(Json(summary))
}

async fn get_events(
    State(state): State<AppState>,
    Path(id): Path<DeploymentId>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let limit = query.limit.clamp(1, 1000);
    let events = state
        .orchestrator
        .events_after(id, query.after, limit)
        .await?;

    let mut cursor = query.after;
    let events: Vec<EventResponse> = events
        .into_iter()
        .inspect(|e| cursor = cursor.max(e.seq))
        .filter(|e| query.include_device || e.device_id.is_none())
        .map(|e| EventResponse {
            seq: e.seq,
            device_id: e.device_id,
            event_type: e.event_type.to_string(),
            message: e.message,
            created_at: e.created_at,
        })
        .collect();

    Ok(Json(EventsResponse { events, cursor }))
}

async fn start_deployment(
    State(state): State<AppState>,
    Path(id): Path<DeploymentId>,
) -> Result<Json<AckResponse>, ApiError> {
    state.orchestrator.start(id).await?;
    ack(&state, id).await
}

async fn pause_deployment(
    State(state): State<AppState>,
    Path(id): Path<DeploymentId>,
) -> Result<Json<AckResponse>, ApiError> {
    state.orchestrator.pause(id).await?;
    ack(&state, id).await
}

async fn resume_deployment(
    State(state): State<AppState>,
    Path(id): Path<DeploymentId>,
) -> Result<Json<AckResponse>, ApiError> {
    state.orchestrator.resume(id).await?;
    ack(&state, id).await
}

async fn cancel_deployment(
    State(state): State<AppState>,
    Path(id): Path<DeploymentId>,
) -> Result<Json<AckResponse>, ApiError> {
    state.orchestrator.cancel(id).await?;
    ack(&state, id).await
}

async fn rollback_deployment(
    State(state): State<AppState>,
    Path(id): Path<DeploymentId>,
) -> Result<Json<AckResponse>, ApiError> {
    state.orchestrator.rollback(id).await?;
    ack(&state, id).await
}

async fn approve_deployment(
    State(state): State<AppState>,
    Path(id): Path<DeploymentId>,
) -> Result<Json<AckResponse>, ApiError> {
    state.orchestrator.approve(id).await?;
    ack(&state, id).await
}

async fn ack(state: &AppState, id: DeploymentId) -> Result<Json<AckResponse>, ApiError> {
    let deployment = state.orchestrator.get_deployment(id).await?;
    Ok(Json(AckResponse {
        id,
        status: deployment.status,
    }))
}
