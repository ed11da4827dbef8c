//! REST API Handlers
//!
//! One endpoint per orchestrator entry point, plus read-only views of export
//! groups and operation records.

use crate::controlplane::{Orchestrator, TaskReport};
use crate::domain::model::{ExportGroup, OperationRecord, OperationStatus, ResourceId};
use crate::domain::ports::{FstabEntry, TopologyStore};
use crate::error::Error;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatorsRequest {
    pub initiators: Vec<ResourceId>,
    #[serde(default)]
    pub triggered_by_event: bool,
    /// Operation id; generated when absent
    #[serde(default)]
    pub op_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHostsRequest {
    pub hosts: Vec<ResourceId>,
    #[serde(default)]
    pub cleanup_prior_cluster: bool,
    #[serde(default)]
    pub op_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachRequest {
    #[serde(default)]
    pub deactivate_on_complete: bool,
    #[serde(default)]
    pub op_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    #[serde(default)]
    pub op_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootVolumeRequest {
    pub volume: ResourceId,
    #[serde(default)]
    pub update_san_boot_targets: bool,
    #[serde(default)]
    pub op_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountRequest {
    #[serde(flatten)]
    pub entry: FstabEntry,
    #[serde(default)]
    pub op_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmountQuery {
    pub path: String,
    #[serde(default)]
    pub op_id: Option<String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
}

impl RestRouter {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Hosts
            .route("/v1/hosts/:id/initiators/add", post(add_initiators))
            .route("/v1/hosts/:id/initiators/remove", post(remove_initiators))
            .route("/v1/hosts/:id/detach", post(detach_host))
            .route("/v1/hosts/:id/boot-volume", put(set_boot_volume))
            .route("/v1/hosts/:id/mounts", post(mount_device).delete(unmount_device))
            // Clusters
            .route("/v1/clusters/:id/hosts/add", post(add_cluster_hosts))
            .route("/v1/clusters/:id/hosts/remove", post(remove_cluster_hosts))
            .route("/v1/clusters/:id/sync", post(sync_cluster))
            .route("/v1/clusters/:id/detach", post(detach_cluster))
            // Virtualization inventory
            .route("/v1/datacenters/:id/detach", post(detach_datacenter))
            .route("/v1/vcenters/:id/detach", post(detach_vcenter))
            // File shares
            .route(
                "/v1/ip-interfaces/:id/file-shares/remove",
                post(remove_ip_interface),
            )
            // Read-only views
            .route("/v1/export-groups/:id", get(get_export_group))
            .route("/v1/resources/:id/operations/:op_id", get(get_operation))
            // Health
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

fn op_id_or_new(op_id: Option<String>) -> String {
    op_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Ready maps to 200, rejected requests to 400 and failed sagas to 500
fn task_response(report: TaskReport) -> Response {
    let status = match (report.status, &report.saga) {
        (OperationStatus::Ready, _) => StatusCode::OK,
        (OperationStatus::Pending, _) => StatusCode::ACCEPTED,
        (OperationStatus::Error, None) => StatusCode::BAD_REQUEST,
        (OperationStatus::Error, Some(_)) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(report)).into_response()
}

fn error_response(status: StatusCode, error: &str, e: &Error) -> Response {
    (
        status,
        Json(ApiErrorResponse {
            error: error.into(),
            message: e.to_string(),
            details: Some(e.class().to_string()),
        }),
    )
        .into_response()
}

fn not_found(message: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ApiErrorResponse {
            error: "not_found".into(),
            message,
            details: None,
        }),
    )
        .into_response()
}

// =============================================================================
// Handlers
// =============================================================================

async fn add_initiators(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Json(request): Json<InitiatorsRequest>,
) -> Response {
    let op_id = op_id_or_new(request.op_id);
    info!("Adding {} initiators to host {} ({})", request.initiators.len(), host, op_id);
    let report = state
        .orchestrator
        .add_initiators_to_export(
            &host.into(),
            &request.initiators,
            request.triggered_by_event,
            &op_id,
        )
        .await;
    task_response(report)
}

async fn remove_initiators(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Json(request): Json<InitiatorsRequest>,
) -> Response {
    let op_id = op_id_or_new(request.op_id);
    let report = state
        .orchestrator
        .remove_initiators_from_export(&host.into(), &request.initiators, &op_id)
        .await;
    task_response(report)
}

async fn detach_host(
    State(state): State<AppState>,
    Path(host): Path<String>,
    body: Option<Json<DetachRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let op_id = op_id_or_new(request.op_id);
    info!("Detaching storage of host {} ({})", host, op_id);
    let report = state
        .orchestrator
        .detach_host_storage(&host.into(), request.deactivate_on_complete, &op_id)
        .await;
    task_response(report)
}

async fn set_boot_volume(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Json(request): Json<BootVolumeRequest>,
) -> Response {
    let op_id = op_id_or_new(request.op_id);
    let report = state
        .orchestrator
        .set_host_boot_volume(
            &host.into(),
            &request.volume,
            request.update_san_boot_targets,
            &op_id,
        )
        .await;
    task_response(report)
}

async fn mount_device(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Json(request): Json<MountRequest>,
) -> Response {
    let op_id = op_id_or_new(request.op_id);
    let report = state
        .orchestrator
        .mount_host_device(&host.into(), &request.entry, &op_id)
        .await;
    task_response(report)
}

async fn unmount_device(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(query): Query<UnmountQuery>,
) -> Response {
    let op_id = op_id_or_new(query.op_id);
    let report = state
        .orchestrator
        .unmount_host_device(&host.into(), &query.path, &op_id)
        .await;
    task_response(report)
}

async fn add_cluster_hosts(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Json(request): Json<ClusterHostsRequest>,
) -> Response {
    let op_id = op_id_or_new(request.op_id);
    info!("Adding {} hosts to cluster {} ({})", request.hosts.len(), cluster, op_id);
    let report = state
        .orchestrator
        .add_hosts_to_cluster_export(
            &cluster.into(),
            &request.hosts,
            request.cleanup_prior_cluster,
            &op_id,
        )
        .await;
    task_response(report)
}

async fn remove_cluster_hosts(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Json(request): Json<ClusterHostsRequest>,
) -> Response {
    let op_id = op_id_or_new(request.op_id);
    let report = state
        .orchestrator
        .remove_hosts_from_cluster_export(&cluster.into(), &request.hosts, &op_id)
        .await;
    task_response(report)
}

async fn sync_cluster(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    body: Option<Json<OperationRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let op_id = op_id_or_new(request.op_id);
    let report = state
        .orchestrator
        .synchronize_cluster_export(&cluster.into(), &op_id)
        .await;
    task_response(report)
}

async fn detach_cluster(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    body: Option<Json<DetachRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let op_id = op_id_or_new(request.op_id);
    let report = state
        .orchestrator
        .detach_cluster_storage(&cluster.into(), request.deactivate_on_complete, &op_id)
        .await;
    task_response(report)
}

async fn detach_datacenter(
    State(state): State<AppState>,
    Path(datacenter): Path<String>,
    body: Option<Json<DetachRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let op_id = op_id_or_new(request.op_id);
    let report = state
        .orchestrator
        .detach_datacenter_storage(&datacenter.into(), request.deactivate_on_complete, &op_id)
        .await;
    task_response(report)
}

async fn detach_vcenter(
    State(state): State<AppState>,
    Path(vcenter): Path<String>,
    body: Option<Json<DetachRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let op_id = op_id_or_new(request.op_id);
    let report = state
        .orchestrator
        .detach_vcenter_storage(&vcenter.into(), request.deactivate_on_complete, &op_id)
        .await;
    task_response(report)
}

async fn remove_ip_interface(
    State(state): State<AppState>,
    Path(ip_interface): Path<String>,
    body: Option<Json<OperationRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let op_id = op_id_or_new(request.op_id);
    let report = state
        .orchestrator
        .remove_ip_interface_from_file_shares(&ip_interface.into(), &op_id)
        .await;
    task_response(report)
}

async fn get_export_group(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.store().export_group(&id.as_str().into()).await {
        Ok(Some(group)) => (StatusCode::OK, Json(group)).into_response(),
        Ok(None) => not_found(format!("Export group {} not found", id)),
        Err(e) => {
            error!("Reading export group {} failed: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", &e)
        }
    }
}

async fn get_operation(
    State(state): State<AppState>,
    Path((id, op_id)): Path<(String, String)>,
) -> Response {
    match state
        .orchestrator
        .store()
        .operation(&id.as_str().into(), &op_id)
        .await
    {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => not_found(format!("Operation {} on {} not found", op_id, id)),
        Err(e) => {
            error!("Reading operation {} on {} failed: {}", op_id, id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", &e)
        }
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.metrics().encode() {
        Ok(_) => (StatusCode::OK, "Ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "Not Ready"),
    }
}
