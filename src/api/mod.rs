use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use eyre::Result;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::consts::{
    DRAIN_COMPLETE_TIME_ANNOTATION_KEY, DRAIN_REASON_ANNOTATION_KEY,
    DRAIN_START_TIME_ANNOTATION_KEY,
};
use crate::controllers::{
    manual_cordon, manual_drain, manual_uncordon, DrainContext, ManualDrainOutcome, ManualOpError,
};
use crate::drain_state::{drain_marker_state, DrainMarkerState};
use crate::service_registry::ServiceRegistry;
use crate::shutdown::Shutdown;
use crate::spawn_service::spawn_service;

/// Start the management API: health and metrics endpoints plus manual
/// drain/cordon operations that share the reconciler's state machine.
pub async fn start_api_server(
    bind: SocketAddr,
    context: Arc<DrainContext>,
    service_registry: &ServiceRegistry,
    shutdown: &Shutdown,
) -> Result<SocketAddr> {
    let app = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/nodes", get(list_nodes_handler))
        .route("/api/v1/nodes/:name", get(get_node_handler))
        .route("/api/v1/nodes/:name/drain", post(drain_handler))
        .route("/api/v1/nodes/:name/cordon", post(cordon_handler))
        .route("/api/v1/nodes/:name/uncordon", post(uncordon_handler))
        .with_state(AppState {
            context,
            service_registry: service_registry.clone(),
        });

    let listener = tokio::net::TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    info!("management api listening on {}", local_addr);

    let handle = axum_server::Handle::new();
    let server = axum_server::from_tcp(listener.into_std()?)
        .handle(handle.clone())
        .serve(app.into_make_service());

    tokio::spawn({
        let shutdown = shutdown.clone();
        let handle = handle.clone();

        async move {
            shutdown.wait_shutdown_triggered().await;
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
        }
    });

    let signal = service_registry.register("api");
    spawn_service(shutdown, "api", async move {
        signal.ready();
        server.await.unwrap();
    })?;

    Ok(local_addr)
}

#[derive(Clone)]
struct AppState {
    context: Arc<DrainContext>,
    service_registry: ServiceRegistry,
}

async fn healthz_handler() -> StatusCode {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let pending = state.service_registry.pending_services();
    let status_code = if pending.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(json!({ "pending": pending })))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.context.metrics.render(),
    )
}

/// How a node looks from the outside: drain lifecycle plus schedulability.
#[derive(Serialize)]
struct NodeView {
    name: String,
    state: DrainMarkerState,
    unschedulable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    drain_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    drain_start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    drain_complete_time: Option<String>,
}

impl NodeView {
    fn from_node(node: &Node) -> Self {
        let annotations = node.annotations();

        Self {
            name: node.name_any(),
            state: drain_marker_state(node),
            unschedulable: node
                .spec
                .as_ref()
                .and_then(|spec| spec.unschedulable)
                .unwrap_or(false),
            drain_reason: annotations.get(DRAIN_REASON_ANNOTATION_KEY).cloned(),
            drain_start_time: annotations.get(DRAIN_START_TIME_ANNOTATION_KEY).cloned(),
            drain_complete_time: annotations.get(DRAIN_COMPLETE_TIME_ANNOTATION_KEY).cloned(),
        }
    }
}

async fn list_nodes_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let nodes = state.context.cluster.list_nodes().await?;
    let views: Vec<NodeView> = nodes.iter().map(NodeView::from_node).collect();

    Ok(Json(json!({ "nodes": views })))
}

async fn get_node_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<NodeView>, ApiError> {
    let node = state
        .context
        .cluster
        .get_node(&name)
        .await?
        .ok_or(ManualOpError::NotFound(name))?;

    Ok(Json(NodeView::from_node(&node)))
}

async fn drain_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let outcome = manual_drain(&state.context, &name).await?;

    let body = match outcome {
        ManualDrainOutcome::Drained(summary) => json!({
            "node": name,
            "status": "drained",
            "evicted": summary.evicted,
            "skipped": summary.skipped,
        }),
        ManualDrainOutcome::AlreadyDrained => json!({
            "node": name,
            "status": "already-drained",
        }),
    };

    Ok(Json(body))
}

async fn cordon_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let changed = manual_cordon(&state.context, &name).await?;

    Ok(Json(json!({ "node": name, "changed": changed })))
}

async fn uncordon_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let changed = manual_uncordon(&state.context, &name).await?;

    Ok(Json(json!({ "node": name, "changed": changed })))
}

struct ApiError(ManualOpError);

impl From<ManualOpError> for ApiError {
    fn from(err: ManualOpError) -> Self {
        Self(err)
    }
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        Self(ManualOpError::Kube(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ManualOpError::NotFound(_) => StatusCode::NOT_FOUND,
            ManualOpError::AlreadyDraining(_) => StatusCode::CONFLICT,
            ManualOpError::Kube(_) | ManualOpError::Drain(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
