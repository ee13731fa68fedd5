//! Health and admin HTTP handlers.
//!
//! Reusable Axum handlers over a `QueueManager`:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Aggregated health report (`/health/report`)
//! - Queue monitoring (`/queues`, `/queues/{name}/info`)
//! - Prometheus metrics (`/metrics`)
//! - Per-queue DLQ admin (`/admin/queues/{name}/dlq/*`)
//!
//! The library never binds a listener; hosts mount these routers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::dlq::DeadLetterManager;
use crate::manager::QueueManager;
use crate::metrics;
use crate::queue::Queue;
use std::sync::Arc;

/// Liveness probe: OK whenever the process serves requests.
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness probe backed by a Redis PING.
pub async fn ready_handler(
    State(manager): State<QueueManager>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if manager.connections().health_check().await {
        Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "redis": "ok" }
            })),
        ))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": "ping failed" }
            })),
        ))
    }
}

/// Full aggregated health report with per-check timings.
pub async fn health_report_handler(State(manager): State<QueueManager>) -> impl IntoResponse {
    let report = manager.health_check().await;
    let code = match report.status {
        crate::manager::HealthStatus::Healthy => StatusCode::OK,
        crate::manager::HealthStatus::Degraded => StatusCode::OK,
        crate::manager::HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

/// List registered queues with their stats.
pub async fn queues_handler(State(manager): State<QueueManager>) -> Json<Value> {
    let metrics = manager.get_metrics().await;
    let queues: Vec<Value> = metrics
        .queues
        .values()
        .map(|stats| {
            json!({
                "name": stats.name,
                "length": stats.length,
                "delayed": stats.delayed,
                "consumerGroups": stats.consumer_groups,
                "running": stats.running,
            })
        })
        .collect();
    Json(json!({ "queues": queues }))
}

/// Stream info for one queue.
pub async fn queue_info_handler(
    State(manager): State<QueueManager>,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let queue = lookup_queue(&manager, &name).await?;
    match queue.get_info().await {
        Ok(info) => Ok(Json(json!({
            "name": info.name,
            "length": info.length,
            "consumerGroups": info.consumer_groups,
            "running": queue.is_running(),
        }))),
        Err(e) => Err(internal(e)),
    }
}

/// Prometheus metrics endpoint in text exposition format.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

// ============================================================================
// DLQ Admin Handlers
// ============================================================================

/// Query parameters for the DLQ list endpoint.
#[derive(Debug, Deserialize)]
pub struct DlqListParams {
    /// Maximum number of entries to return (default 10, max 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Entries to skip for pagination.
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    10
}

/// Body for batch reprocessing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqReprocessBody {
    pub ids: Vec<String>,
    #[serde(default = "default_limit")]
    pub batch_size: usize,
}

async fn lookup_queue(
    manager: &QueueManager,
    name: &str,
) -> Result<Arc<Queue>, (StatusCode, Json<Value>)> {
    manager.get_queue(name).await.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("queue '{name}' not found") })),
        )
    })
}

async fn lookup_dlq(
    manager: &QueueManager,
    name: &str,
) -> Result<DeadLetterManager, (StatusCode, Json<Value>)> {
    let queue = lookup_queue(manager, name).await?;
    let dlq_name = queue.config().dead_letter_queue.clone().ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("queue '{name}' has no dead-letter queue") })),
        )
    })?;
    Ok(DeadLetterManager::new(
        queue.connection().clone(),
        dlq_name,
        queue.config().max_length,
    ))
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

/// `GET /admin/queues/{name}/dlq/stats`
pub async fn dlq_stats_handler(
    State(manager): State<QueueManager>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let dlq = lookup_dlq(&manager, &name).await?;
    match dlq.get_stats().await {
        Ok(stats) => Ok(Json(stats)),
        Err(e) => Err(internal(e)),
    }
}

/// `GET /admin/queues/{name}/dlq/messages?limit=10&offset=0`
pub async fn dlq_list_handler(
    State(manager): State<QueueManager>,
    Path(name): Path<String>,
    Query(params): Query<DlqListParams>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let dlq = lookup_dlq(&manager, &name).await?;
    let limit = params.limit.min(100);

    match dlq.query_messages(limit, params.offset).await {
        Ok(entries) => {
            let messages: Vec<Value> = entries
                .into_iter()
                .map(|(id, dead)| json!({ "dlqId": id, "message": dead }))
                .collect();
            Ok(Json(json!({
                "count": messages.len(),
                "messages": messages,
                "limit": limit,
                "offset": params.offset,
            })))
        }
        Err(e) => Err(internal(e)),
    }
}

/// `POST /admin/queues/{name}/dlq/reprocess/{id}`
pub async fn dlq_reprocess_one_handler(
    State(manager): State<QueueManager>,
    Path((name, dlq_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let dlq = lookup_dlq(&manager, &name).await?;
    match dlq.reprocess_message(&dlq_id, None).await {
        Ok(new_id) => Ok(Json(json!({
            "success": true,
            "dlqId": dlq_id,
            "newMessageId": new_id,
        }))),
        Err(e) => Err(internal(e)),
    }
}

/// `POST /admin/queues/{name}/dlq/reprocess` with `{ "ids": [...] }`
pub async fn dlq_reprocess_batch_handler(
    State(manager): State<QueueManager>,
    Path(name): Path<String>,
    Json(body): Json<DlqReprocessBody>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let dlq = lookup_dlq(&manager, &name).await?;
    match dlq.reprocess_batch(&body.ids, body.batch_size.min(100)).await {
        Ok(report) => Ok(Json(report)),
        Err(e) => Err(internal(e)),
    }
}

/// `DELETE /admin/queues/{name}/dlq/{id}`
pub async fn dlq_delete_one_handler(
    State(manager): State<QueueManager>,
    Path((name, dlq_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let dlq = lookup_dlq(&manager, &name).await?;
    match dlq.delete(&dlq_id).await {
        Ok(true) => Ok(Json(json!({ "success": true, "dlqId": dlq_id }))),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "entry not found in DLQ", "dlqId": dlq_id })),
        )),
        Err(e) => Err(internal(e)),
    }
}

/// `DELETE /admin/queues/{name}/dlq`
pub async fn dlq_purge_handler(
    State(manager): State<QueueManager>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let dlq = lookup_dlq(&manager, &name).await?;
    match dlq.purge().await {
        Ok(count) => Ok(Json(json!({ "success": true, "purged": count }))),
        Err(e) => Err(internal(e)),
    }
}

/// Standard health endpoints:
/// - `/health`, `/healthz` - liveness
/// - `/ready`, `/readyz` - readiness
/// - `/health/report` - aggregated report
/// - `/queues`, `/queues/{name}/info` - queue monitoring
/// - `/metrics` - Prometheus metrics
pub fn health_router(manager: QueueManager) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/health/report", get(health_report_handler))
        .route("/queues", get(queues_handler))
        .route("/queues/{name}/info", get(queue_info_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(manager)
}

/// DLQ admin endpoints, per queue:
/// - `GET /admin/queues/{name}/dlq/stats`
/// - `GET /admin/queues/{name}/dlq/messages`
/// - `POST /admin/queues/{name}/dlq/reprocess/{id}`
/// - `POST /admin/queues/{name}/dlq/reprocess`
/// - `DELETE /admin/queues/{name}/dlq/{id}`
/// - `DELETE /admin/queues/{name}/dlq`
pub fn dlq_admin_router(manager: QueueManager) -> axum::Router {
    use axum::routing::{delete, get, post};

    axum::Router::new()
        .route("/admin/queues/{name}/dlq/stats", get(dlq_stats_handler))
        .route("/admin/queues/{name}/dlq/messages", get(dlq_list_handler))
        .route(
            "/admin/queues/{name}/dlq/reprocess/{id}",
            post(dlq_reprocess_one_handler),
        )
        .route(
            "/admin/queues/{name}/dlq/reprocess",
            post(dlq_reprocess_batch_handler),
        )
        .route("/admin/queues/{name}/dlq/{id}", delete(dlq_delete_one_handler))
        .route("/admin/queues/{name}/dlq", delete(dlq_purge_handler))
        .with_state(manager)
}

/// Health plus DLQ admin in one router.
pub fn full_admin_router(manager: QueueManager) -> axum::Router {
    axum::Router::new()
        .merge(health_router(manager.clone()))
        .merge(dlq_admin_router(manager))
}
