use crate::dispatcher::RealtimeDispatcher;
use crate::scheduler::SyncScheduler;
use crate::service::SyncService;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use common::config::ServerSettings;
use common::{Error, SlaveUpdate};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub service: SyncService,
    pub scheduler: Arc<SyncScheduler>,
    pub dispatcher: Arc<RealtimeDispatcher>,
    pub metrics: PrometheusHandle,
}

pub struct Server {
    settings: ServerSettings,
    state: AppState,
}

impl Server {
    pub fn new(settings: ServerSettings, state: AppState) -> Self {
        Self { settings, state }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let app = self.build_router();

        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!("Admin surface listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }

    fn build_router(&self) -> Router {
        Router::new()
            // Health check
            .route("/health", get(health_check))
            // Metrics
            .route("/metrics", get(metrics_handler))
            // Admin endpoints
            .route("/api/status", get(admin::get_status))
            .route("/api/slaves", get(admin::list_slaves).post(admin::add_slave))
            .route(
                "/api/slaves/:id",
                get(admin::get_slave)
                    .put(admin::update_slave)
                    .delete(admin::delete_slave),
            )
            .route("/api/slaves/:id/sync", post(admin::sync_slave))
            .route("/api/slaves/:id/integrity", get(admin::verify_integrity))
            .route("/api/sync/start", post(admin::start_periodic_sync))
            .route("/api/sync/stop", post(admin::stop_periodic_sync))
            .route("/api/realtime/start", post(admin::start_realtime_sync))
            .route("/api/realtime/stop", post(admin::stop_realtime_sync))
            .route("/api/realtime/status", get(admin::realtime_status))
            .route("/api/tables", get(admin::list_tables))
            .route("/api/system-tables", get(admin::list_system_tables))
            .route("/api/logs", get(admin::get_logs))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn error_response(e: Error) -> ApiError {
    let status = match &e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "status": "error", "message": e.to_string() })),
    )
}

mod admin {
    use super::*;

    #[derive(Debug, Deserialize)]
    pub struct AddSlaveRequest {
        pub name: String,
        pub db_path: String,
        pub server_address: Option<String>,
        #[serde(default)]
        pub ignored_tables: Vec<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct SyncParams {
        #[serde(default)]
        pub initial: bool,
        #[serde(default)]
        pub force: bool,
    }

    #[derive(Debug, Deserialize)]
    pub struct LogsQuery {
        pub slave_id: Option<i64>,
        pub limit: Option<usize>,
    }

    pub async fn get_status(
        State(state): State<AppState>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let slaves = state.service.status().await.map_err(error_response)?;
        Ok(Json(json!({
            "slaves": slaves,
            "scheduler_running": state.scheduler.is_running(),
            "realtime": state.dispatcher.status(),
        })))
    }

    pub async fn list_slaves(
        State(state): State<AppState>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let slaves = state.service.list_slaves().await.map_err(error_response)?;
        Ok(Json(json!({ "slaves": slaves })))
    }

    pub async fn add_slave(
        State(state): State<AppState>,
        Json(request): Json<AddSlaveRequest>,
    ) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
        let slave = state
            .service
            .add_slave(
                request.name,
                request.db_path,
                request.server_address,
                request.ignored_tables,
            )
            .await
            .map_err(error_response)?;
        Ok((
            StatusCode::CREATED,
            Json(json!({ "status": "success", "slave": slave })),
        ))
    }

    pub async fn get_slave(
        State(state): State<AppState>,
        Path(id): Path<i64>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let slave = state.service.get_slave(id).await.map_err(error_response)?;
        let logs = state
            .service
            .get_logs(Some(id), 5)
            .await
            .map_err(error_response)?;
        Ok(Json(json!({ "slave": slave, "logs": logs })))
    }

    pub async fn update_slave(
        State(state): State<AppState>,
        Path(id): Path<i64>,
        Json(update): Json<SlaveUpdate>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let slave = state
            .service
            .update_slave(id, update)
            .await
            .map_err(error_response)?;
        Ok(Json(json!({ "status": "success", "slave": slave })))
    }

    pub async fn delete_slave(
        State(state): State<AppState>,
        Path(id): Path<i64>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        state.service.delete_slave(id).await.map_err(error_response)?;
        Ok(Json(json!({ "status": "success" })))
    }

    pub async fn sync_slave(
        State(state): State<AppState>,
        Path(id): Path<i64>,
        Query(params): Query<SyncParams>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let outcome = state
            .service
            .sync_slave(id, params.initial, params.force)
            .await
            .map_err(error_response)?;
        Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
    }

    pub async fn verify_integrity(
        State(state): State<AppState>,
        Path(id): Path<i64>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let report = state
            .service
            .verify_integrity(id)
            .await
            .map_err(error_response)?;
        Ok(Json(serde_json::to_value(report).unwrap_or_default()))
    }

    pub async fn start_periodic_sync(
        State(state): State<AppState>,
    ) -> Json<serde_json::Value> {
        let started = state.scheduler.start();
        Json(json!({ "status": "success", "started": started }))
    }

    pub async fn stop_periodic_sync(State(state): State<AppState>) -> Json<serde_json::Value> {
        let stopped = state.scheduler.stop().await;
        Json(json!({ "status": "success", "stopped": stopped }))
    }

    pub async fn start_realtime_sync(
        State(state): State<AppState>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let started = state.dispatcher.start().await.map_err(error_response)?;
        Ok(Json(json!({ "status": "success", "started": started })))
    }

    pub async fn stop_realtime_sync(State(state): State<AppState>) -> Json<serde_json::Value> {
        let stopped = state.dispatcher.stop().await;
        Json(json!({ "status": "success", "stopped": stopped }))
    }

    pub async fn realtime_status(State(state): State<AppState>) -> Json<serde_json::Value> {
        Json(serde_json::to_value(state.dispatcher.status()).unwrap_or_default())
    }

    pub async fn list_tables(
        State(state): State<AppState>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let tables = state.service.list_tables().await.map_err(error_response)?;
        Ok(Json(json!({ "tables": tables })))
    }

    pub async fn list_system_tables(
        State(state): State<AppState>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let tables = state
            .service
            .list_system_tables()
            .await
            .map_err(error_response)?;
        Ok(Json(json!({ "tables": tables })))
    }

    pub async fn get_logs(
        State(state): State<AppState>,
        Query(query): Query<LogsQuery>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let logs = state
            .service
            .get_logs(query.slave_id, query.limit.unwrap_or(100))
            .await
            .map_err(error_response)?;
        Ok(Json(json!({ "logs": logs })))
    }
}
