pub mod collector;
pub mod credentials;
pub mod errors;
pub mod history;
pub mod models;
pub mod monitor;
pub mod policy;
pub mod redaction;
pub mod scheduler;
pub mod settings;
pub mod warehouse;

use crate::errors::{AppError, AppResult};
use crate::models::{
    AckResponse, AppSettings, ConnectPayload, HealthResponse, MetricsQuery, MetricsResponse, StatusResponse,
    WarehouseBackend,
};
use crate::monitor::MonitorCore;
use anyhow::Context;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, Method, Uri};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_appender::non_blocking::WorkerGuard;

pub const USER_ID_HEADER: &str = "x-user-id";

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<MonitorCore>,
}

/// Identity of the signed-in user, set by the session layer in front of this service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId(pub String);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| UserId(value.to_string()))
            .ok_or_else(|| AppError::Unauthorized("User is not authenticated in the session.".to_string()))
    }
}

async fn connect(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    payload: Result<Json<ConnectPayload>, JsonRejection>,
) -> AppResult<Json<AckResponse>> {
    let Json(payload) = payload.map_err(|error| AppError::Validation(error.body_text()))?;
    Ok(Json(state.monitor.connect(&user_id, payload).await?))
}

async fn status(State(state): State<AppState>, UserId(user_id): UserId) -> AppResult<Json<StatusResponse>> {
    Ok(Json(state.monitor.status(&user_id).await?))
}

async fn disconnect(State(state): State<AppState>, UserId(user_id): UserId) -> AppResult<Json<AckResponse>> {
    Ok(Json(state.monitor.disconnect(&user_id).await?))
}

async fn metrics(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    query: Result<Query<MetricsQuery>, QueryRejection>,
) -> AppResult<Json<MetricsResponse>> {
    let Query(query) = query.map_err(|error| AppError::Validation(error.body_text()))?;
    Ok(Json(state.monitor.metrics(&user_id, query.limit)?))
}

async fn route_not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("No route for {}.", uri.path()))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/snowflake/connect", post(connect))
        .route("/api/snowflake/status", get(status))
        .route("/api/snowflake/disconnect", delete(disconnect))
        .route("/api/metrics", get(metrics))
        .route("/health", get(health))
        .fallback(route_not_found)
        .with_state(state)
}

/// Router plus request tracing and, when an origin is configured, CORS for the dashboard.
pub fn build_app(settings: &AppSettings, monitor: Arc<MonitorCore>) -> AppResult<Router> {
    let mut app = build_router(AppState { monitor }).layer(TraceLayer::new_for_http());

    if let Some(origin) = settings.cors_origin.as_deref().filter(|origin| !origin.trim().is_empty()) {
        let origin = HeaderValue::from_str(origin.trim())
            .map_err(|error| AppError::Config(format!("invalid corsOrigin: {}", error)))?;
        app = app.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers([CONTENT_TYPE, HeaderName::from_static(USER_ID_HEADER)])
                .allow_credentials(true),
        );
    }

    Ok(app)
}

fn init_tracing(settings: &AppSettings) -> Result<(), String> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    let Some(log_dir) = settings.log_dir.as_ref() else {
        let builder = tracing_subscriber::fmt().with_env_filter(filter());
        return if settings.log_json {
            builder.json().try_init().map_err(|error| error.to_string())
        } else {
            builder.try_init().map_err(|error| error.to_string())
        };
    };

    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "query-pulse.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_ansi(false)
        .with_writer(non_blocking);
    if settings.log_json {
        builder.json().try_init().map_err(|error| error.to_string())
    } else {
        builder.try_init().map_err(|error| error.to_string())
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

pub async fn run() -> anyhow::Result<()> {
    let settings = settings::load().context("failed to load settings")?;
    init_tracing(&settings).map_err(anyhow::Error::msg)?;

    if settings.warehouse.backend == WarehouseBackend::Sqlite {
        if let Some(path) = settings.warehouse.sqlite_path.as_deref() {
            warehouse::sqlite::SqliteWarehouse::initialize(path).context("failed to prepare local warehouse")?;
        }
    }
    let warehouse = warehouse::build_warehouse(&settings.warehouse).context("failed to build warehouse client")?;
    tracing::info!(backend = warehouse.name(), "warehouse backend ready");

    let monitor = MonitorCore::new(&settings, warehouse);
    monitor.start_background_monitoring().await;

    let app = build_app(&settings, monitor.clone()).context("failed to build router")?;
    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    tracing::info!(addr = %settings.bind_addr, "query-pulse listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    monitor.shutdown().await;
    served.context("server error")?;
    Ok(())
}
