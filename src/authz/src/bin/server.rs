//! # Authorization HTTP Server
//!
//! HTTP front for the TrustGate decision engine.
//!
//! ## Endpoints
//!
//! - `POST /v1/authorize` - Authorization decision
//! - `POST /v1/invalidate` - Drop cached decisions depending on an id
//! - `GET /health` - Health check
//! - `GET /metrics` - Prometheus metrics (served on the metrics port)
//!
//! ## Configuration
//!
//! Environment variables:
//! - `PORT` - HTTP server port (default: 8080)
//! - `METRICS_PORT` - Metrics server port (default: 9090)
//! - `AUTHZ_BUNDLE` - JSON bundle of policies and entities to load at startup
//! - `RUST_LOG` - Log level (default: info)
//! - `AUTHZ_*` - Engine settings (cache, timeouts, delegation depth)

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    serve, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trustgate_authz::{
    AuthzError, ContextMap, DecisionEngine, DeterminingFactor, EngineConfig, InMemoryEntityDirectory,
    InMemoryPolicyStore, PolicyBundle,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<DecisionEngine>,
    start_time: std::time::Instant,
}

/// Error response body
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

/// Application error type
#[derive(Debug)]
enum AppError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = Json(ErrorResponse {
            error: error.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<AuthzError> for AppError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::InvalidInput(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Authorization request body
#[derive(Debug, Deserialize)]
struct AuthorizeRequest {
    principal: String,
    action: String,
    resource: String,
    #[serde(default)]
    context: ContextMap,
}

/// Authorization response body
#[derive(Debug, Serialize)]
struct AuthorizeResponse {
    request_id: String,
    decision: String,
    determining_factors: Vec<DeterminingFactor>,
    evaluated_at: chrono::DateTime<chrono::Utc>,
    cached: bool,
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    id: String,
}

#[derive(Debug, Serialize)]
struct InvalidateResponse {
    id: String,
    invalidated: usize,
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    uptime_seconds: u64,
    version: String,
}

/// Metrics response (Prometheus format)
struct MetricsResponse {
    metrics: String,
}

impl IntoResponse for MetricsResponse {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            self.metrics,
        )
            .into_response()
    }
}

/// POST /v1/authorize - Decide a request
async fn authorize(
    State(state): State<AppState>,
    Json(req): Json<AuthorizeRequest>,
) -> Result<Json<AuthorizeResponse>, AppError> {
    let decision = state
        .engine
        .is_authorized(&req.principal, &req.action, &req.resource, req.context)
        .await?;

    Ok(Json(AuthorizeResponse {
        request_id: decision.request_id,
        decision: decision.decision.to_string(),
        determining_factors: decision.determining_factors,
        evaluated_at: decision.evaluated_at,
        cached: decision.cached,
    }))
}

/// POST /v1/invalidate - Invalidate cached decisions for an id
async fn invalidate(
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, AppError> {
    if req.id.trim().is_empty() {
        return Err(AppError::BadRequest("id cannot be empty".to_string()));
    }

    let invalidated = state.engine.invalidate(&req.id);
    info!("Invalidated {} cached decision(s) for {}", invalidated, req.id);

    Ok(Json(InvalidateResponse {
        id: req.id,
        invalidated,
    }))
}

/// GET /health - Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        version: trustgate_authz::VERSION.to_string(),
    })
}

/// GET /metrics - Prometheus metrics endpoint
async fn metrics(State(state): State<AppState>) -> MetricsResponse {
    let mut metrics = format!(
        "# HELP authz_uptime_seconds Server uptime in seconds\n\
         # TYPE authz_uptime_seconds gauge\n\
         authz_uptime_seconds {}\n\n",
        state.start_time.elapsed().as_secs()
    );
    metrics.push_str(&state.engine.export_prometheus().await);

    MetricsResponse { metrics }
}

/// Create the HTTP router with all endpoints
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http().on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/v1/authorize", post(authorize))
        .route("/v1/invalidate", post(invalidate))
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(trace).layer(cors))
        .with_state(state)
}

/// Create the metrics router
fn create_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Starting graceful shutdown");
}

fn env_port(name: &str, default: u16) -> anyhow::Result<u16> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a port number, got '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

/// Build the engine from the environment, loading `AUTHZ_BUNDLE` if set
async fn build_engine(config: EngineConfig) -> anyhow::Result<Arc<DecisionEngine>> {
    let (store, directory) = match std::env::var("AUTHZ_BUNDLE") {
        Ok(path) => PolicyBundle::load(&path)
            .await
            .with_context(|| format!("failed to load bundle {}", path))?
            .into_stores()
            .await?,
        Err(_) => {
            warn!("AUTHZ_BUNDLE not set; starting with no policies (every request is denied)");
            (InMemoryPolicyStore::new(), InMemoryEntityDirectory::new())
        }
    };

    let store = Arc::new(store);
    let changes = store.subscribe();
    let engine = Arc::new(DecisionEngine::new(config, store, Arc::new(directory))?);
    engine.spawn_invalidation_listener(changes);
    Ok(engine)
}

/// Main server entrypoint
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting TrustGate Authorization Server v{}", trustgate_authz::VERSION);

    let port = env_port("PORT", 8080)?;
    let metrics_port = env_port("METRICS_PORT", 9090)?;
    let config = EngineConfig::from_env().context("invalid AUTHZ_* configuration")?;

    info!("Configuration:");
    info!("  Port: {}", port);
    info!("  Metrics Port: {}", metrics_port);
    info!("  Cache: enabled={} capacity={} ttl={}s", config.cache.enabled, config.cache.capacity, config.cache.ttl_secs);
    info!("  Deadline: soft={}ms hard={}ms", config.soft_budget_ms, config.hard_timeout_ms);

    let engine = build_engine(config).await?;
    info!("Authorization engine initialized successfully");

    let state = AppState {
        engine,
        start_time: std::time::Instant::now(),
    };

    let app = create_router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let metrics_app = create_metrics_router(state);
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));

    info!("Starting HTTP server on {}", addr);
    info!("Starting metrics server on {}", metrics_addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP server on {}", addr))?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics server on {}", metrics_addr))?;

    let server = serve(listener, app.into_make_service()).with_graceful_shutdown(shutdown_signal());
    let metrics_server =
        serve(metrics_listener, metrics_app.into_make_service()).with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async { server.await.context("HTTP server error") },
        async { metrics_server.await.context("metrics server error") }
    )?;

    info!("Servers shut down gracefully");
    Ok(())
}
