use crate::clock::SharedClock;
use crate::config::Config;
use crate::diagnostics::DiagnosticsService;
use crate::discovery::{DiscoveryService, PeerListing};
use crate::error::{Result, TelemetryError};
use crate::pipeline::{IngestionPipeline, ReportRequest};
use crate::registry::{PeerRegistry, ThresholdNodePolicy};
use crate::storage::Store;
use crate::throttle::RateLimiter;
use crate::types::{CallerContext, ErrorReport, RegisterPeerResult, ReturnCode, VersionGate};
use axum::{
    extract::{ConnectInfo, Query},
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use hyper::Server;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

/// The services every handler can reach.
pub struct AppState {
    pub pipeline: Arc<IngestionPipeline>,
    pub discovery: Arc<DiscoveryService>,
    pub diagnostics: Arc<DiagnosticsService>,
}

impl AppState {
    pub fn from_config(config: &Config, store: Arc<Store>, clock: SharedClock) -> Self {
        let limiter = Arc::new(RateLimiter::new(clock.clone()));
        let policy = Arc::new(ThresholdNodePolicy::from_config(&config.node_policy));
        let registry = Arc::new(PeerRegistry::new(policy, clock.clone()));

        Self {
            pipeline: Arc::new(IngestionPipeline::new(
                store.clone(),
                limiter,
                registry,
                clock.clone(),
                config.throttle.clone(),
                config.limits.clone(),
            )),
            discovery: Arc::new(DiscoveryService::new(
                store.clone(),
                clock.clone(),
                config.discovery.clone(),
            )),
            diagnostics: Arc::new(DiagnosticsService::new(store, clock)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportResponse {
    return_code: ReturnCode,
}

#[derive(Debug, Deserialize)]
struct RegisterUserRequest {
    #[serde(default)]
    email: String,
}

#[derive(Debug, Deserialize)]
struct PeerScope {
    version: Option<String>,
    channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterPeerRequest {
    version: Option<String>,
    channel: Option<String>,
    #[serde(default)]
    guid: Uuid,
}

#[derive(Debug, Deserialize)]
struct VersionQuery {
    #[serde(default)]
    version: String,
}

fn caller(addr: SocketAddr) -> CallerContext {
    CallerContext::new(addr.ip().to_string())
}

/// Run synchronous store work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TelemetryError::Task(e.to_string()))
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "peer_telemetry",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics_handler() -> Response {
    match crate::metrics::render() {
        Some(text) => (StatusCode::OK, text).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn report_population(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<ReportRequest>,
) -> Json<ReportResponse> {
    let pipeline = state.pipeline.clone();
    let ctx = caller(addr);
    let return_code = blocking(move || pipeline.report_population(&ctx, request))
        .await
        .unwrap_or_else(|e| {
            error!(caller = %addr, error = %e, "ReportPopulation task failed");
            ReturnCode::Success
        });
    Json(ReportResponse { return_code })
}

async fn register_user(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<RegisterUserRequest>,
) -> impl IntoResponse {
    let discovery = state.discovery.clone();
    let ctx = caller(addr);
    let registered = blocking(move || discovery.register_user(&ctx, &request.email))
        .await
        .unwrap_or_else(|e| {
            error!(caller = %addr, error = %e, "RegisterUser task failed");
            false
        });
    Json(serde_json::json!({ "registered": registered }))
}

async fn get_num_peers(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(scope): Query<PeerScope>,
) -> impl IntoResponse {
    let discovery = state.discovery.clone();
    let ctx = caller(addr);
    let count = blocking(move || {
        discovery.get_num_peers(&ctx, scope.version.as_deref(), scope.channel.as_deref())
    })
    .await
    .unwrap_or_else(|e| {
        error!(caller = %addr, error = %e, "GetNumPeers task failed");
        0
    });
    Json(serde_json::json!({ "count": count }))
}

async fn validate_peer(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let address = state.discovery.validate_peer(&caller(addr));
    Json(serde_json::json!({ "address": address }))
}

async fn register_peer(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<RegisterPeerRequest>,
) -> Json<PeerListing> {
    let discovery = state.discovery.clone();
    let ctx = caller(addr);
    let listing = blocking(move || {
        discovery.register_peer(
            &ctx,
            request.version.as_deref(),
            request.channel.as_deref(),
            request.guid,
        )
    })
    .await
    .unwrap_or_else(|e| {
        error!(caller = %addr, error = %e, "RegisterMyPeerGetCountAndPeerList task failed");
        PeerListing {
            result: RegisterPeerResult::Failure,
            peers: Vec::new(),
            count: 0,
        }
    });
    Json(listing)
}

async fn is_version_disabled(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<VersionQuery>,
) -> Json<VersionGate> {
    let discovery = state.discovery.clone();
    let gate = blocking(move || discovery.is_version_disabled(&query.version))
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "IsVersionDisabled task failed");
            VersionGate {
                disabled: true,
                message: String::new(),
            }
        });
    Json(gate)
}

async fn report_error(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(bundle): Json<Vec<ErrorReport>>,
) -> StatusCode {
    let diagnostics = state.diagnostics.clone();
    let ctx = caller(addr);
    if let Err(e) = blocking(move || diagnostics.report_error(&ctx, bundle)).await {
        error!(caller = %addr, error = %e, "ReportError task failed");
    }
    StatusCode::NO_CONTENT
}

/// Create the HTTP router with every RPC route.
pub fn create_router(state: Arc<AppState>, metrics_enabled: bool) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/reporting/population", post(report_population))
        .route("/discovery/users", post(register_user))
        .route("/discovery/peers/count", get(get_num_peers))
        .route("/discovery/validate", get(validate_peer))
        .route("/discovery/peers", post(register_peer))
        .route("/discovery/versions/disabled", get(is_version_disabled))
        .route("/diagnostics/errors", post(report_error));

    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .layer(Extension(state))
        .layer(ServiceBuilder::new().layer(cors))
}

/// Serve the RPC surface until ctrl-c, sweeping expired throttles in the background.
pub async fn start_server(config: &Config, state: Arc<AppState>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| TelemetryError::Config(format!("invalid bind address: {e}")))?;

    let sweeper = state.pipeline.clone();
    let period = Duration::from_secs(config.server.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            sweeper.sweep();
        }
    });

    let app = create_router(state, config.metrics.enabled);

    info!(%addr, "HTTP server listening");
    info!("Health check: http://{addr}/health");

    Server::try_bind(&addr)?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
        })
        .await?;

    crate::metrics::registry::log_category_totals();
    Ok(())
}
