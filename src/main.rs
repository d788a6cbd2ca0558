//! Stage-aware LLM routing gateway: entry point.
//!
//! Provides:
//! - `/v1/chat/completions`, OpenAI-compatible, buffered or SSE-streamed
//! - `/health`, reporting upstream and durable-store reachability
//! - CORS and tracing middleware, graceful shutdown on SIGINT/SIGTERM

mod auth;
mod breaker;
mod concurrency;
mod config;
mod db;
mod error;
mod log_pipeline;
mod orchestrator;
mod quota;
mod routing;
mod types;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use auth::Authenticator;
use breaker::BreakerRegistry;
use concurrency::ConcurrencyLimiter;
use config::Config;
use error::GatewayError;
use log_pipeline::LogPipeline;
use orchestrator::{IncomingRequest, Orchestrator};
use quota::{DurableQuota, InMemoryQuota, QuotaCounter};
use types::{ChatCompletionRequest, HealthResponse, HealthState};
use upstream::UpstreamClient;
use validator::Validate;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    orchestrator: Orchestrator,
    db_pool: Option<sqlx::PgPool>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut checks = std::collections::HashMap::new();

    let db_ok = match &state.db_pool {
        Some(pool) => sqlx::query("SELECT 1").execute(pool).await.is_ok(),
        None => true,
    };
    checks.insert("database".to_string(), db_ok);
    checks.insert("upstream_configured".to_string(), !state.config.upstream.base_url.is_empty());

    let status = if db_ok {
        HealthState::Healthy
    } else if state.db_pool.is_some() {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    };

    Json(HealthResponse {
        status,
        version: state.config.version.clone(),
        timestamp: chrono::Utc::now(),
        checks,
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Upstream lines arrive as raw SSE frames (`data: {...}` or the literal
/// `data: [DONE]` sentinel); axum's `Event::data` adds its own `data: `
/// prefix, so strip the upstream one to avoid doubling it.
fn sse_payload(line: &str) -> &str {
    line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")).unwrap_or(line)
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionRequest>,
) -> Result<Response, GatewayError> {
    if let Err(errors) = body.validate() {
        return Err(GatewayError::InvalidRequest(errors.to_string()));
    }

    let authorization = header_str(&headers, "authorization");
    let stage_hint = header_str(&headers, "x-cfx-stage");
    let wants_stream = body.stream;

    let request = IncomingRequest { authorization, stage_hint, body };

    if wants_stream {
        let chat_stream = state.orchestrator.stream(request).await?;
        let request_id = chat_stream.request_id.clone();
        let stage = chat_stream.decision.stage.as_str().to_string();
        let model = chat_stream.decision.model.clone();
        let limit = chat_stream.quota_limit;
        let remaining = chat_stream.remaining_quota;
        let reset_at = chat_stream.quota_reset_at;

        let events = chat_stream.lines.map(|line| match line {
            Ok(line) => Ok::<_, std::convert::Infallible>(Event::default().data(sse_payload(&line))),
            Err(err) => Ok(Event::default().data(err.to_body().to_string())),
        });

        let mut response =
            Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))).into_response();
        insert_route_headers(&mut response, &request_id, &stage, &model, limit, remaining, reset_at);
        Ok(response)
    } else {
        let chat_response = state.orchestrator.complete(request).await?;
        let mut response = Json(chat_response.body).into_response();
        insert_route_headers(
            &mut response,
            &chat_response.request_id,
            chat_response.decision.stage.as_str(),
            &chat_response.decision.model,
            chat_response.quota_limit,
            chat_response.remaining_quota,
            chat_response.quota_reset_at,
        );
        Ok(response)
    }
}

fn insert_route_headers(
    response: &mut Response,
    request_id: &str,
    stage: &str,
    model: &str,
    limit: u32,
    remaining: u32,
    reset_at: chrono::DateTime<chrono::Utc>,
) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(request_id) {
        headers.insert("x-cfx-request-id", v);
    }
    if let Ok(v) = HeaderValue::from_str(stage) {
        headers.insert("x-cfx-stage", v);
    }
    if let Ok(v) = HeaderValue::from_str(model) {
        headers.insert("x-cfx-model-used", v);
    }
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&reset_at.to_rfc3339()) {
        headers.insert("x-ratelimit-reset", v);
    }
}

fn create_router(state: AppState) -> Router {
    let cors = if state.config.allowed_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::load()?;
    info!(bind_address = %config.bind_address, "starting gateway");

    let db_pool = db::connect(&config.database).await?;

    let authenticator = Authenticator::new(&config, db_pool.clone());

    let quota_backend: Arc<dyn quota::QuotaBackend> = match &db_pool {
        Some(pool) => Arc::new(DurableQuota::new(pool.clone())),
        None => Arc::new(InMemoryQuota::new()),
    };
    let quota_counter = QuotaCounter::new(quota_backend);

    let concurrency = ConcurrencyLimiter::new(config.rate_limit.concurrent_streams);
    let breakers = BreakerRegistry::new(config.circuit_breaker.clone());
    let upstream_client = UpstreamClient::new(&config.upstream)?;

    let sink: Arc<dyn log_pipeline::LogSink> = match &db_pool {
        Some(pool) => Arc::new(log_pipeline::PgLogSink::new(pool.clone())),
        None => log_pipeline::noop_sink(),
    };
    let (log_pipeline, log_handle) = log_pipeline::start(config.log_pipeline.clone(), sink);

    let config = Arc::new(config);
    let orchestrator = Orchestrator::new(
        config.clone(),
        authenticator,
        quota_counter,
        concurrency,
        breakers,
        upstream_client,
        log_pipeline,
    );

    let state = AppState { config: config.clone(), orchestrator, db_pool };
    let app = create_router(state);

    let addr: SocketAddr = config.bind_address.parse().expect("invalid bind address format");
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    log_handle.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}
