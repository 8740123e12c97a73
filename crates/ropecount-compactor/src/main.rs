//! # ropecount-compactor
//!
//! Compaction service for segmented counters.
//!
//! Upstream writers accumulate per-event counts in short time-segmented
//! Redis hash-maps. The compactor drains segments that are safely closed,
//! folds each hash-map into a durable MongoDB aggregate, and removes the
//! source — exactly once per source, under any number of concurrent
//! compactor instances.
//!
//! ## Modes
//!
//! - **Serve**: run the HTTP service (`POST /` accepts process requests)
//! - **Invoke**: call a running compactor through service discovery
//!
//! ## Usage
//!
//! ```bash
//! # Run the service
//! ropecount-compactor serve --http.addr 0.0.0.0:8080 \
//!     --redis.addr localhost:6379 --mongo.addr localhost:27017
//!
//! # Trigger a run against the discovered fleet
//! ropecount-compactor invoke --consul.addr localhost:8500 --id manual
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

mod claim;
mod client;
mod metrics;
mod service;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use ropecount_core::{
    CompactionSink, KV_NAMESPACE, KvStore, LogFormat, MongoSink, RedisKv, init_logging,
};

use crate::client::CompactorClient;
use crate::service::{CompactorService, ProcessRequest};

/// ropecount counter compactor.
#[derive(Debug, Parser)]
#[command(name = "ropecount-compactor")]
#[command(about = "Compacts segmented counter hash-maps into durable aggregates")]
#[command(version)]
struct Args {
    /// Emit pretty logs instead of JSON.
    #[arg(long, env = "ROPECOUNT_DEBUG", global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the compactor HTTP service.
    Serve {
        /// HTTP listen address.
        #[arg(
            long = "http.addr",
            env = "ROPECOUNT_HTTP_ADDR",
            default_value = "0.0.0.0:8080"
        )]
        http_addr: String,

        /// Redis server address.
        #[arg(
            long = "redis.addr",
            env = "ROPECOUNT_REDIS_ADDR",
            default_value = "localhost:6379"
        )]
        redis_addr: String,

        /// MongoDB server address.
        #[arg(
            long = "mongo.addr",
            env = "ROPECOUNT_MONGO_ADDR",
            default_value = "localhost:27017"
        )]
        mongo_addr: String,
    },

    /// Invoke a running compactor through service discovery.
    Invoke {
        /// Consul agent address used for discovery.
        #[arg(
            long = "consul.addr",
            env = "ROPECOUNT_CONSUL_ADDR",
            default_value = "localhost:8500"
        )]
        consul_addr: String,

        /// Request identifier, carried through the compactor's logs.
        #[arg(long, default_value = "cli")]
        id: String,
    },
}

/// Shared state for the HTTP handlers.
#[derive(Clone)]
struct AppState {
    service: CompactorService,
    shutdown: CancellationToken,
    stats: Arc<ServiceStats>,
}

/// Run counters reported by the readiness endpoint.
#[derive(Debug, Default)]
struct ServiceStats {
    runs_in_progress: AtomicU64,
    successful_runs: AtomicU64,
    failed_runs: AtomicU64,
}

/// Wire shape of the process response. Business errors travel in-band
/// with HTTP 200; transport failures keep their own status codes.
#[derive(Debug, Serialize)]
struct ProcessResponse {
    err: Option<String>,
}

/// Liveness response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
}

/// Readiness response.
#[derive(Debug, Serialize)]
struct ReadyResponse {
    ready: bool,
    runs_in_progress: u64,
    successful_runs: u64,
    failed_runs: u64,
}

/// POST / - run one compaction pass for the requested start time.
async fn process_handler(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> Json<ProcessResponse> {
    let started = Instant::now();
    state.stats.runs_in_progress.fetch_add(1, Ordering::Relaxed);
    let cancel = state.shutdown.child_token();
    let result = state.service.process(&cancel, &request).await;
    state.stats.runs_in_progress.fetch_sub(1, Ordering::Relaxed);
    if result.is_ok() {
        state.stats.successful_runs.fetch_add(1, Ordering::Relaxed);
    } else {
        state.stats.failed_runs.fetch_add(1, Ordering::Relaxed);
    }
    let took = started.elapsed();
    metrics::record_process(took.as_secs_f64(), result.is_ok());

    let err = result.err().map(|e| e.to_string());
    tracing::info!(
        method = "process",
        id = %request.id,
        took_ms = took.as_millis() as u64,
        err = err.as_deref().unwrap_or("null"),
        "request finished"
    );
    Json(ProcessResponse { err })
}

/// GET /health - shallow liveness check.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /ready - readiness check with run counters.
///
/// Reports unavailable once shutdown has begun so load balancers stop
/// routing requests to a draining instance.
async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = !state.shutdown.is_cancelled();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready,
            runs_in_progress: state.stats.runs_in_progress.load(Ordering::Relaxed),
            successful_runs: state.stats.successful_runs.load(Ordering::Relaxed),
            failed_runs: state.stats.failed_runs.load(Ordering::Relaxed),
        }),
    )
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(process_handler))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics::serve_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn serve(http_addr: &str, redis_addr: &str, mongo_addr: &str) -> Result<()> {
    metrics::init_metrics();

    // Dependencies are built up front: a bad address fails the process at
    // startup, not at first use.
    let kv: Arc<dyn KvStore> = Arc::new(RedisKv::connect(redis_addr, KV_NAMESPACE).await?);
    let sink: Arc<dyn CompactionSink> = Arc::new(MongoSink::connect(mongo_addr).await?);

    let shutdown = CancellationToken::new();
    let state = AppState {
        service: CompactorService::new(kv, sink),
        shutdown: shutdown.clone(),
        stats: Arc::new(ServiceStats::default()),
    };

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    tracing::info!(addr = %http_addr, "compactor listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received, cancelling in-flight requests");
    shutdown.cancel();
}

async fn invoke(consul_addr: &str, id: String) -> Result<()> {
    let client = CompactorClient::new(consul_addr)?;
    let request = ProcessRequest {
        start_at: Utc::now(),
        id,
    };
    client.process(&request).await?;
    tracing::info!("compaction request finished cleanly");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(if args.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    });

    match args.command {
        Commands::Serve {
            http_addr,
            redis_addr,
            mongo_addr,
        } => serve(&http_addr, &redis_addr, &mongo_addr).await,
        Commands::Invoke { consul_addr, id } => invoke(&consul_addr, id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::util::ServiceExt;

    use ropecount_core::{MemoryKv, MemorySink};

    fn test_state(shutdown: CancellationToken) -> AppState {
        AppState {
            service: CompactorService::new(
                Arc::new(MemoryKv::new()),
                Arc::new(MemorySink::new()),
            ),
            shutdown,
            stats: Arc::new(ServiceStats::default()),
        }
    }

    fn process_body() -> Body {
        Body::from(r#"{"startAt":"2026-08-02T10:00:00Z","id":"t-1"}"#)
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn process_returns_null_err_on_success() {
        let router = build_router(test_state(CancellationToken::new()));
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(process_body())
                    .expect("request build failed"),
            )
            .await
            .expect("request failed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body, serde_json::json!({ "err": null }));
    }

    #[tokio::test]
    async fn business_errors_ride_on_http_200() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let router = build_router(test_state(shutdown));

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(process_body())
                    .expect("request build failed"),
            )
            .await
            .expect("request failed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body, serde_json::json!({ "err": "request cancelled" }));
    }

    #[tokio::test]
    async fn malformed_body_is_a_transport_error() {
        let router = build_router(test_state(CancellationToken::new()));
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{\"startAt\":\"not a time\"}"))
                    .expect("request build failed"),
            )
            .await
            .expect("request failed");

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let router = build_router(test_state(CancellationToken::new()));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request build failed"),
            )
            .await
            .expect("request failed");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_answers_ok_while_running() {
        let router = build_router(test_state(CancellationToken::new()));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/ready")
                    .body(Body::empty())
                    .expect("request build failed"),
            )
            .await
            .expect("request failed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["ready"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn ready_reports_unavailable_once_draining() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let router = build_router(test_state(shutdown));

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/ready")
                    .body(Body::empty())
                    .expect("request build failed"),
            )
            .await
            .expect("request failed");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response_json(response).await;
        assert_eq!(body["ready"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn metrics_are_exposed_once_initialized() {
        metrics::init_metrics();
        let router = build_router(test_state(CancellationToken::new()));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("request build failed"),
            )
            .await
            .expect("request failed");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
