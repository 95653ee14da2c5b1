//! # outpost-api
//!
//! HTTP surface of the upstream server plus the pieces shared by the
//! `outpost-upstream-server` and `outpost-agent` binaries.

pub mod error;
pub mod extract;
pub mod handlers;
pub mod telemetry;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use outpost_core::defaults::MAX_BODY_SIZE_BYTES;
use outpost_db::Database;

pub use error::ApiError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
}

impl AppState {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

/// Routes of the upstream server.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/upstream/push",
            post(handlers::upstream::push).delete(handlers::upstream::delete),
        )
        .route("/upstream/ping", get(handlers::upstream::ping))
        .route("/upstream/status/:agent_name", get(handlers::upstream::status))
        .route("/upstream/pull/:agent_name", get(handlers::upstream::pull))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new())
                .layer(DefaultBodyLimit::max(MAX_BODY_SIZE_BYTES))
                .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE_BYTES)),
        )
        .with_state(state)
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
