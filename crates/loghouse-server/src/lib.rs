//! Loghouse Server
//!
//! HTTP surface and background machinery for the loghouse log storage
//! service:
//!
//! - [`create_router`]: the axum route set (§ build/test creation, log
//!   appends, merged views, status).
//! - [`cleanup`]: leader-gated retention sweep and the bounded
//!   delete-build worker queue.
//! - [`stats`]: the single-owner per-route request statistics aggregator.
//!
//! State is explicit: one [`AppState`] carries the primary store, the
//! optional object-store tier, configuration, the cleanup queue handle,
//! and the stats channel. Nothing lives in globals.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod handlers;
pub mod html;
pub mod stats;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use loghouse_storage::{BucketLogStore, SqliteLogStore};

pub use cleanup::{CleanupQueue, Leader, QueueStats, SingleNodeLeader};
pub use config::Config;
pub use error::ApiError;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    /// Primary transactional store; all writes land here first.
    pub db: Arc<SqliteLogStore>,

    /// Object-store tier, present when the deployment has one configured.
    pub bucket: Option<Arc<BucketLogStore>>,

    pub config: Arc<Config>,
    pub cleanup: Arc<CleanupQueue>,

    /// Fire-and-forget channel into the stats aggregator.
    pub stats: mpsc::Sender<stats::RouteResponse>,
}

impl AppState {
    /// The object-store tier, or a 500 for requests that require it on a
    /// deployment without one.
    pub fn require_bucket(&self) -> Result<&Arc<BucketLogStore>, ApiError> {
        self.bucket
            .as_ref()
            .ok_or_else(|| ApiError::internal("object-store tier not configured"))
    }
}

/// Build the full router. Trailing-slash variants are registered
/// explicitly for the write endpoints, matching what upload clients send.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/build", post(handlers::builds::create_build))
        .route("/build/", post(handlers::builds::create_build))
        .route("/build/:build_id/test", post(handlers::tests::create_test))
        .route("/build/:build_id/test/", post(handlers::tests::create_test))
        .route(
            "/build/:build_id/test/:test_id",
            post(handlers::append::append_test_log).get(handlers::views::view_test_logs),
        )
        .route(
            "/build/:build_id/test/:test_id/",
            post(handlers::append::append_test_log),
        )
        .route(
            "/build/:build_id",
            post(handlers::append::append_global_log).get(handlers::views::view_build),
        )
        .route(
            "/build/:build_id/",
            post(handlers::append::append_global_log),
        )
        .route("/build/:build_id/all", get(handlers::views::view_all_logs))
        .route("/status", get(handlers::status::status))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            stats::record_middleware,
        ))
        .layer(DefaultBodyLimit::max(state.config.max_request_size))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
