//! Health and introspection

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::cleanup::QueueStats;
use crate::config::MAX_LOG_BYTES;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub err: String,
    #[serde(rename = "maxRequestSize")]
    pub max_request_size: usize,
    pub max_log_size: usize,
    pub db: bool,
    pub build_id: String,
    pub batch_size: usize,
    pub workers: usize,
    pub dur_secs: f64,
    pub cleanup_queue_stats: QueueStats,
}

/// `GET /status`
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        err: String::new(),
        max_request_size: state.config.max_request_size,
        max_log_size: MAX_LOG_BYTES,
        db: true,
        build_id: env!("CARGO_PKG_VERSION").to_string(),
        batch_size: state.config.cleanup_batch_size,
        workers: state.cleanup.worker_count(),
        dur_secs: state.config.cleanup_interval.as_secs_f64(),
        cleanup_queue_stats: state.cleanup.stats(),
    })
}
