//! Log appends
//!
//! Both append endpoints share one path: group the batch into bounded
//! chunks, atomically reserve the owner's sequence range, insert into the
//! primary store, and mirror to the object-store tier for bucket-flagged
//! builds. An oversize line is the one client-visible rejection; a bucket
//! write failure fails the whole append (the reserved range is abandoned
//! as a benign gap and the client retries).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;

use loghouse_core::{group_lines, LogLine};
use loghouse_storage::{Build, LogStore, StorageTier, Test};

use super::CreatedResponse;
use crate::config::MAX_LOG_BYTES;
use crate::error::ApiError;
use crate::AppState;

enum AppendResult {
    Created(CreatedResponse),
    /// Empty input is a no-op acknowledged with 200.
    NoOp,
}

/// `POST /build/:build_id/test/:test_id`
pub async fn append_test_log(
    State(state): State<AppState>,
    Path((build_id, test_id)): Path<(String, String)>,
    Json(lines): Json<Vec<LogLine>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let build = find_build(&state, &build_id).await?;
    let test = state
        .db
        .find_test(&build.id, &test_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, test_id = %test_id, "finding test");
            ApiError::from(e)
        })?
        .ok_or_else(|| ApiError::not_found("test not found"))?;

    let uri = format!(
        "{}/build/{}/test/{}",
        state.config.url, build.id, test.id
    );
    respond(append(&state, &build, Some(&test), lines, uri).await?)
}

/// `POST /build/:build_id`: appends to the build's global log.
pub async fn append_global_log(
    State(state): State<AppState>,
    Path(build_id): Path<String>,
    Json(lines): Json<Vec<LogLine>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let build = find_build(&state, &build_id).await?;

    let uri = format!("{}/build/{}/", state.config.url, build.id);
    respond(append(&state, &build, None, lines, uri).await?)
}

async fn find_build(state: &AppState, build_id: &str) -> Result<Build, ApiError> {
    state
        .db
        .find_build(build_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, build_id = %build_id, "finding build");
            ApiError::from(e)
        })?
        .ok_or_else(|| ApiError::not_found("appending log: build not found"))
}

async fn append(
    state: &AppState,
    build: &Build,
    test: Option<&Test>,
    lines: Vec<LogLine>,
    uri: String,
) -> Result<AppendResult, ApiError> {
    if lines.is_empty() {
        return Ok(AppendResult::NoOp);
    }

    let chunks = group_lines(lines, MAX_LOG_BYTES).map_err(|e| {
        tracing::error!(error = %e, build_id = %build.id, "grouping log lines");
        ApiError::from(e)
    })?;

    let count = chunks.len() as i64;
    let test_id = test.map(|t| t.id.as_str());
    let seq = match test {
        Some(test) => state.db.increment_test_seq(&test.id, count).await,
        None => state.db.increment_build_seq(&build.id, count).await,
    }
    .map_err(|e| {
        tracing::error!(error = %e, build_id = %build.id, "reserving sequence range");
        ApiError::from(e)
    })?;

    state
        .db
        .insert_chunks(&build.id, test_id, seq, &chunks)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, build_id = %build.id, "inserting log chunks");
            ApiError::from(e)
        })?;

    if build.tier == StorageTier::Bucket {
        let bucket = state.require_bucket()?;
        bucket
            .insert_chunks(&build.id, test_id, seq, &chunks)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, build_id = %build.id, "appending chunks to bucket");
                ApiError::from(e)
            })?;
    }

    Ok(AppendResult::Created(CreatedResponse { id: None, uri }))
}

fn respond(result: AppendResult) -> Result<(StatusCode, Json<Value>), ApiError> {
    match result {
        AppendResult::NoOp => Ok((StatusCode::OK, Json(Value::String(String::new())))),
        AppendResult::Created(created) => Ok((
            StatusCode::CREATED,
            Json(serde_json::to_value(created).map_err(|e| ApiError::internal(e.to_string()))?),
        )),
    }
}
