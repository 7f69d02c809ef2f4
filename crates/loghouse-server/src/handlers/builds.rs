//! Build creation

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use loghouse_core::build_id;
use loghouse_storage::{Build, BuildInfo, LogStore, StorageTier};

use super::CreatedResponse;
use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateBuildRequest {
    pub builder: String,
    pub buildnum: i64,
    #[serde(default)]
    pub task_id: String,
    /// Pin this build to the object-store tier.
    #[serde(default)]
    pub s3: bool,
}

/// `POST /build`. Idempotent on `(builder, buildnum)`: the first call
/// creates and returns 201, repeats return 200 with the same id.
pub async fn create_build(
    State(state): State<AppState>,
    Json(req): Json<CreateBuildRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let existing = state
        .db
        .find_build_by_builder(&req.builder, req.buildnum)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, builder = %req.builder, "finding build by builder");
            ApiError::from(e)
        })?;

    if let Some(build) = existing {
        let uri = format!("{}/build/{}", state.config.url, build.id);
        return Ok((
            StatusCode::OK,
            Json(CreatedResponse {
                id: Some(build.id),
                uri,
            }),
        ));
    }

    let id = build_id(&req.builder, req.buildnum);
    let build = Build {
        id: id.clone(),
        builder: req.builder.clone(),
        buildnum: req.buildnum,
        name: format!("{} #{}", req.builder, req.buildnum),
        started: Utc::now(),
        info: BuildInfo {
            task_id: req.task_id,
        },
        failed: false,
        seq: 0,
        tier: if req.s3 {
            StorageTier::Bucket
        } else {
            StorageTier::Primary
        },
    };

    state.db.create_build(&build).await.map_err(|e| {
        tracing::error!(error = %e, build_id = %id, "inserting build");
        ApiError::from(e)
    })?;

    if build.tier == StorageTier::Bucket {
        let bucket = state.require_bucket()?;
        bucket.upload_build_metadata(&build).await.map_err(|e| {
            tracing::error!(error = %e, build_id = %id, "writing build metadata to bucket");
            ApiError::from(e)
        })?;
    }

    let uri = format!("{}/build/{}", state.config.url, id);
    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse { id: Some(id), uri }),
    ))
}
