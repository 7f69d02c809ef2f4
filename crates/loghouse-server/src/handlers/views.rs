//! Read-side views
//!
//! The build page lists tests; the log views stream the merged line
//! sequence straight into the response body, as an HTML shell or raw
//! plain text, without ever buffering a whole log. Dropping the connection
//! drops the body stream, which cancels the underlying merge and backend
//! fetches.
//!
//! `?s3=1` routes a read to the object-store tier; its constituent
//! fetches run in parallel and join at a barrier where the first error
//! fails the whole read.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use bytes::Bytes;
use futures::future;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;

use loghouse_storage::merge::ItemStream;
use loghouse_storage::{
    all_build_logs, execution_window_end, merged_test_logs, Build, LogStore, Test,
};

use crate::error::ApiError;
use crate::{html, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ViewParams {
    pub s3: Option<String>,
    pub raw: Option<String>,
}

fn flag(value: &Option<String>) -> bool {
    value.as_deref().map_or(false, |v| !v.is_empty())
}

fn wants_raw(params: &ViewParams, headers: &HeaderMap) -> bool {
    flag(&params.raw)
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |accept| accept == "text/plain")
}

/// `GET /build/:build_id`: the build's test listing.
pub async fn view_build(
    State(state): State<AppState>,
    Path(build_id): Path<String>,
    Query(params): Query<ViewParams>,
) -> Result<Html<String>, ApiError> {
    let (build, tests) = if flag(&params.s3) {
        fetch_build_and_tests(state.require_bucket()?.as_ref(), &build_id).await?
    } else {
        fetch_build_and_tests(state.db.as_ref(), &build_id).await?
    };

    Ok(Html(html::build_page(&build, &tests)))
}

/// Parallel metadata fetches joined at a barrier; the first error wins.
async fn fetch_build_and_tests(
    store: &dyn LogStore,
    build_id: &str,
) -> Result<(Build, Vec<Test>), ApiError> {
    let (build, tests) = tokio::try_join!(
        store.find_build(build_id),
        store.find_tests_for_build(build_id)
    )
    .map_err(|e| {
        tracing::error!(error = %e, build_id = %build_id, "fetching build view");
        ApiError::from(e)
    })?;

    let build = build.ok_or_else(|| ApiError::not_found(format!("build '{}' not found", build_id)))?;
    Ok((build, tests))
}

/// `GET /build/:build_id/all`: global log merged with every test's log.
pub async fn view_all_logs(
    State(state): State<AppState>,
    Path(build_id): Path<String>,
    Query(params): Query<ViewParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let build = state
        .db
        .find_build(&build_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, build_id = %build_id, "finding build");
            ApiError::from(e)
        })?
        .ok_or_else(|| ApiError::not_found("view all logs: build not found"))?;

    let lines = all_build_logs(state.db.as_ref(), &build).await.map_err(|e| {
        tracing::error!(error = %e, build_id = %build_id, "merging build logs");
        ApiError::from(e)
    })?;

    let title = format!("All logs - {}", build.name);
    Ok(stream_log_response(lines, wants_raw(&params, &headers), &title))
}

/// `GET /build/:build_id/test/:test_id`: one test's merged,
/// window-scoped view.
pub async fn view_test_logs(
    State(state): State<AppState>,
    Path((build_id, test_id)): Path<(String, String)>,
    Query(params): Query<ViewParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let store: &dyn LogStore = if flag(&params.s3) {
        state.require_bucket()?.as_ref() as &dyn LogStore
    } else {
        state.db.as_ref() as &dyn LogStore
    };

    // Build, test, and sibling metadata fan out in parallel and join
    // here; the sibling list derives the execution window.
    let (build, test, tests) = tokio::try_join!(
        store.find_build(&build_id),
        store.find_test(&build_id, &test_id),
        store.find_tests_for_build(&build_id)
    )
    .map_err(|e| {
        tracing::error!(error = %e, build_id = %build_id, test_id = %test_id, "fetching test view");
        ApiError::from(e)
    })?;

    let build = build
        .ok_or_else(|| ApiError::not_found(format!("no matching build found for {}", build_id)))?;
    let test = test.ok_or_else(|| {
        ApiError::not_found(format!(
            "no matching test found for build:{}, test:{}",
            build_id, test_id
        ))
    })?;

    let window_end = execution_window_end(&tests, &test);
    let lines = merged_test_logs(store, &build, &test, window_end)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, test_id = %test_id, "merging test logs");
            ApiError::from(e)
        })?;

    let title = format!("{} - {}", test.name, build.name);
    Ok(stream_log_response(lines, wants_raw(&params, &headers), &title))
}

/// Wrap a merged line stream as a streaming response body.
fn stream_log_response(lines: ItemStream, raw: bool, title: &str) -> Response {
    if raw {
        let body = Body::from_stream(lines.map_ok(|item| Bytes::from(item.data + "\n")));
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    } else {
        let header_frame = stream::once(future::ready(Ok::<Bytes, loghouse_storage::Error>(
            Bytes::from(html::log_page_header(title)),
        )));
        let line_frames = lines.map_ok(|item| Bytes::from(html::log_line_html(&item)));
        let footer_frame = stream::once(future::ready(Ok(Bytes::from_static(
            html::log_page_footer().as_bytes(),
        ))));

        let body = Body::from_stream(header_frame.chain(line_frames).chain(footer_frame));
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            body,
        )
            .into_response()
    }
}
