//! Integration tests for the loghouse HTTP API
//!
//! Exercises the real router against an in-memory primary store and an
//! in-memory object store, sending requests via tower::ServiceExt.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use sqlx::Row;
use tower::ServiceExt;

use loghouse_server::{create_router, stats::StatsLogger, AppState, CleanupQueue, Config};
use loghouse_storage::{BucketLogStore, LogStore, SqliteLogStore};
use object_store::memory::InMemory;

struct TestApp {
    router: axum::Router,
    state: AppState,
}

async fn test_app() -> TestApp {
    test_app_with_bucket(true).await
}

async fn test_app_with_bucket(with_bucket: bool) -> TestApp {
    let db = Arc::new(SqliteLogStore::new_in_memory().await.unwrap());
    let bucket = with_bucket.then(|| Arc::new(BucketLogStore::new(Arc::new(InMemory::new()))));
    let config = Arc::new(Config::default());

    let cleanup = Arc::new(CleanupQueue::new(
        db.clone() as Arc<dyn LogStore>,
        bucket.clone().map(|b| b as Arc<dyn LogStore>),
        1,
        16,
        0,
    ));

    // The receiver is dropped; observations are fire-and-forget anyway.
    let (stats_tx, _stats_logger) = StatsLogger::new(64);

    let state = AppState {
        db,
        bucket,
        config,
        cleanup,
        stats: stats_tx,
    };
    TestApp {
        router: create_router(state.clone()),
        state,
    }
}

fn json_request(method: &str, path: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get_request(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &axum::Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn send_json(
    app: &axum::Router,
    req: Request<Body>,
    expected: StatusCode,
) -> serde_json::Value {
    let (status, body) = send(app, req).await;
    assert_eq!(status, expected, "body: {}", String::from_utf8_lossy(&body));
    serde_json::from_slice(&body).unwrap()
}

async fn create_build(app: &axum::Router, builder: &str, buildnum: i64, s3: bool) -> String {
    let body = serde_json::json!({"builder": builder, "buildnum": buildnum, "s3": s3});
    let data = send_json(
        app,
        json_request("POST", "/build", body),
        StatusCode::CREATED,
    )
    .await;
    data["id"].as_str().unwrap().to_string()
}

async fn create_test(app: &axum::Router, build_id: &str, name: &str) -> String {
    let body = serde_json::json!({"test_filename": name, "command": "cmd", "phase": "phase"});
    let data = send_json(
        app,
        json_request("POST", &format!("/build/{}/test", build_id), body),
        StatusCode::CREATED,
    )
    .await;
    data["id"].as_str().unwrap().to_string()
}

fn line(ts: f64, text: &str) -> serde_json::Value {
    serde_json::json!([ts, text])
}

// ---------------------------------------------------------------
// Build creation
// ---------------------------------------------------------------

#[tokio::test]
async fn test_create_build_is_idempotent() {
    let app = test_app().await;

    let body = serde_json::json!({"builder": "builder0", "buildnum": 123});
    let first = send_json(
        &app.router,
        json_request("POST", "/build", body.clone()),
        StatusCode::CREATED,
    )
    .await;
    assert!(first["id"].is_string());
    assert!(first["uri"].is_string());

    let second = send_json(
        &app.router,
        json_request("POST", "/build", body),
        StatusCode::OK,
    )
    .await;
    assert_eq!(second["id"], first["id"]);
    assert_eq!(second["uri"], first["uri"]);
}

#[tokio::test]
async fn test_create_test_requires_build() {
    let app = test_app().await;
    let body = serde_json::json!({"test_filename": "t"});
    let (status, _) = send(
        &app.router,
        json_request("POST", "/build/nonexistent/test", body),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_task_id_is_recorded() {
    let app = test_app().await;
    let build_id = create_build(&app.router, "builder0", 1, false).await;

    let body = serde_json::json!({"test_filename": "t", "task_id": "abc123"});
    let data = send_json(
        &app.router,
        json_request("POST", &format!("/build/{}/test", build_id), body),
        StatusCode::CREATED,
    )
    .await;
    let test_id = data["id"].as_str().unwrap();

    let test = app
        .state
        .db
        .find_test(&build_id, test_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(test.info.task_id, "abc123");
}

// ---------------------------------------------------------------
// Appends and chunking
// ---------------------------------------------------------------

#[tokio::test]
async fn test_oversize_test_log_is_split_into_chunks() {
    let app = test_app().await;
    let build_id = create_build(&app.router, "builder0", 123, false).await;
    let test_id = create_test(&app.router, &build_id, "myTest").await;

    // Three 2 MiB lines against the 4 MiB chunk bound: chunks of 2 and 1.
    let big = "a".repeat(2 * 1024 * 1024);
    let body = serde_json::json!([line(1.0, &big), line(2.0, &big), line(3.0, &big)]);
    send_json(
        &app.router,
        json_request("POST", &format!("/build/{}/test/{}", build_id, test_id), body),
        StatusCode::CREATED,
    )
    .await;

    let test = app
        .state
        .db
        .find_test(&build_id, &test_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(test.seq, 2);

    let rows = sqlx::query("SELECT seq, lines FROM chunks WHERE test_id = ?1 ORDER BY seq")
        .bind(&test_id)
        .fetch_all(app.state.db.pool())
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    let line_counts: Vec<usize> = rows
        .iter()
        .map(|row| {
            let raw: String = row.get("lines");
            serde_json::from_str::<Vec<serde_json::Value>>(&raw)
                .unwrap()
                .len()
        })
        .collect();
    assert_eq!(line_counts, vec![2, 1]);
    let seqs: Vec<i64> = rows.iter().map(|row| row.get("seq")).collect();
    assert_eq!(seqs, vec![1, 2]);
}

#[tokio::test]
async fn test_oversize_global_log_is_split_into_chunks() {
    let app = test_app().await;
    let build_id = create_build(&app.router, "builder0", 123, false).await;

    let big = "a".repeat(2 * 1024 * 1024);
    let body = serde_json::json!([line(1.0, &big), line(2.0, &big), line(3.0, &big)]);
    send_json(
        &app.router,
        json_request("POST", &format!("/build/{}", build_id), body),
        StatusCode::CREATED,
    )
    .await;

    let build = app.state.db.find_build(&build_id).await.unwrap().unwrap();
    assert_eq!(build.seq, 2);
}

#[tokio::test]
async fn test_single_line_over_chunk_bound_is_rejected() {
    let app = test_app().await;
    let build_id = create_build(&app.router, "builder0", 123, false).await;

    let too_big = "a".repeat(4 * 1024 * 1024 + 1);
    let body = serde_json::json!([line(1.0, &too_big)]);
    let data = send_json(
        &app.router,
        json_request("POST", &format!("/build/{}", build_id), body),
        StatusCode::BAD_REQUEST,
    )
    .await;
    assert_eq!(data["max_size"], 4 * 1024 * 1024);

    // Nothing was reserved or stored.
    let build = app.state.db.find_build(&build_id).await.unwrap().unwrap();
    assert_eq!(build.seq, 0);
}

#[tokio::test]
async fn test_empty_append_is_a_no_op() {
    let app = test_app().await;
    let build_id = create_build(&app.router, "builder0", 123, false).await;

    let (status, _) = send(
        &app.router,
        json_request("POST", &format!("/build/{}", build_id), serde_json::json!([])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let build = app.state.db.find_build(&build_id).await.unwrap().unwrap();
    assert_eq!(build.seq, 0);
}

#[tokio::test]
async fn test_append_to_unknown_owner_is_not_found() {
    let app = test_app().await;
    let build_id = create_build(&app.router, "builder0", 123, false).await;

    let body = serde_json::json!([line(1.0, "x")]);
    let (status, _) = send(
        &app.router,
        json_request("POST", "/build/missing", body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app.router,
        json_request("POST", &format!("/build/{}/test/missing", build_id), body),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------
// Merged views
// ---------------------------------------------------------------

#[tokio::test]
async fn test_raw_test_view_scopes_global_lines_to_window() {
    let app = test_app().await;
    let build_id = create_build(&app.router, "builder0", 1, false).await;
    let t1 = create_test(&app.router, &build_id, "first").await;
    // Test start times have millisecond precision; keep them distinct so
    // the execution window boundary between t1 and t2 is well-defined.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let t2 = create_test(&app.router, &build_id, "second").await;

    // Own lines for each test.
    let now = chrono::Utc::now().timestamp() as f64;
    send_json(
        &app.router,
        json_request(
            "POST",
            &format!("/build/{}/test/{}", build_id, t1),
            serde_json::json!([line(now, "t1-line")]),
        ),
        StatusCode::CREATED,
    )
    .await;
    send_json(
        &app.router,
        json_request(
            "POST",
            &format!("/build/{}/test/{}", build_id, t2),
            serde_json::json!([line(now, "t2-line")]),
        ),
        StatusCode::CREATED,
    )
    .await;

    // One global line far before any test started, one far after t2
    // started (inside t2's open-ended window).
    send_json(
        &app.router,
        json_request(
            "POST",
            &format!("/build/{}", build_id),
            serde_json::json!([line(1.0, "ancient-global"), line(now + 1000.0, "late-global")]),
        ),
        StatusCode::CREATED,
    )
    .await;

    let (status, body) = send(
        &app.router,
        get_request(&format!("/build/{}/test/{}?raw=1", build_id, t1)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("t1-line"));
    assert!(!text.contains("ancient-global"));
    assert!(!text.contains("late-global"));
    assert!(!text.contains("t2-line"));

    let (_, body) = send(
        &app.router,
        get_request(&format!("/build/{}/test/{}?raw=1", build_id, t2)),
    )
    .await;
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("t2-line"));
    assert!(text.contains("late-global"));
    assert!(!text.contains("ancient-global"));

    // The all-logs view carries everything, newline-terminated.
    let (status, body) = send(
        &app.router,
        get_request(&format!("/build/{}/all?raw=1", build_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert_eq!(text.lines().count(), 4);
    assert!(text.starts_with("ancient-global\n"));
}

#[tokio::test]
async fn test_accept_header_selects_plain_text() {
    let app = test_app().await;
    let build_id = create_build(&app.router, "builder0", 1, false).await;
    send_json(
        &app.router,
        json_request(
            "POST",
            &format!("/build/{}", build_id),
            serde_json::json!([line(1.0, "hello")]),
        ),
        StatusCode::CREATED,
    )
    .await;

    let req = Request::builder()
        .method("GET")
        .uri(format!("/build/{}/all", build_id))
        .header(header::ACCEPT, "text/plain")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(req).await.unwrap();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello\n");
}

#[tokio::test]
async fn test_build_view_lists_tests_as_html() {
    let app = test_app().await;
    let build_id = create_build(&app.router, "builder0", 1, false).await;
    create_test(&app.router, &build_id, "alpha-test").await;
    create_test(&app.router, &build_id, "beta-test").await;

    let (status, body) = send(&app.router, get_request(&format!("/build/{}", build_id))).await;
    assert_eq!(status, StatusCode::OK);
    let page = String::from_utf8(body).unwrap();
    assert!(page.contains("builder0 #1"));
    assert!(page.contains("alpha-test"));
    assert!(page.contains("beta-test"));

    let (status, _) = send(&app.router, get_request("/build/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_all_logs_view_requires_build() {
    let app = test_app().await;
    let (status, _) = send(&app.router, get_request("/build/missing/all")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------
// Object-store tier
// ---------------------------------------------------------------

#[tokio::test]
async fn test_bucket_tier_reads_are_exclusively_from_bucket() {
    let app = test_app().await;
    let build_id = create_build(&app.router, "builder0", 1, true).await;
    let test_id = create_test(&app.router, &build_id, "s3-test").await;

    let now = chrono::Utc::now().timestamp() as f64;
    send_json(
        &app.router,
        json_request(
            "POST",
            &format!("/build/{}/test/{}", build_id, test_id),
            serde_json::json!([line(now, "mirrored-line")]),
        ),
        StatusCode::CREATED,
    )
    .await;

    // The append landed on both tiers.
    let (_, body) = send(
        &app.router,
        get_request(&format!("/build/{}/test/{}?raw=1", build_id, test_id)),
    )
    .await;
    assert!(String::from_utf8(body).unwrap().contains("mirrored-line"));

    // Drop the primary copy; the s3 view must still serve the line,
    // proving reads are routed to the bucket, not the primary store.
    sqlx::query("DELETE FROM chunks")
        .execute(app.state.db.pool())
        .await
        .unwrap();

    let (status, body) = send(
        &app.router,
        get_request(&format!(
            "/build/{}/test/{}?s3=1&raw=1",
            build_id, test_id
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("mirrored-line"));

    let (_, body) = send(
        &app.router,
        get_request(&format!("/build/{}/test/{}?raw=1", build_id, test_id)),
    )
    .await;
    assert!(!String::from_utf8(body).unwrap().contains("mirrored-line"));

    // Build view from the bucket tier.
    let (status, body) = send(
        &app.router,
        get_request(&format!("/build/{}?s3=1", build_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("s3-test"));
}

#[tokio::test]
async fn test_bucket_view_of_unknown_build_is_not_found() {
    let app = test_app().await;
    let (status, _) = send(&app.router, get_request("/build/missing?s3=1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bucket_flagged_create_fails_without_bucket_configured() {
    let app = test_app_with_bucket(false).await;
    let body = serde_json::json!({"builder": "builder0", "buildnum": 1, "s3": true});
    let (status, _) = send(&app.router, json_request("POST", "/build", body)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

// ---------------------------------------------------------------
// Status
// ---------------------------------------------------------------

#[tokio::test]
async fn test_status_reports_limits_and_queue_stats() {
    let app = test_app().await;
    let data = send_json(&app.router, get_request("/status"), StatusCode::OK).await;

    assert_eq!(data["err"], "");
    assert_eq!(data["db"], true);
    assert_eq!(
        data["maxRequestSize"],
        app.state.config.max_request_size as i64
    );
    assert_eq!(data["max_log_size"], 4 * 1024 * 1024);
    assert_eq!(data["workers"], 1);
    assert!(data["cleanup_queue_stats"]["pending"].is_number());
    assert!(data["cleanup_queue_stats"]["completed"].is_number());
}
