use std::{sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use common::{
    storage::types::research_job::{JobStatus, ResearchJob, Verbosity},
    utils::config::AppConfig,
};
use research_pipeline::{
    build_research_services,
    testing::{memory_db, MockEngine},
    ProgressEvent, ProgressSink, ProgressUpdate, WorkerPool,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::{api_routes_v1, api_state::ApiState};

struct TestApp {
    router: Router,
    state: ApiState,
    engine: Arc<MockEngine>,
    pool: Option<WorkerPool>,
}

async fn test_app() -> TestApp {
    let db = memory_db().await;
    let config = AppConfig::default();
    let engine = Arc::new(MockEngine::three_stages());
    let (research, pool) = build_research_services(Arc::clone(&db), &config, engine.clone());
    let state = ApiState::new(db, &config, research);
    let router = Router::new()
        .nest("/api/v1", api_routes_v1(&state))
        .with_state(state.clone());

    TestApp {
        router,
        state,
        engine,
        pool: Some(pool),
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router response");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body");
    (status, body.to_vec())
}

async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(router, request).await;
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).expect("json body")
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn with_json(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn empty(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn completed_job(app: &TestApp, question: &str) -> ResearchJob {
    let db = &app.state.db;
    let job = ResearchJob::create_and_add_to_db("ds1".into(), question.into(), Verbosity::Standard, db)
        .await
        .expect("create");
    let running = ResearchJob::claim(&job.id, "test-worker", db)
        .await
        .expect("claim")
        .expect("claimed");
    running
        .mark_completed(json!({"direct_answer": "up"}), db)
        .await
        .expect("complete")
}

#[tokio::test]
async fn submit_returns_job_id_and_pending_status() {
    let app = test_app().await;

    let (status, body) = send_json(
        &app.router,
        with_json(
            "POST",
            "/api/v1/research",
            &json!({"subject_ref": "ds1", "question": "trend?"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().expect("job id").to_string();

    let (status, job) = send_json(&app.router, get(&format!("/api/v1/research/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "pending");
    assert_eq!(job["progress_percent"], 0);
    assert_eq!(job["verbosity"], "standard");
    assert!(job.get("result").is_none());
}

#[tokio::test]
async fn submit_rejects_invalid_requests_without_creating_jobs() {
    let app = test_app().await;

    let (status, _) = send_json(
        &app.router,
        with_json(
            "POST",
            "/api/v1/research",
            &json!({"subject_ref": "ds1", "question": "   "}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(
        &app.router,
        with_json(
            "POST",
            "/api/v1/research",
            &json!({"subject_ref": "unknown", "question": "trend?"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, jobs) = send_json(&app.router, get("/api/v1/research")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs, json!([]));
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let app = test_app().await;
    let (status, body) = send_json(&app.router, get("/api/v1/research/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn search_requires_minimum_query_length() {
    let app = test_app().await;
    completed_job(&app, "What drives revenue?").await;
    completed_job(&app, "Churn by cohort").await;

    let (status, _) = send_json(&app.router, get("/api/v1/research/search?query=re")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, hits) = send_json(&app.router, get("/api/v1/research/search?query=REVENUE")).await;
    assert_eq!(status, StatusCode::OK);
    let hits = hits.as_array().expect("array");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["question"], "What drives revenue?");
    assert!(hits[0].get("result").is_none());
}

#[tokio::test]
async fn list_filters_by_status() {
    let app = test_app().await;
    completed_job(&app, "finished").await;
    ResearchJob::create_and_add_to_db("ds1".into(), "waiting".into(), Verbosity::Standard, &app.state.db)
        .await
        .expect("create");

    let (status, jobs) = send_json(&app.router, get("/api/v1/research?status=completed")).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = jobs.as_array().expect("array");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["question"], "finished");

    let (_, jobs) = send_json(&app.router, get("/api/v1/research?subject_ref=ds1&limit=1")).await;
    assert_eq!(jobs.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn history_rows_carry_a_result_preview() {
    let app = test_app().await;
    let db = &app.state.db;
    let job = ResearchJob::create_and_add_to_db(
        "ds1".into(),
        "Why did margins shrink?".into(),
        Verbosity::Verbose,
        db,
    )
    .await
    .expect("create");
    let running = ResearchJob::claim(&job.id, "test-worker", db)
        .await
        .expect("claim")
        .expect("claimed");
    let answer = "é".repeat(250);
    running
        .mark_completed(
            json!({
                "direct_answer": answer,
                "key_findings": ["freight", "discounts", "mix"],
                "methodology": "cohorts",
                "stages_completed": ["synthesize", "follow_ups", "verbose_analysis"],
            }),
            db,
        )
        .await
        .expect("complete");
    ResearchJob::create_and_add_to_db("ds1".into(), "still waiting".into(), Verbosity::Standard, db)
        .await
        .expect("create");

    let (status, jobs) = send_json(&app.router, get("/api/v1/research?status=completed")).await;
    assert_eq!(status, StatusCode::OK);
    let row = &jobs[0];
    assert!(row.get("result").is_none());
    let preview = &row["preview"];
    assert_eq!(
        preview["direct_answer"].as_str().map(|text| text.chars().count()),
        Some(200)
    );
    assert_eq!(preview["key_findings_count"], 3);
    assert_eq!(preview["has_verbose_analysis"], true);
    assert_eq!(preview["stages_completed"], 3);

    let (_, hits) = send_json(&app.router, get("/api/v1/research/search?query=margins")).await;
    assert_eq!(hits[0]["preview"]["key_findings_count"], 3);

    let (_, pending) = send_json(&app.router, get("/api/v1/research?status=pending")).await;
    assert_eq!(pending[0]["question"], "still waiting");
    assert!(pending[0].get("preview").is_none());

    let (_, full) = send_json(&app.router, get(&format!("/api/v1/research/{}", job.id))).await;
    assert!(full.get("preview").is_none());
    assert_eq!(full["result"]["key_findings"][2], "mix");
}

#[tokio::test]
async fn cancel_is_idempotent_and_accepted() {
    let app = test_app().await;
    let job = ResearchJob::create_and_add_to_db("ds1".into(), "trend?".into(), Verbosity::Standard, &app.state.db)
        .await
        .expect("create");
    let uri = format!("/api/v1/research/{}/cancel", job.id);

    let (status, body) = send_json(&app.router, empty("POST", &uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"accepted": true}));

    let (status, body) = send_json(&app.router, empty("DELETE", &uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"accepted": true}));

    let (_, job) = send_json(&app.router, get(&format!("/api/v1/research/{}", job.id))).await;
    assert_eq!(job["status"], "cancelled");
    assert!(job.get("error_message").is_none());
    assert_eq!(job["started_at"], Value::Null);

    let (status, body) = send_json(&app.router, empty("POST", "/api/v1/research/missing/cancel")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"accepted": true}));
    assert_eq!(app.state.research.cancellation.pending_requests(), 0);
}

#[tokio::test]
async fn delete_only_removes_finished_jobs_and_releases_artifacts() {
    let app = test_app().await;
    let running = ResearchJob::create_and_add_to_db("ds1".into(), "busy".into(), Verbosity::Standard, &app.state.db)
        .await
        .expect("create");
    ResearchJob::claim(&running.id, "test-worker", &app.state.db)
        .await
        .expect("claim")
        .expect("claimed");

    let (status, _) = send_json(
        &app.router,
        empty("DELETE", &format!("/api/v1/research/{}", running.id)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let done = completed_job(&app, "finished").await;
    let (status, body) = send(
        &app.router,
        empty("DELETE", &format!("/api/v1/research/{}", done.id)),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());

    let (status, _) = send_json(&app.router, get(&format!("/api/v1/research/{}", done.id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(app.engine.released(), vec![done.id.clone()]);

    let (_, history) = send_json(&app.router, get("/api/v1/research/search?query=finished")).await;
    assert_eq!(history, json!([]));
}

#[tokio::test]
async fn metadata_patch_merges_fields() {
    let app = test_app().await;
    let job = completed_job(&app, "finished").await;
    let uri = format!("/api/v1/research/{}/metadata", job.id);

    send_json(&app.router, with_json("PATCH", &uri, &json!({"tags": ["q3"]}))).await;
    let (status, updated) =
        send_json(&app.router, with_json("PATCH", &uri, &json!({"pinned": true}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["metadata"], json!({"tags": ["q3"], "pinned": true}));
    assert_eq!(updated["result"]["direct_answer"], "up");
}

#[tokio::test]
async fn stream_for_finished_job_emits_only_the_terminal_event() {
    let app = test_app().await;
    let job = completed_job(&app, "finished").await;

    let (status, body) = send(&app.router, get(&format!("/api/v1/research/{}/stream", job.id))).await;
    let body = String::from_utf8(body).expect("utf8");

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("event: completed"));
    assert!(!body.contains("event: progress"));
    assert_eq!(app.state.research.progress.tracked_jobs(), 0);
}

#[tokio::test]
async fn stream_rejects_mismatched_subject() {
    let app = test_app().await;
    let job = completed_job(&app, "finished").await;

    let (_, body) = send(
        &app.router,
        get(&format!("/api/v1/research/{}/stream?subject_ref=ds2", job.id)),
    )
    .await;
    let body = String::from_utf8(body).expect("utf8");
    assert!(body.contains("event: error"));
}

#[tokio::test]
async fn stream_relays_live_progress_then_closes() {
    let app = test_app().await;
    let job = ResearchJob::create_and_add_to_db("ds1".into(), "live".into(), Verbosity::Standard, &app.state.db)
        .await
        .expect("create");
    ResearchJob::claim(&job.id, "test-worker", &app.state.db)
        .await
        .expect("claim")
        .expect("claimed");

    let hub = Arc::clone(&app.state.research.progress);
    let job_id = job.id.clone();
    let publisher = tokio::spawn(async move {
        while hub.subscriber_count(&job_id) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        hub.publish(ProgressEvent::Progress(ProgressUpdate {
            job_id: job_id.clone(),
            stage: "Decomposing question".into(),
            percent: 33,
            sequence: 1,
        }));
        hub.publish(ProgressEvent::Terminal {
            job_id,
            status: JobStatus::Completed,
            error: None,
        });
    });

    let (status, body) = send(&app.router, get(&format!("/api/v1/research/{}/stream", job.id))).await;
    publisher.await.expect("publisher");
    let body = String::from_utf8(body).expect("utf8");

    assert_eq!(status, StatusCode::OK);
    let progress_at = body.find("event: progress").expect("progress event");
    let completed_at = body.find("event: completed").expect("terminal event");
    assert!(progress_at < completed_at);
    assert!(body.contains("\"percent\":33"));
}

#[tokio::test]
async fn submitted_job_runs_to_completion_with_workers() {
    let mut app = test_app().await;
    let pool = app.pool.take().expect("pool");
    let handle = pool
        .start(CancellationToken::new())
        .await
        .expect("start workers");

    let (_, body) = send_json(
        &app.router,
        with_json(
            "POST",
            "/api/v1/research",
            &json!({"subject_ref": "ds1", "question": "trend?", "verbosity": "verbose"}),
        ),
    )
    .await;
    let job_id = body["job_id"].as_str().expect("job id").to_string();

    let mut job = Value::Null;
    for _ in 0..200 {
        let (_, polled) = send_json(&app.router, get(&format!("/api/v1/research/{job_id}"))).await;
        if polled["status"] == "completed" {
            job = polled;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(job["status"], "completed");
    assert_eq!(job["progress_percent"], 100);
    assert_eq!(job["current_stage"], Value::Null);
    assert_eq!(
        job["result"]["stages_completed"],
        json!(["decompose", "execute", "synthesize", "verbose_analysis"])
    );
    assert_eq!(app.engine.calls().len(), 4);

    handle.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn health_endpoints_report_ready() {
    let app = test_app().await;

    let (status, body) = send_json(&app.router, get("/api/v1/live")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send_json(&app.router, get("/api/v1/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["db"], "ok");
}
