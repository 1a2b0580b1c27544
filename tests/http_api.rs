//! End-to-end tests for the HTTP API, driving the router in-process.

use anyhow::{bail, Result};
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use pipeline_serve::files::FileStore;
use pipeline_serve::pipeline::{NodeParameters, Pipeline};
use pipeline_serve::registry::{LazyRegistry, PipelineRegistry};
use pipeline_serve::server::{build_router, AppState};

const BOUNDARY: &str = "XBOUNDARYX";

struct Qa {
    runs: AtomicUsize,
    warm_ups: AtomicUsize,
}

#[async_trait]
impl Pipeline for Qa {
    fn metadata(&self) -> Value {
        json!({ "description": "question answering" })
    }

    fn nodes(&self) -> Vec<String> {
        vec!["retriever".to_string(), "reader".to_string()]
    }

    async fn warm_up(&self) -> Result<()> {
        self.warm_ups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run(&self, data: Map<String, Value>, parameters: NodeParameters, debug: bool) -> Result<Value> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if data.get("fail") == Some(&Value::Bool(true)) {
            bail!("index unavailable");
        }
        Ok(json!({ "answers": ["42"], "data": data, "parameters": parameters, "debug": debug }))
    }
}

struct Broken;

#[async_trait]
impl Pipeline for Broken {
    fn metadata(&self) -> Value {
        json!({})
    }

    fn nodes(&self) -> Vec<String> {
        vec!["only".to_string()]
    }

    async fn warm_up(&self) -> Result<()> {
        bail!("model weights missing")
    }

    async fn run(&self, _: Map<String, Value>, _: NodeParameters, _: bool) -> Result<Value> {
        bail!("model weights missing")
    }
}

struct Harness {
    _dir: TempDir,
    root: std::path::PathBuf,
    qa: Arc<Qa>,
    app: Router,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("files");
    let qa = Arc::new(Qa {
        runs: AtomicUsize::new(0),
        warm_ups: AtomicUsize::new(0),
    });
    let registry = PipelineRegistry::from_pipelines([
        ("qa", qa.clone() as Arc<dyn Pipeline>),
        ("broken", Arc::new(Broken) as Arc<dyn Pipeline>),
    ])
    .unwrap();

    let state = AppState::new(FileStore::open(&root).unwrap(), LazyRegistry::ready(registry));
    let app = build_router(state, 1024 * 1024);
    Harness {
        _dir: dir,
        root,
        qa,
        app,
    }
}

fn multipart_body(filename: &str, content: &str) -> String {
    format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n{c}\r\n--{b}--\r\n",
        b = BOUNDARY,
        f = filename,
        c = content
    )
}

fn upload(uri: &str, filename: &str, content: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(filename, content)))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, req).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn first_error(body: &Value) -> &str {
    body["errors"][0].as_str().unwrap()
}

#[tokio::test]
async fn empty_root_lists_as_empty_array() {
    let h = harness();
    let (status, body) = send_json(&h.app, get("/files")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn upload_then_download_round_trip() {
    let h = harness();

    let (status, body) = send(&h.app, upload("/files/a/b/c.txt", "ignored.txt", "hi")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    let (status, body) = send(&h.app, get("/files/a/b/c.txt")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hi");

    let (_, listing) = send_json(&h.app, get("/files/a")).await;
    assert_eq!(listing, json!(["b"]));
    assert!(!h.root.join("ignored.txt").exists());
}

#[tokio::test]
async fn upload_without_path_uses_filename() {
    let h = harness();
    let (status, _) = send(&h.app, upload("/files", "report.csv", "a,b\n1,2\n")).await;
    assert_eq!(status, StatusCode::OK);

    let resp = h.app.clone().oneshot(get("/files/report.csv")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/csv");
    assert_eq!(resp.headers()[header::CONTENT_LENGTH], "8");
}

#[tokio::test]
async fn second_upload_conflicts_and_keeps_original() {
    let h = harness();
    send(&h.app, upload("/files/x.txt", "x.txt", "first")).await;

    let (status, body) = send_json(&h.app, upload("/files/x.txt", "x.txt", "second")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        first_error(&body),
        "A file with the same name already exist. Rename it and try again."
    );
    assert_eq!(std::fs::read_to_string(h.root.join("x.txt")).unwrap(), "first");
}

#[tokio::test]
async fn upload_escaping_root_is_rejected() {
    let h = harness();
    let (status, body) = send_json(&h.app, upload("/files/../../etc/evil", "evil", "x")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["errors"].is_array());
    assert!(!h.root.parent().unwrap().join("etc").exists());
}

#[tokio::test]
async fn upload_requires_file_field() {
    let h = harness();
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nvalue\r\n--{b}--\r\n",
        b = BOUNDARY
    );
    let req = Request::builder()
        .method("POST")
        .uri("/files/x.txt")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap();

    let (status, body) = send_json(&h.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(first_error(&body).contains("'file'"));
}

#[tokio::test]
async fn missing_path_is_not_found() {
    let h = harness();
    let (status, body) = send_json(&h.app, get("/files/nope/missing.txt")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(first_error(&body), "'nope/missing.txt' does not exist.");
}

#[tokio::test]
async fn lists_pipelines_with_metadata() {
    let h = harness();
    let (status, body) = send_json(&h.app, get("/pipelines")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["qa"]["description"], "question answering");
    assert!(body.get("broken").is_some());
}

#[tokio::test]
async fn run_returns_engine_result() {
    let h = harness();
    let (status, body) = send_json(
        &h.app,
        post_json(
            "/pipelines/qa/run",
            json!({ "data": { "query": "?" }, "parameters": { "retriever": { "top_k": 3 } } }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["answers"], json!(["42"]));
    assert_eq!(body["parameters"]["retriever"]["top_k"], 3);
    assert_eq!(body["debug"], false);
}

#[tokio::test]
async fn run_accepts_empty_body_and_debug_query() {
    let h = harness();
    let (status, body) = send_json(&h.app, post_empty("/pipelines/qa/run?debug=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["debug"], true);
}

#[tokio::test]
async fn run_rejects_malformed_body() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/pipelines/qa/run")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send_json(&h.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(first_error(&body).starts_with("Invalid run request body"));
    assert_eq!(h.qa.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_pipeline_lists_available_names() {
    let h = harness();
    let (status, body) = send_json(&h.app, post_json("/pipelines/nope/run", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        first_error(&body),
        "Pipeline named 'nope' not found. Available pipelines: broken, qa"
    );
}

#[tokio::test]
async fn unknown_node_is_rejected_without_running() {
    let h = harness();
    let (status, body) = send_json(
        &h.app,
        post_json("/pipelines/qa/run", json!({ "parameters": { "ranker": {} } })),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        first_error(&body),
        "Node named 'ranker' not found. Available nodes for 'qa': retriever, reader"
    );
    assert_eq!(h.qa.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn engine_failure_is_500_and_service_keeps_working() {
    let h = harness();
    let (status, body) = send_json(
        &h.app,
        post_json("/pipelines/qa/run", json!({ "data": { "fail": true } })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        first_error(&body),
        "Pipeline 'qa' failed. Exception: index unavailable"
    );

    let (status, _) = send_json(&h.app, post_json("/pipelines/qa/run", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn warm_up_one_and_all() {
    let h = harness();

    let (status, body) = send_json(&h.app, post_empty("/pipelines/qa/warmup")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pipeline"], "qa");
    assert!(body.get("error").is_none());

    let (status, _) = send_json(&h.app, post_empty("/pipelines/nope/warmup")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send_json(&h.app, post_empty("/pipelines/warmup")).await;
    assert_eq!(status, StatusCode::OK);
    let reports = body.as_array().unwrap();
    assert_eq!(reports.len(), 2);
    let broken = reports.iter().find(|r| r["pipeline"] == "broken").unwrap();
    assert!(broken["error"].as_str().unwrap().contains("model weights missing"));
    assert_eq!(h.qa.warm_ups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ready_and_health() {
    let h = harness();
    let (status, body) = send_json(&h.app, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(true));

    let (_, body) = send_json(&h.app, get("/health")).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn failed_registry_load_is_reported_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let definitions = dir.path().join("pipelines.toml");
    let store = FileStore::open(dir.path().join("files")).unwrap();
    let app = build_router(
        AppState::new(store, LazyRegistry::new(definitions.clone())),
        1024,
    );

    let (status, body) = send_json(&app, get("/pipelines")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(first_error(&body).starts_with("Failed to load pipelines"));

    std::fs::write(&definitions, "").unwrap();
    let (status, body) = send_json(&app, get("/pipelines")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));
}

fn ingest_request(uri: &str, files: &[(&str, &str)]) -> Request<Body> {
    let mut body = String::new();
    for (filename, content) in files {
        body.push_str(&format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{f}\"\r\n\
             Content-Type: text/plain\r\n\r\n{c}\r\n",
            b = BOUNDARY,
            f = filename,
            c = content
        ));
    }
    body.push_str(&format!("--{}--\r\n", BOUNDARY));

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

fn stored_names(root: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn ingest_runs_pipeline_over_files_and_removes_them() {
    let h = harness();
    let (status, body) = send_json(
        &h.app,
        ingest_request(
            "/pipelines/qa/ingest",
            &[("a.txt", "alpha"), ("a.txt", "beta")],
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let sources = body["data"]["retriever"]["sources"].as_array().unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0]["filename"], "a.txt");
    assert_eq!(sources[0]["text"], "alpha");
    assert_eq!(sources[1]["text"], "beta");
    assert_ne!(sources[0]["path"], sources[1]["path"]);
    assert!(sources[0]["path"].as_str().unwrap().ends_with("_a.txt"));
    assert_eq!(h.qa.runs.load(Ordering::SeqCst), 1);
    assert!(stored_names(&h.root).is_empty());
}

#[tokio::test]
async fn ingest_keeps_files_on_request() {
    let h = harness();
    let (status, _) = send(
        &h.app,
        ingest_request(
            "/pipelines/qa/ingest?keep_files=true",
            &[("a.txt", "alpha"), ("b.txt", "beta")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let names = stored_names(&h.root);
    assert_eq!(names.len(), 2);
    assert!(names.iter().any(|n| n.ends_with("_a.txt")));
    assert!(names.iter().any(|n| n.ends_with("_b.txt")));
}

#[tokio::test]
async fn ingest_into_unknown_pipeline_stores_nothing() {
    let h = harness();
    let (status, body) = send_json(
        &h.app,
        ingest_request("/pipelines/nope/ingest?keep_files=true", &[("a.txt", "alpha")]),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(first_error(&body).starts_with("Pipeline named 'nope' not found."));
    assert!(stored_names(&h.root).is_empty());
}

#[tokio::test]
async fn ingest_without_files_is_rejected() {
    let h = harness();
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nvalue\r\n--{b}--\r\n",
        b = BOUNDARY
    );
    let req = Request::builder()
        .method("POST")
        .uri("/pipelines/qa/ingest")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap();
    let (status, body) = send_json(&h.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first_error(&body), "No files were uploaded.");
    assert_eq!(h.qa.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ingest_engine_failure_still_removes_files() {
    let h = harness();
    let (status, body) = send_json(
        &h.app,
        ingest_request("/pipelines/broken/ingest", &[("a.txt", "alpha")]),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        first_error(&body),
        "Pipeline 'broken' failed. Exception: model weights missing"
    );
    assert!(stored_names(&h.root).is_empty());
}

#[tokio::test]
async fn unknown_route_uses_error_envelope() {
    let h = harness();
    let (status, body) = send_json(&h.app, get("/nowhere")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(first_error(&body), "No route for GET /nowhere");
}

#[tokio::test]
async fn wrong_method_uses_error_envelope() {
    let h = harness();
    let req = Request::builder()
        .method("DELETE")
        .uri("/files")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&h.app, req).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(first_error(&body), "Method DELETE is not allowed for /files");
}

#[tokio::test]
async fn trailing_slash_lists_the_root() {
    let h = harness();
    send(&h.app, upload("/files", "x.txt", "x")).await;
    let (status, body) = send_json(&h.app, get("/files/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["x.txt"]));
}

#[tokio::test]
async fn oversized_run_body_uses_error_envelope() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/pipelines/qa/run")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(vec![b' '; 2 * 1024 * 1024]))
        .unwrap();
    let (status, body) = send_json(&h.app, req).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(body["errors"][0].is_string());
    assert_eq!(h.qa.runs.load(Ordering::SeqCst), 0);
}
