// src/api.rs
//
// =============================================================================
// CRUCIBLE: HTTP SURFACE
// =============================================================================
//
// Thin adapter over the engine. Validation and authentication end here;
// the supervisor only ever sees well-formed seeds with a resolved owner.
//
// Routes:
//   POST /api/submit        submit source + inputs, returns the job id
//   GET  /api/job/{id}      fetch one job (result block once done)
//   GET  /api/jobs          tenant listing, newest-first
//   GET  /health            unauthenticated liveness probe

use crate::config::Config;
use crate::core::{InputFile, Job, JobSeed, JobStatus};
use crate::store::{JobStore, StoreError};
use crate::supervisor::Supervisor;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

const API_KEY_HEADER: &str = "x-api-key";
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<JobStore>,
    pub engine: Supervisor,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/submit", post(submit))
        .route("/api/job/{id}", get(get_job))
        .route("/api/jobs", get(list_jobs))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

// ============================================================================
// 1. ERROR MAPPING
// ============================================================================

enum ApiError {
    Validation(String),
    Auth,
    NotFound,
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound,
            other => ApiError::Store(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Auth => (StatusCode::UNAUTHORIZED, "missing or invalid API key".into()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "job not found".into()),
            ApiError::Store(e) => {
                log::error!("store failure in the HTTP layer: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "storage error".into())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// The key itself is the tenant token: jobs are tagged with it and listing
/// and fetching are scoped by it.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::Auth)?;
    match state.store.key_exists(key) {
        Ok(true) => Ok(key.to_string()),
        Ok(false) => Err(ApiError::Auth),
        Err(e) => Err(ApiError::Store(e)),
    }
}

// ============================================================================
// 2. HANDLERS
// ============================================================================

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    source: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    input_files: Vec<InputFile>,
}

async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<Value>, ApiError> {
    let owner = authenticate(&state, &headers)?;

    let seed = JobSeed {
        owner,
        source: req.source,
        args: req.args,
        input_files: req.input_files,
    };
    seed.validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let id = state.engine.submit(&seed)?;
    Ok(Json(json!({
        "job_id": id,
        "status": JobStatus::NotStarted,
    })))
}

async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let owner = authenticate(&state, &headers)?;
    let job = state.store.get(id, Some(&owner))?;
    Ok(Json(job_view(&job)))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let owner = authenticate(&state, &headers)?;
    let limit = params.limit.unwrap_or(50).min(200);
    let offset = params.offset.unwrap_or(0);
    let jobs = state.store.list(&owner, limit, offset)?;
    Ok(Json(json!({ "jobs": jobs })))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": state.config.project_label,
    }))
}

/// Client view of one job. The result block appears only once the record
/// is terminal; buffers are rendered lossily for JSON transport.
fn job_view(job: &Job) -> Value {
    let mut view = json!({
        "job_id": job.id,
        "status": job.status,
        "created_at": job.created_at,
        "started_at": job.started_at,
        "completed_at": job.completed_at,
    });
    if job.status == JobStatus::Done {
        view["result"] = json!({
            "stdout": String::from_utf8_lossy(&job.stdout),
            "stderr": String::from_utf8_lossy(&job.stderr),
            "crashed": job.crashed,
            "timed_out": job.timed_out,
            "peak_memory_mb": job.peak_memory_mb,
            "peak_cpu_pct": job.peak_cpu_pct,
            "execution_ms": job.execution_ms,
        });
    }
    view
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::AttachStream;
    use crate::monitor::StatsStream;
    use crate::sandbox::{SandboxRuntime, SandboxSpec};
    use anyhow::bail;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Runtime that refuses every sandbox; enough for adapter tests, which
    /// only care about the HTTP boundary.
    struct RejectingRuntime;

    #[async_trait]
    impl SandboxRuntime for RejectingRuntime {
        async fn create(&self, _spec: &SandboxSpec) -> anyhow::Result<String> {
            bail!("no runtime in adapter tests")
        }
        async fn upload(&self, _id: &str, _archive: Vec<u8>, _path: &str) -> anyhow::Result<()> {
            bail!("no runtime in adapter tests")
        }
        async fn attach(&self, _id: &str) -> anyhow::Result<AttachStream> {
            bail!("no runtime in adapter tests")
        }
        async fn start(&self, _id: &str) -> anyhow::Result<()> {
            bail!("no runtime in adapter tests")
        }
        async fn stats(&self, _id: &str) -> anyhow::Result<StatsStream> {
            bail!("no runtime in adapter tests")
        }
        async fn wait(&self, _id: &str) -> anyhow::Result<i64> {
            bail!("no runtime in adapter tests")
        }
        async fn kill(&self, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn remove(&self, _id: &str, _force: bool) -> anyhow::Result<()> {
            Ok(())
        }
        async fn list_labeled(&self, _key: &str, _value: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn test_app() -> (tempfile::TempDir, Router, Arc<JobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("api.db")).unwrap());
        let config = Arc::new(Config::default());
        let engine = Supervisor::new(store.clone(), Arc::new(RejectingRuntime), config.clone());
        let app = router(AppState {
            store: store.clone(),
            engine,
            config,
        });
        (dir, app, store)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn submit_request(key: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/submit")
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_key() {
        let (_dir, app, _store) = test_app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "crucible");
    }

    #[tokio::test]
    async fn submit_without_key_is_401() {
        let (_dir, app, _store) = test_app();
        let response = app
            .oneshot(submit_request(None, json!({"source": "class Main {}"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn submit_with_unknown_key_is_401() {
        let (_dir, app, _store) = test_app();
        let response = app
            .oneshot(submit_request(
                Some("nope"),
                json!({"source": "class Main {}"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn submit_rejects_empty_source_and_bad_names() {
        let (_dir, app, store) = test_app();
        store.add_key("k1", "").unwrap();

        let response = app
            .clone()
            .oneshot(submit_request(Some("k1"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(submit_request(
                Some("k1"),
                json!({
                    "source": "class Main {}",
                    "input_files": [{"name": "../etc/passwd", "content": "x"}],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("../etc/passwd"));
    }

    #[tokio::test]
    async fn submit_returns_id_and_fetch_is_owner_scoped() {
        let (_dir, app, store) = test_app();
        store.add_key("k1", "").unwrap();
        store.add_key("k2", "").unwrap();

        let response = app
            .clone()
            .oneshot(submit_request(
                Some("k1"),
                json!({"source": "class Main {}", "args": ["x"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "not_started");
        let id = body["job_id"].as_str().unwrap().to_string();

        // Owner sees it.
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/job/{id}"))
                    .header("x-api-key", "k1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Another tenant gets 404, not 403.
        let response = app
            .oneshot(
                Request::get(format!("/api/job/{id}"))
                    .header("x-api-key", "k2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listing_is_scoped_and_paged() {
        let (_dir, app, store) = test_app();
        store.add_key("k1", "").unwrap();

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(submit_request(Some("k1"), json!({"source": "class Main {}"})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(
                Request::get("/api/jobs?limit=2")
                    .header("x-api-key", "k1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["jobs"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let (_dir, app, store) = test_app();
        store.add_key("k1", "").unwrap();
        let response = app
            .oneshot(
                Request::get(format!("/api/job/{}", Uuid::new_v4()))
                    .header("x-api-key", "k1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
