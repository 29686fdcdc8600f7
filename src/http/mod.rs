//! HTTP + SSE dashboard server: REST endpoints over the state snapshot and
//! the question table, an SSE bridge onto the event log, and an embedded-
//! with-override static asset fallback for the dashboard UI.
//!
//! Reads state the same way whether wired in-process (sharing memory with
//! the orchestrator) or standalone (reading only the files the orchestrator
//! writes): always through `state.json` with mtime-gated re-reads, matching
//! the reference's `Arc<RwLock<ServerState>>` callback-server discipline but
//! with the file as the single source of truth rather than a shared struct.

mod assets;
mod sse;

use crate::config::Config;
use crate::errors::HttpError;
use crate::ipc::{AnswerWriter, HeartbeatReader};
use crate::model::AutopilotState;
use crate::state::StateStore;
use assets::{static_handler, Assets};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::{watch, Mutex};

struct CachedState {
    mtime: Option<SystemTime>,
    state: AutopilotState,
}

struct StateReader {
    path: PathBuf,
    cache: Mutex<CachedState>,
}

impl StateReader {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: Mutex::new(CachedState {
                mtime: None,
                state: AutopilotState::fresh(),
            }),
        }
    }

    /// Re-reads `state.json` only when its mtime has advanced since the last
    /// read; otherwise returns the cached snapshot.
    async fn read(&self) -> AutopilotState {
        let disk_mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        let mut cache = self.cache.lock().await;
        if disk_mtime != cache.mtime || disk_mtime.is_none() {
            if let Ok(store) = StateStore::restore(self.path.clone()) {
                cache.state = store.get_state();
                cache.mtime = disk_mtime;
            }
        }
        cache.state.clone()
    }
}

pub struct AppState {
    config: Config,
    started_at: Instant,
    state_reader: StateReader,
    heartbeat: HeartbeatReader,
    answers: AnswerWriter,
    shutdown_tx: watch::Sender<bool>,
    static_override: Option<PathBuf>,
    event_hub: Arc<sse::EventHub>,
}

impl AppState {
    pub fn new(
        config: Config,
        shutdown_tx: watch::Sender<bool>,
        shutdown_signal: watch::Receiver<bool>,
        static_override: Option<PathBuf>,
    ) -> Arc<Self> {
        let event_hub = sse::EventHub::spawn(config.events_file(), shutdown_signal);
        Arc::new(Self {
            state_reader: StateReader::new(config.state_file()),
            heartbeat: HeartbeatReader::new(config.heartbeat_file()),
            answers: AnswerWriter::new(config.answers_dir()),
            static_override,
            config,
            started_at: Instant::now(),
            shutdown_tx,
            event_hub,
        })
    }
}

/// Builds the full router: REST API, SSE log stream, then the embedded/
/// override static asset fallback for anything else.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/phases", get(phases))
        .route("/api/milestones", get(milestones))
        .route("/api/questions", get(list_questions))
        .route("/api/questions/{id}", get(get_question).post(answer_question))
        .route("/api/shutdown", post(shutdown))
        .route("/api/log/stream", get(sse::log_stream))
        .fallback(static_handler)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.state_reader.read().await;
    Json(json!({
        "status": snapshot.status,
        "currentPhase": snapshot.current_phase,
        "currentStep": snapshot.current_step,
        "progress": snapshot.progress_percent(),
        "startedAt": snapshot.started_at,
        "lastUpdatedAt": snapshot.last_updated_at,
        "alive": state.heartbeat.is_alive(),
    }))
}

async fn phases(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.state_reader.read().await;
    Json(json!({ "phases": snapshot.phases }))
}

async fn milestones(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let text = load_roadmap_text(&state.config).unwrap_or_default();
    let counts = crate::roadmap::parse_milestones(&text);
    Json(json!({
        "phases": counts.phases,
        "phasesCompleted": counts.phases_completed,
        "plans": counts.plans,
    }))
}

/// Conventional roadmap document location: `ROADMAP.md` at the project
/// root, written by project-init alongside the other planning docs.
fn load_roadmap_text(config: &Config) -> Option<String> {
    std::fs::read_to_string(config.project_dir.join("ROADMAP.md")).ok()
}

async fn list_questions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.state_reader.read().await;
    Json(json!({ "questions": snapshot.pending_questions }))
}

async fn get_question(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let snapshot = state.state_reader.read().await;
    match snapshot.pending_questions.into_iter().find(|q| q.id == id) {
        Some(question) => Json(question).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "unknown question"}))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AnswerBody {
    answers: BTreeMap<String, String>,
}

async fn answer_question(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Response {
    let Ok(payload) = serde_json::from_slice::<AnswerBody>(&body) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "malformed body"}))).into_response();
    };
    if payload.answers.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "answers must not be empty"}))).into_response();
    }

    let snapshot = state.state_reader.read().await;
    let known = snapshot.pending_questions.iter().any(|q| q.id == id);
    if !known {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "unknown or already answered"}))).into_response();
    }

    match state.answers.submit(&id, payload.answers) {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "failed to write answer"}))).into_response(),
    }
}

/// Responds 200 immediately, then after a short drain lets the shared
/// shutdown `watch` flip true so the orchestrator observes it at its next
/// safe point, persists `status: idle`, and unwinds on its own — rather
/// than hard-exiting the process out from under it.
async fn shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let shutdown_tx = state.shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let _ = shutdown_tx.send(true);
    });
    Json(json!({"ok": true}))
}

/// Binds `port`, returning [`HttpError::PortInUse`] if it's already taken
/// (checked explicitly so the caller gets a precise error instead of a bare
/// OS error string).
pub async fn serve(
    state: Arc<AppState>,
    port: u16,
    mut shutdown_signal: watch::Receiver<bool>,
) -> Result<(), HttpError> {
    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::AddrInUse {
            HttpError::PortInUse(port)
        } else {
            HttpError::BindFailed(source)
        }
    })?;

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_signal.changed().await;
        })
        .await
        .map_err(HttpError::BindFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(dir: &std::path::Path) -> Arc<AppState> {
        let config = Config::load(dir.to_path_buf(), crate::config::RawConfig::default()).unwrap();
        let (tx, rx) = watch::channel(false);
        AppState::new(config, tx, rx, None)
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));
        let req = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn status_reflects_fresh_state_with_no_phases() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));
        let req = Request::builder().uri("/api/status").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["progress"], 0);
    }

    #[tokio::test]
    async fn unknown_question_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));
        let req = Request::builder()
            .uri("/api/questions/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn answering_unknown_question_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));
        let req = Request::builder()
            .method("POST")
            .uri("/api/questions/nope")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"answers":{"a":"b"}}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn answering_with_malformed_body_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));
        let req = Request::builder()
            .method("POST")
            .uri("/api/questions/nope")
            .header("content-type", "application/json")
            .body(Body::from("not json"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn spa_fallback_serves_embedded_index() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));
        let req = Request::builder().uri("/some/client/route").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn embedded_assets_type_is_reachable_from_outer_module() {
        assert!(Assets::get("index.html").is_some());
    }
}
