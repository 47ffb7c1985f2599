use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::domain::{Participant, Stage};
use tokio::net::TcpListener;

use super::*;

#[derive(Clone, Default)]
struct ServerState {
    created: Arc<Mutex<Vec<Value>>>,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

async fn start(State(state): State<ServerState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let topic = body["topic"].as_str().unwrap_or_default().to_string();
    state.created.lock().expect("created lock").push(body);
    match topic.as_str() {
        "" => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "detail": [{ "loc": ["body", "topic"], "msg": "field required" }] })),
        ),
        "explode" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "model backend unavailable" })),
        ),
        "refuse" => (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "too many participants" })),
        ),
        _ => (
            StatusCode::OK,
            Json(json!({ "success": true, "conferenceId": "conf-1", "message": "started" })),
        ),
    }
}

async fn fetch(Path(id): Path<String>) -> (StatusCode, Json<Value>) {
    if id == "missing" {
        return (StatusCode::NOT_FOUND, Json(json!({ "detail": "會議不存在" })));
    }
    (
        StatusCode::OK,
        Json(json!({
            "id": id,
            "config": { "topic": "Pricing Strategy", "rounds": 2, "participants": [] },
            "messages": [],
            "stage": "discussion",
            "current_round": 1,
            "start_time": "2025-03-01T10:00:00",
        })),
    )
}

async fn messages(
    State(state): State<ServerState>,
    Path(_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.queries.lock().expect("queries lock").push(query);
    Json(json!({
        "total": 42,
        "messages": [{
            "id": "m1",
            "speakerId": "cfo",
            "speakerName": "Dana",
            "speakerTitle": "CFO",
            "text": "Margins first.",
            "timestamp": "2025-03-01T10:01:00",
        }],
    }))
}

async fn scenarios() -> Json<Value> {
    Json(json!({
        "scenarios": {
            "business": { "name": "Business meeting", "description": "Quarterly planning" },
            "debate": { "name": "Debate" },
        },
        "default": "business",
        "selection_guide": "Pick the format closest to your goal.",
    }))
}

async fn spawn_backend() -> (String, ServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let state = ServerState::default();
    let app = Router::new()
        .route("/api/conference/start", post(start))
        .route("/api/conference/:id", get(fetch))
        .route("/api/conference/:id/messages", get(messages))
        .route("/api/scenarios", get(scenarios))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test backend");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve test backend");
    });
    (format!("http://{addr}/"), state)
}

fn config(topic: &str) -> SessionConfig {
    SessionConfig::new(topic, 2, vec![Participant::new("cfo", "Dana", "CFO")])
        .with_scenario("business")
        .with_moderator()
}

#[tokio::test]
async fn create_session_posts_config_and_returns_id() {
    let (url, state) = spawn_backend().await;
    let client = HttpRestClient::new(url);

    let id = client
        .create_session(&config("Pricing Strategy"))
        .await
        .expect("create session");
    assert_eq!(id, SessionId::new("conf-1"));

    let created = state.created.lock().expect("created lock");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["topic"], "Pricing Strategy");
    assert_eq!(created[0]["rounds"], 2);
    assert_eq!(created[0]["scenario"], "business");
    assert_eq!(created[0]["participants"][0]["id"], "moderator");
    assert_eq!(created[0]["participants"][1]["isActive"], true);
}

#[tokio::test]
async fn create_session_surfaces_backend_reasons() {
    let (url, _state) = spawn_backend().await;
    let client = HttpRestClient::new(url);

    let err = client
        .create_session(&config("explode"))
        .await
        .expect_err("500 should fail");
    let api = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(api.status, 500);
    assert_eq!(api.message, "model backend unavailable");

    let err = client
        .create_session(&config(""))
        .await
        .expect_err("422 should fail");
    let api = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(api.status, 422);
    assert_eq!(api.message, "body.topic: field required");

    let err = client
        .create_session(&config("refuse"))
        .await
        .expect_err("success=false should fail");
    assert_eq!(err.to_string(), "too many participants");
}

#[tokio::test]
async fn fetches_snapshot_messages_and_catalog() {
    let (url, state) = spawn_backend().await;
    let client = HttpRestClient::new(url);
    assert!(!client.server_url().ends_with('/'));

    let record = client
        .fetch_session(&SessionId::new("conf-1"))
        .await
        .expect("fetch session");
    assert_eq!(record.id, SessionId::new("conf-1"));
    assert_eq!(record.stage, Stage::Discussion);
    assert_eq!(record.current_round, 1);

    let page = client
        .fetch_messages(&SessionId::new("conf-1"), 20, 40)
        .await
        .expect("fetch messages");
    assert_eq!(page.total, 42);
    assert_eq!(page.messages[0].speaker_name, "Dana");
    let query = state.queries.lock().expect("queries lock")[0].clone();
    assert_eq!(query.get("limit").map(String::as_str), Some("20"));
    assert_eq!(query.get("offset").map(String::as_str), Some("40"));

    let catalog = client.fetch_scenarios().await.expect("fetch scenarios");
    assert_eq!(catalog.default.as_deref(), Some("business"));
    assert_eq!(catalog.display_name("debate"), Some("Debate"));
    assert_eq!(catalog.scenarios["debate"].description, "");
}

#[tokio::test]
async fn unknown_session_maps_to_not_found() {
    let (url, _state) = spawn_backend().await;
    let client = HttpRestClient::new(url);

    let err = client
        .fetch_session(&SessionId::new("missing"))
        .await
        .expect_err("missing session");
    let api = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(api.status, 404);
    assert_eq!(api.message, "會議不存在");
}
