use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use client_core::{Command, ConferenceEngine, ConnectionStatus, EngineSettings};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shared::{
    domain::{Participant, SessionId, Stage},
    protocol::SessionConfig,
};
use tokio::{net::TcpListener, time::timeout};

#[derive(Clone)]
struct Backend {
    ids: Arc<Vec<&'static str>>,
    next: Arc<AtomicUsize>,
    close_replies: Arc<AtomicUsize>,
}

async fn start(State(backend): State<Backend>, Json(_body): Json<Value>) -> Json<Value> {
    let index = backend.next.fetch_add(1, Ordering::SeqCst);
    match backend.ids.get(index) {
        Some(id) => Json(json!({ "success": true, "conferenceId": id })),
        None => Json(json!({ "success": false, "error": "no capacity" })),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(backend): State<Backend>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| conference_socket(socket, id, backend.close_replies))
}

async fn send_json(sender: &mut futures::stream::SplitSink<WebSocket, Message>, frame: Value) {
    sender
        .send(Message::Text(frame.to_string()))
        .await
        .expect("send frame");
}

async fn close_with(sender: &mut futures::stream::SplitSink<WebSocket, Message>, code: u16) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "bye".into(),
        })))
        .await;
}

// Counts the peer's answer to our close frame.
async fn await_close_reply(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    replies: &AtomicUsize,
) {
    let reply = timeout(Duration::from_secs(2), async {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                return true;
            }
        }
        false
    })
    .await;
    if matches!(reply, Ok(true)) {
        replies.fetch_add(1, Ordering::SeqCst);
    }
}

async fn conference_socket(socket: WebSocket, id: String, close_replies: Arc<AtomicUsize>) {
    let (mut sender, mut receiver) = socket.split();

    if id == "stale" {
        send_json(&mut sender, json!({ "type": "error", "message": "會議不存在" })).await;
        close_with(&mut sender, 1000).await;
        return;
    }

    send_json(
        &mut sender,
        json!({ "type": "init", "messages": [], "stage": "waiting", "current_round": 0, "conclusion": null }),
    )
    .await;
    send_json(&mut sender, json!({ "type": "stage_change", "stage": "introduction" })).await;
    send_json(
        &mut sender,
        json!({
            "type": "new_message",
            "message": {
                "id": "m1",
                "speakerId": "moderator",
                "speakerName": "Moderator",
                "speakerTitle": "AI meeting facilitator",
                "text": "Welcome to the pricing review.",
                "timestamp": "2025-03-01T10:00:00.123456",
            },
            "current_speaker": "moderator",
        }),
    )
    .await;

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let command: Value = serde_json::from_str(&text).expect("command json");
        if command["type"] == "next_round" {
            send_json(&mut sender, json!({ "type": "stage_change", "stage": "discussion" })).await;
            send_json(&mut sender, json!({ "type": "round_update", "round": 1 })).await;
            send_json(&mut sender, json!({ "type": "stage_change", "stage": "ended" })).await;
            close_with(&mut sender, 1000).await;
            await_close_reply(&mut receiver, &close_replies).await;
            return;
        }
    }
}

async fn spawn_backend(ids: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let close_replies = Arc::new(AtomicUsize::new(0));
    let backend = Backend {
        ids: Arc::new(ids),
        next: Arc::new(AtomicUsize::new(0)),
        close_replies: close_replies.clone(),
    };
    let app = Router::new()
        .route("/api/conference/start", post(start))
        .route("/ws/conference/:id", get(ws_handler))
        .with_state(backend);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test backend");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve test backend");
    });
    (format!("http://{addr}"), close_replies)
}

fn pricing_config() -> SessionConfig {
    SessionConfig::new(
        "Pricing Strategy",
        2,
        vec![
            Participant::new("cfo", "Dana", "CFO"),
            Participant::new("pm", "Lee", "Product Manager"),
        ],
    )
    .with_moderator()
}

fn settings(server_url: String) -> EngineSettings {
    EngineSettings {
        server_url,
        reconnect_delay_ms: 50,
        ..EngineSettings::default()
    }
}

#[tokio::test]
async fn engine_follows_a_live_backend_until_it_closes() {
    let (url, close_replies) = spawn_backend(vec!["live"]).await;
    let mut engine = ConferenceEngine::from_settings(&settings(url)).expect("engine");

    let id = engine
        .start_session(pricing_config())
        .await
        .expect("start session");
    assert_eq!(id, SessionId::new("live"));

    timeout(
        Duration::from_secs(5),
        engine.run_until(|s| {
            s.connection.status == ConnectionStatus::Open
                && s.stage == Stage::Introduction
                && s.messages.len() == 1
        }),
    )
    .await
    .expect("initial sync");
    assert_eq!(
        engine.session().current_speaker.as_ref().map(|p| p.as_str()),
        Some("moderator")
    );

    engine.dispatch(Command::NextRound).expect("channel open");
    timeout(
        Duration::from_secs(5),
        engine.run_until(|s| s.connection.status == ConnectionStatus::Closed),
    )
    .await
    .expect("backend closes after ending");

    let session = engine.snapshot();
    assert_eq!(session.stage, Stage::Ended);
    assert_eq!(session.current_round, 1);
    assert_eq!(session.connection.last_close_code, Some(1000));
    assert!(session.anomalies.is_empty(), "{:?}", session.anomalies);
    assert!(engine.is_settled());

    let transcript = engine.export_transcript();
    assert!(transcript.contains("### 10:00:00 - Moderator (AI meeting facilitator):"));

    timeout(Duration::from_secs(5), async {
        while close_replies.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client answers the server's close frame");
}

#[tokio::test]
async fn forgotten_session_is_recreated() {
    let (url, _) = spawn_backend(vec!["stale", "fresh"]).await;
    let mut engine = ConferenceEngine::from_settings(&settings(url)).expect("engine");

    engine
        .start_session(pricing_config())
        .await
        .expect("start session");

    timeout(
        Duration::from_secs(5),
        engine.run_until(|s| {
            s.id == Some(SessionId::new("fresh")) && s.stage == Stage::Introduction
        }),
    )
    .await
    .expect("session recreated and synced");

    let session = engine.snapshot();
    assert_eq!(session.stage, Stage::Introduction);
    assert_eq!(session.connection.status, ConnectionStatus::Open);
    assert_eq!(session.topic(), "Pricing Strategy");
    engine.close();
}
