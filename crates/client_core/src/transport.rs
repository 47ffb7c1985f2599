use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use shared::domain::SessionId;
use tokio::{
    sync::mpsc,
    task::AbortHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

/// Close code sent or received on a clean shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code the backend uses for an internal fault.
pub const CLOSE_SERVER_FAULT: u16 = 1011;
/// Reported when the stream ends without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Opened,
    Text(String),
    /// Transport-level failure, including a failed connect.
    Failed(String),
    Closed {
        code: Option<u16>,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Channel {
        generation: u64,
        signal: ChannelSignal,
    },
    RetryDue {
        generation: u64,
    },
}

#[derive(Debug, Clone)]
pub struct ChannelEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEvents {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened(&self) {
        self.emit(ChannelSignal::Opened);
    }

    pub fn text(&self, text: impl Into<String>) {
        self.emit(ChannelSignal::Text(text.into()));
    }

    pub fn failed(&self, reason: impl Into<String>) {
        self.emit(ChannelSignal::Failed(reason.into()));
    }

    pub fn closed(&self, code: Option<u16>, reason: impl Into<String>) {
        self.emit(ChannelSignal::Closed {
            code,
            reason: reason.into(),
        });
    }

    fn emit(&self, signal: ChannelSignal) {
        // A closed inbox means the engine is gone; nothing left to tell.
        let _ = self.tx.send(EngineEvent::Channel {
            generation: self.generation,
            signal,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

#[derive(Debug)]
pub struct ChannelLink {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: Option<AbortHandle>,
}

impl ChannelLink {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>, task: Option<AbortHandle>) -> Self {
        Self { outbound, task }
    }

    /// Queues one text payload. Fails when the channel task has already ended.
    pub fn send_text(&self, text: String) -> bool {
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    pub fn close(self) {
        if self.outbound.send(Outbound::Close).is_err() {
            if let Some(task) = &self.task {
                task.abort();
            }
        }
    }
}

pub trait Connector: Send + Sync {
    fn open(&self, session_id: &SessionId, events: ChannelEvents) -> ChannelLink;
}

/// Websocket connector for `ws(s)://<host>/ws/conference/{id}`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base: Url,
}

impl WsConnector {
    pub fn new(server_url: &str) -> Result<Self> {
        let mut base = Url::parse(server_url)
            .with_context(|| format!("invalid server url: {server_url}"))?;
        let scheme = match base.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(anyhow!(
                    "server_url must start with http:// or https://, got {other}://"
                ))
            }
        };
        base.set_scheme(scheme)
            .map_err(|()| anyhow!("cannot switch {server_url} to {scheme}://"))?;
        Ok(Self { base })
    }

    pub fn channel_url(&self, session_id: &SessionId) -> String {
        let base = self.base.as_str().trim_end_matches('/');
        format!("{base}/ws/conference/{session_id}")
    }
}

impl Connector for WsConnector {
    fn open(&self, session_id: &SessionId, events: ChannelEvents) -> ChannelLink {
        let url = self.channel_url(session_id);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_ws_channel(url, events, outbound_rx));
        ChannelLink::new(outbound_tx, Some(task.abort_handle()))
    }
}

async fn run_ws_channel(
    url: String,
    events: ChannelEvents,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let generation = events.generation();
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            events.failed(format!("failed to connect websocket {url}: {err}"));
            return;
        }
    };
    info!(generation, %url, "ws: channel open");
    events.opened();

    let (mut writer, mut reader) = ws_stream.split();
    loop {
        tokio::select! {
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => events.text(text),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    debug!(generation, ?code, "ws: close frame received");
                    // Sends the close reply tungstenite queued on receipt.
                    let _ = writer.close().await;
                    events.closed(code, reason);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(generation, error = %err, "ws: receive failed");
                    events.failed(format!("websocket receive failed: {err}"));
                    return;
                }
                None => {
                    events.closed(None, "stream ended");
                    return;
                }
            },
            outgoing = outbound.recv() => match outgoing {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = writer.send(Message::Text(text)).await {
                        warn!(generation, error = %err, "ws: send failed");
                        events.failed(format!("websocket send failed: {err}"));
                        return;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = writer
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client closing".into(),
                        })))
                        .await;
                    let _ = writer.close().await;
                    debug!(generation, "ws: closed locally");
                    return;
                }
            }
        }
    }
}
