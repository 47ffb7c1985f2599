use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use shared::{
    domain::{Message, MessageId, Participant, ParticipantId, SessionId},
    error::ApiException,
    protocol::{MessagePage, ScenarioCatalog, SessionConfig, SessionRecord},
};
use tokio::sync::mpsc;

use crate::{
    rest::RestClient,
    transport::{ChannelEvents, ChannelLink, Connector, Outbound},
};

/// One channel handed out by [`MockConnector`]. The test plays the backend.
pub(crate) struct OpenedChannel {
    pub session_id: SessionId,
    pub events: ChannelEvents,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl OpenedChannel {
    pub fn open(&self) {
        self.events.opened();
    }

    pub fn push(&self, frame: Value) {
        self.events.text(frame.to_string());
    }

    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            out.push(item);
        }
        out
    }
}

#[derive(Default)]
pub(crate) struct MockConnector {
    opened: Mutex<Vec<OpenedChannel>>,
    open_count: Mutex<usize>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open_count(&self) -> usize {
        *self.open_count.lock().expect("open_count lock")
    }

    pub fn take_latest(&self) -> OpenedChannel {
        self.opened
            .lock()
            .expect("opened lock")
            .pop()
            .expect("a channel should have been opened")
    }
}

impl Connector for MockConnector {
    fn open(&self, session_id: &SessionId, events: ChannelEvents) -> ChannelLink {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.open_count.lock().expect("open_count lock") += 1;
        self.opened.lock().expect("opened lock").push(OpenedChannel {
            session_id: session_id.clone(),
            events,
            outbound: rx,
        });
        ChannelLink::new(tx, None)
    }
}

/// Hands out queued session ids (or failures) in order.
#[derive(Default)]
pub(crate) struct MockRest {
    results: Mutex<VecDeque<Result<SessionId, String>>>,
    created: Mutex<Vec<SessionConfig>>,
}

impl MockRest {
    pub fn with_ids(ids: &[&str]) -> Arc<Self> {
        let rest = Self::default();
        {
            let mut results = rest.results.lock().expect("results lock");
            for id in ids {
                results.push_back(Ok(SessionId::new(*id)));
            }
        }
        Arc::new(rest)
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        let rest = Self::default();
        rest.results
            .lock()
            .expect("results lock")
            .push_back(Err(reason.to_string()));
        Arc::new(rest)
    }

    pub fn created(&self) -> Vec<SessionConfig> {
        self.created.lock().expect("created lock").clone()
    }
}

#[async_trait]
impl RestClient for MockRest {
    async fn create_session(&self, config: &SessionConfig) -> Result<SessionId> {
        self.created
            .lock()
            .expect("created lock")
            .push(config.clone());
        match self.results.lock().expect("results lock").pop_front() {
            Some(Ok(id)) => Ok(id),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Err(anyhow!("backend unavailable")),
        }
    }

    async fn fetch_session(&self, _session_id: &SessionId) -> Result<SessionRecord> {
        Err(ApiException::new(404, "會議不存在").into())
    }

    async fn fetch_messages(
        &self,
        _session_id: &SessionId,
        _limit: u32,
        _offset: u32,
    ) -> Result<MessagePage> {
        Err(anyhow!("not served by the mock"))
    }

    async fn fetch_scenarios(&self) -> Result<ScenarioCatalog> {
        Err(anyhow!("not served by the mock"))
    }
}

pub(crate) fn pricing_config() -> SessionConfig {
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

pub(crate) fn message(id: &str, speaker: &str, text: &str) -> Message {
    Message {
        id: MessageId::new(id),
        speaker_id: ParticipantId::new(speaker),
        speaker_name: speaker.to_uppercase(),
        speaker_title: format!("{speaker} title"),
        text: text.to_string(),
        timestamp: "2025-03-01T10:15:42.000123".to_string(),
    }
}

pub(crate) fn init_frame(stage: &str, current_round: u32, messages: &[Message]) -> Value {
    json!({
        "type": "init",
        "messages": messages,
        "stage": stage,
        "current_round": current_round,
        "conclusion": null,
    })
}

pub(crate) fn message_frame(message: &Message) -> Value {
    json!({
        "type": "new_message",
        "message": message,
        "current_speaker": message.speaker_id,
    })
}

pub(crate) fn stage_frame(stage: &str) -> Value {
    json!({ "type": "stage_change", "stage": stage })
}

pub(crate) fn round_frame(round: u32) -> Value {
    json!({ "type": "round_update", "round": round })
}
