use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Message, Participant, ParticipantId, SessionId, Stage};

/// Frames pushed by the backend over the conference channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Init {
        #[serde(default)]
        messages: Vec<Message>,
        #[serde(default = "default_init_stage")]
        stage: Stage,
        #[serde(default)]
        current_round: u32,
        #[serde(default)]
        conclusion: Option<String>,
    },
    NewMessage {
        message: Message,
        #[serde(default)]
        current_speaker: Option<ParticipantId>,
    },
    StageChange {
        stage: Stage,
    },
    RoundUpdate {
        round: u32,
    },
    RoundCompleted {
        #[serde(default)]
        round: Option<u32>,
    },
    Conclusion {
        text: String,
    },
    Error {
        message: String,
    },
    /// Produced locally when a payload could not be decoded; never on the wire.
    #[serde(skip)]
    Malformed { reason: String },
}

fn default_init_stage() -> Stage {
    Stage::Waiting
}

impl InboundFrame {
    pub fn tag(&self) -> &'static str {
        match self {
            InboundFrame::Init { .. } => "init",
            InboundFrame::NewMessage { .. } => "new_message",
            InboundFrame::StageChange { .. } => "stage_change",
            InboundFrame::RoundUpdate { .. } => "round_update",
            InboundFrame::RoundCompleted { .. } => "round_completed",
            InboundFrame::Conclusion { .. } => "conclusion",
            InboundFrame::Error { .. } => "error",
            InboundFrame::Malformed { .. } => "malformed",
        }
    }
}

const INBOUND_TAGS: &[&str] = &[
    "init",
    "new_message",
    "stage_change",
    "round_update",
    "round_completed",
    "conclusion",
    "error",
];

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame has no string `type` tag")]
    MissingTag,
    #[error("unknown frame type `{0}`")]
    UnknownTag(String),
    #[error("invalid `{tag}` frame: {source}")]
    InvalidPayload {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decodes one text payload, distinguishing unknown tags from bad payloads.
pub fn decode_inbound(raw: &str) -> Result<InboundFrame, FrameDecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(FrameDecodeError::InvalidJson)?;
    let tag = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(FrameDecodeError::MissingTag)?
        .to_string();
    if !INBOUND_TAGS.contains(&tag.as_str()) {
        return Err(FrameDecodeError::UnknownTag(tag));
    }
    serde_json::from_value(value).map_err(|source| FrameDecodeError::InvalidPayload { tag, source })
}

/// Control frames sent by the client. They carry no payload beyond the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandFrame {
    NextRound,
    EndConference,
    PauseConference,
    ResumeConference,
}

impl CommandFrame {
    pub fn tag(self) -> &'static str {
        match self {
            CommandFrame::NextRound => "next_round",
            CommandFrame::EndConference => "end_conference",
            CommandFrame::PauseConference => "pause_conference",
            CommandFrame::ResumeConference => "resume_conference",
        }
    }
}

/// Everything the backend needs to start a conference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub topic: String,
    pub rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    pub participants: Vec<Participant>,
}

impl SessionConfig {
    pub fn new(topic: impl Into<String>, rounds: u32, participants: Vec<Participant>) -> Self {
        Self {
            topic: topic.into(),
            rounds,
            scenario: None,
            participants,
        }
    }

    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    /// Puts the moderator seat first unless the caller already supplied one.
    pub fn with_moderator(mut self) -> Self {
        if !self.participants.iter().any(Participant::is_moderator) {
            self.participants.insert(0, Participant::moderator());
        }
        self
    }

    pub fn active_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.is_active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub conference_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Server-side view of a session as returned by the snapshot endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub config: SessionConfig,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub stage: Stage,
    #[serde(default)]
    pub current_round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub total: u64,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioCatalog {
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_guide: Option<String>,
}

impl ScenarioCatalog {
    pub fn display_name(&self, scenario_id: &str) -> Option<&str> {
        self.scenarios.get(scenario_id).map(|s| s.name.as_str())
    }
}
