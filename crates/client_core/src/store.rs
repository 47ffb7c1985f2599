use serde::Serialize;
use shared::{
    domain::{Message, Participant, ParticipantId, SessionId, Stage},
    protocol::{InboundFrame, SessionConfig},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    channel::ConnectionStatus,
    error::{indicates_session_missing, ProtocolAnomaly},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub last_close_code: Option<u16>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: Option<SessionId>,
    pub config: SessionConfig,
    pub stage: Stage,
    pub current_round: u32,
    pub messages: Vec<Message>,
    pub conclusion: Option<String>,
    pub current_speaker: Option<ParticipantId>,
    pub connection: ConnectionState,
    /// Set once an `init` frame has been applied for the current session.
    pub populated: bool,
    pub anomalies: Vec<String>,
}

impl Session {
    fn empty(config: SessionConfig) -> Self {
        Self {
            id: None,
            config,
            stage: Stage::Loading,
            current_round: 0,
            messages: Vec::new(),
            conclusion: None,
            current_speaker: None,
            connection: ConnectionState::default(),
            populated: false,
            anomalies: Vec::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn rounds(&self) -> u32 {
        self.config.rounds
    }

    pub fn participants(&self) -> &[Participant] {
        &self.config.participants
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.config.participants.iter().find(|p| &p.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    SessionAssigned(SessionId),
    Resynced {
        stage: Stage,
        current_round: u32,
        message_count: usize,
    },
    MessageAppended(Message),
    StageChanged {
        from: Stage,
        to: Stage,
    },
    RoundChanged(u32),
    RoundCompleted(Option<u32>),
    ConclusionSet(String),
    ConnectionChanged(ConnectionState),
    Error(String),
    Anomaly(ProtocolAnomaly),
}

/// What the engine must act on after a frame was applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub resynced: bool,
    pub session_missing: bool,
    pub anomalies: Vec<ProtocolAnomaly>,
}

pub struct SessionStore {
    session: Session,
    /// Stage to return to when a pause ends.
    resume_stage: Option<Stage>,
    events: broadcast::Sender<SessionUpdate>,
}

impl SessionStore {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            session: Session::empty(SessionConfig::new(String::new(), 0, Vec::new())),
            resume_stage: None,
            events,
        }
    }

    /// Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn snapshot(&self) -> Session {
        self.session.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.session.config
    }

    /// Starts a fresh, empty session (stage `loading`) for `config`.
    pub fn begin(&mut self, config: SessionConfig) {
        let connection = self.session.connection.clone();
        self.session = Session::empty(config);
        self.session.connection = connection;
        self.resume_stage = None;
        debug!(topic = %self.session.config.topic, "store: session started");
    }

    pub fn assign_id(&mut self, id: SessionId) {
        if let Some(existing) = &self.session.id {
            warn!(%existing, new = %id, "store: session already has an id; keeping it");
            return;
        }
        info!(session_id = %id, "store: session id assigned");
        self.session.id = Some(id.clone());
        self.publish(SessionUpdate::SessionAssigned(id));
    }

    pub fn set_connection_status(&mut self, status: ConnectionStatus, close_code: Option<u16>) {
        let mut next = self.session.connection.clone();
        next.status = status;
        if close_code.is_some() {
            next.last_close_code = close_code;
        }
        self.update_connection(next);
    }

    pub fn clear_error(&mut self) {
        let mut next = self.session.connection.clone();
        next.last_error = None;
        self.update_connection(next);
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        let mut next = self.session.connection.clone();
        next.last_error = Some(message.clone());
        self.update_connection(next);
        self.publish(SessionUpdate::Error(message));
    }

    fn update_connection(&mut self, next: ConnectionState) {
        if next != self.session.connection {
            self.session.connection = next.clone();
            self.publish(SessionUpdate::ConnectionChanged(next));
        }
    }

    pub fn apply(&mut self, frame: &InboundFrame) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();

        if !self.session.populated
            && !matches!(
                frame,
                InboundFrame::Init { .. } | InboundFrame::Error { .. } | InboundFrame::Malformed { .. }
            )
        {
            self.flag(
                &mut outcome,
                ProtocolAnomaly::FrameBeforeInit { tag: frame.tag() },
            );
        }

        match frame {
            InboundFrame::Init {
                messages,
                stage,
                current_round,
                conclusion,
            } => {
                self.session.messages = messages.clone();
                self.session.stage = *stage;
                self.session.current_round = *current_round;
                self.session.conclusion = conclusion.clone();
                self.session.populated = true;
                self.resume_stage = None;
                outcome.resynced = true;
                info!(
                    stage = %stage,
                    current_round,
                    messages = messages.len(),
                    "store: resynchronised from init"
                );
                self.publish(SessionUpdate::Resynced {
                    stage: *stage,
                    current_round: *current_round,
                    message_count: messages.len(),
                });
            }
            InboundFrame::NewMessage {
                message,
                current_speaker,
            } => {
                self.session.messages.push(message.clone());
                self.session.current_speaker = current_speaker
                    .clone()
                    .or_else(|| Some(message.speaker_id.clone()));
                debug!(speaker = %message.speaker_id, "store: message appended");
                self.publish(SessionUpdate::MessageAppended(message.clone()));
            }
            InboundFrame::StageChange { stage } => self.apply_stage(*stage, &mut outcome),
            InboundFrame::RoundUpdate { round } => self.apply_round(*round, &mut outcome),
            InboundFrame::RoundCompleted { round } => {
                info!(?round, "store: round completed");
                self.publish(SessionUpdate::RoundCompleted(*round));
            }
            InboundFrame::Conclusion { text } => {
                if self.session.conclusion.is_some() {
                    self.flag(&mut outcome, ProtocolAnomaly::RepeatedConclusion);
                }
                if !matches!(self.session.stage, Stage::Conclusion | Stage::Ended) {
                    self.flag(
                        &mut outcome,
                        ProtocolAnomaly::ConclusionOutsideStage {
                            stage: self.session.stage,
                        },
                    );
                }
                self.session.conclusion = Some(text.clone());
                self.publish(SessionUpdate::ConclusionSet(text.clone()));
            }
            InboundFrame::Error { message } => {
                outcome.session_missing = indicates_session_missing(message);
                warn!(
                    %message,
                    session_missing = outcome.session_missing,
                    "store: backend reported an error"
                );
                self.record_error(message.clone());
            }
            InboundFrame::Malformed { reason } => {
                self.flag(
                    &mut outcome,
                    ProtocolAnomaly::Malformed {
                        reason: reason.clone(),
                    },
                );
                self.record_error(format!("protocol anomaly: {reason}"));
            }
        }

        outcome
    }

    fn apply_stage(&mut self, next: Stage, outcome: &mut ApplyOutcome) {
        let from = self.session.stage;
        if !from.can_transition_to(next) {
            self.flag(outcome, ProtocolAnomaly::UnexpectedStage { from, to: next });
        }

        if from == Stage::Paused && next != Stage::Paused {
            if let Some(expected) = self.resume_stage.take() {
                if next != expected && next != Stage::Ended {
                    self.flag(
                        outcome,
                        ProtocolAnomaly::UnexpectedResume {
                            expected,
                            actual: next,
                        },
                    );
                }
            }
        }
        if next == Stage::Paused && from != Stage::Paused {
            self.resume_stage = Some(from);
        }

        if from != next {
            self.session.stage = next;
            info!(from = %from, to = %next, "store: stage changed");
            self.publish(SessionUpdate::StageChanged { from, to: next });
        }
    }

    fn apply_round(&mut self, round: u32, outcome: &mut ApplyOutcome) {
        let from = self.session.current_round;
        if round < from {
            self.flag(outcome, ProtocolAnomaly::RoundRegressed { from, to: round });
        }
        let target = self.session.config.rounds;
        if target > 0 && round > target {
            self.flag(outcome, ProtocolAnomaly::RoundBeyondTarget { round, target });
        }

        if round != from {
            self.session.current_round = round;
            self.publish(SessionUpdate::RoundChanged(round));
        }
    }

    fn flag(&mut self, outcome: &mut ApplyOutcome, anomaly: ProtocolAnomaly) {
        warn!(anomaly = %anomaly, "store: protocol anomaly");
        self.session.anomalies.push(anomaly.to_string());
        outcome.anomalies.push(anomaly.clone());
        self.publish(SessionUpdate::Anomaly(anomaly));
    }

    fn publish(&self, update: SessionUpdate) {
        // No subscribers is fine.
        let _ = self.events.send(update);
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
