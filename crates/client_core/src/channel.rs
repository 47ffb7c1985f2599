use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use shared::{
    domain::SessionId,
    protocol::{decode_inbound, CommandFrame, InboundFrame},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    clock::{Scheduler, TimerHandle},
    error::EngineError,
    transport::{
        ChannelEvents, ChannelLink, ChannelSignal, Connector, EngineEvent, CLOSE_ABNORMAL,
        CLOSE_NORMAL, CLOSE_SERVER_FAULT,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    /// Lost the channel; a recovery attempt is pending.
    Erroring,
    /// Terminal error; nothing will be retried.
    Faulted,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Open => "open",
            ConnectionStatus::Closing => "closing",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Erroring => "erroring",
            ConnectionStatus::Faulted => "faulted",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delay: Duration,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Reconnect,
    /// The backend forgot the session; create a fresh one from the held config.
    Recreate,
}

#[derive(Debug)]
struct PendingRetry {
    generation: u64,
    action: RetryAction,
    timer: TimerHandle,
}

#[derive(Debug)]
struct LiveChannel {
    generation: u64,
    link: ChannelLink,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelReaction {
    /// Signal belonged to a superseded channel.
    Ignored,
    Opened,
    Frame(InboundFrame),
    TransportFailed {
        error: EngineError,
        retry: Option<RetryAction>,
    },
    Closed {
        code: u16,
        outcome: CloseOutcome,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Clean,
    /// Server fault; surfaced and never retried.
    Fatal(EngineError),
    Retrying(RetryAction),
    /// Recovery wanted but not possible (no session id, attempts exhausted).
    GaveUp(String),
}

pub struct ChannelManager {
    connector: Arc<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
    policy: ReconnectPolicy,
    inbox: mpsc::UnboundedSender<EngineEvent>,
    session_id: Option<SessionId>,
    live: Option<LiveChannel>,
    generation: u64,
    status: ConnectionStatus,
    retry: Option<PendingRetry>,
    attempts: u32,
    session_missing: bool,
}

impl ChannelManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        scheduler: Arc<dyn Scheduler>,
        policy: ReconnectPolicy,
        inbox: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            connector,
            scheduler,
            policy,
            inbox,
            session_id: None,
            live: None,
            generation: 0,
            status: ConnectionStatus::Idle,
            retry: None,
            attempts: 0,
            session_missing: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_live_channel(&self) -> bool {
        self.live.is_some()
    }

    pub fn retry_pending(&self) -> Option<RetryAction> {
        self.retry.as_ref().map(|retry| retry.action)
    }

    pub fn connect(&mut self, session_id: SessionId) {
        self.cancel_retry();
        self.teardown_live();

        self.generation += 1;
        let events = ChannelEvents::new(self.generation, self.inbox.clone());
        info!(
            session_id = %session_id,
            generation = self.generation,
            "channel: connecting"
        );
        let link = self.connector.open(&session_id, events);
        self.live = Some(LiveChannel {
            generation: self.generation,
            link,
        });
        self.session_id = Some(session_id);
        self.status = ConnectionStatus::Connecting;
    }

    /// The backend said it no longer knows this session.
    pub fn mark_session_missing(&mut self) {
        self.session_missing = true;
    }

    /// A full snapshot arrived: the backend knows this session and the channel is healthy.
    pub fn mark_synchronized(&mut self) {
        self.attempts = 0;
        self.session_missing = false;
    }

    pub fn handle_signal(&mut self, generation: u64, signal: ChannelSignal) -> ChannelReaction {
        let current = self.live.as_ref().map(|live| live.generation);
        if current != Some(generation) {
            debug!(generation, ?current, "channel: dropping stale signal");
            return ChannelReaction::Ignored;
        }

        match signal {
            ChannelSignal::Opened => {
                self.status = ConnectionStatus::Open;
                ChannelReaction::Opened
            }
            ChannelSignal::Text(raw) => ChannelReaction::Frame(match decode_inbound(&raw) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(generation, error = %err, "channel: undecodable frame");
                    InboundFrame::Malformed {
                        reason: err.to_string(),
                    }
                }
            }),
            ChannelSignal::Failed(reason) => {
                warn!(generation, %reason, "channel: transport failure");
                self.live = None;
                let action = self.recovery_action();
                let retry = self.schedule_retry(action).then_some(action);
                self.status = if retry.is_some() {
                    ConnectionStatus::Erroring
                } else {
                    ConnectionStatus::Faulted
                };
                ChannelReaction::TransportFailed {
                    error: EngineError::Transport(reason),
                    retry,
                }
            }
            ChannelSignal::Closed { code, reason } => {
                self.live = None;
                let code = code.unwrap_or(CLOSE_ABNORMAL);
                let outcome = self.on_closed(code, reason);
                ChannelReaction::Closed { code, outcome }
            }
        }
    }

    fn on_closed(&mut self, code: u16, reason: String) -> CloseOutcome {
        if code == CLOSE_SERVER_FAULT {
            warn!(code, %reason, "channel: server fault, not retrying");
            self.cancel_retry();
            self.status = ConnectionStatus::Faulted;
            return CloseOutcome::Fatal(EngineError::ServerFault { code, reason });
        }

        if code == CLOSE_NORMAL && !self.session_missing {
            info!(code, "channel: closed cleanly");
            self.status = ConnectionStatus::Closed;
            return CloseOutcome::Clean;
        }

        let action = self.recovery_action();
        if self.schedule_retry(action) {
            info!(code, ?action, "channel: closed, recovery scheduled");
            self.status = ConnectionStatus::Erroring;
            return CloseOutcome::Retrying(action);
        }

        self.status = ConnectionStatus::Faulted;
        let reason = if self.session_id.is_none() {
            format!("channel closed with code {code} and no session to recover")
        } else {
            format!(
                "channel closed with code {code}; gave up after {} attempt(s)",
                self.attempts
            )
        };
        warn!(%reason, "channel: not recovering");
        CloseOutcome::GaveUp(reason)
    }

    fn recovery_action(&self) -> RetryAction {
        if self.session_missing {
            RetryAction::Recreate
        } else {
            RetryAction::Reconnect
        }
    }

    /// Arms the retry timer. Returns whether a retry is (now or already) pending.
    fn schedule_retry(&mut self, action: RetryAction) -> bool {
        if let Some(pending) = &self.retry {
            return pending.generation == self.generation;
        }
        if self.session_id.is_none() || !self.policy.allows(self.attempts) {
            return false;
        }

        let generation = self.generation;
        let inbox = self.inbox.clone();
        let timer = self.scheduler.schedule(
            self.policy.delay(),
            Box::new(move || {
                let _ = inbox.send(EngineEvent::RetryDue { generation });
            }),
        );
        debug!(
            generation,
            ?action,
            delay_ms = self.policy.delay().as_millis() as u64,
            "channel: retry scheduled"
        );
        self.retry = Some(PendingRetry {
            generation,
            action,
            timer,
        });
        true
    }

    /// Claims a fired retry timer. `None` when the timer was superseded.
    pub fn take_due_retry(&mut self, generation: u64) -> Option<(RetryAction, SessionId)> {
        match &self.retry {
            Some(pending) if pending.generation == generation => {}
            _ => {
                debug!(generation, "channel: ignoring stale retry timer");
                return None;
            }
        }
        let pending = self.retry.take()?;
        let session_id = self.session_id.clone()?;
        self.attempts += 1;
        Some((pending.action, session_id))
    }

    /// Forgets the current session id ahead of recreating the session.
    pub fn begin_recreation(&mut self) {
        self.cancel_retry();
        self.teardown_live();
        self.generation += 1;
        self.session_id = None;
        self.session_missing = false;
        self.status = ConnectionStatus::Connecting;
    }

    pub fn fail(&mut self) {
        self.cancel_retry();
        self.teardown_live();
        self.generation += 1;
        self.status = ConnectionStatus::Faulted;
    }

    pub fn send(&self, frame: CommandFrame) -> Result<(), EngineError> {
        let rejected = || EngineError::CommandRejected {
            command: frame.tag(),
            status: self.status,
        };
        let live = match (&self.live, self.status) {
            (Some(live), ConnectionStatus::Open) => live,
            _ => return Err(rejected()),
        };
        let payload = serde_json::to_string(&frame).map_err(|_| rejected())?;
        if !live.link.send_text(payload) {
            return Err(rejected());
        }
        debug!(command = frame.tag(), generation = live.generation, "channel: sent");
        Ok(())
    }

    /// Clean local teardown. Safe to call more than once.
    pub fn close(&mut self) {
        self.cancel_retry();
        let had_channel = self.live.is_some();
        if had_channel {
            self.status = ConnectionStatus::Closing;
            self.teardown_live();
            info!(generation = self.generation, "channel: closed by client");
        }
        self.generation += 1;
        self.session_id = None;
        if self.status != ConnectionStatus::Faulted {
            self.status = ConnectionStatus::Closed;
        }
    }

    pub fn reset(&mut self) {
        self.close();
        self.attempts = 0;
        self.session_missing = false;
        self.status = ConnectionStatus::Idle;
    }

    fn teardown_live(&mut self) {
        if let Some(live) = self.live.take() {
            debug!(generation = live.generation, "channel: tearing down");
            live.link.close();
        }
    }

    fn cancel_retry(&mut self) {
        if let Some(pending) = self.retry.take() {
            pending.timer.cancel();
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.cancel_retry();
        self.teardown_live();
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
