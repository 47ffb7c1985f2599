use std::sync::Arc;

use anyhow::Result;
use shared::{
    domain::SessionId,
    error::ApiException,
    protocol::{MessagePage, SessionConfig, SessionRecord},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

pub mod channel;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod rest;
pub mod store;
pub mod transcript;
pub mod transport;

pub use channel::{ChannelManager, ConnectionStatus, ReconnectPolicy, RetryAction};
pub use clock::{ManualClock, Scheduler, TimerHandle, TokioClock};
pub use config::{load_settings, EngineSettings};
pub use dispatcher::{Command, CommandDispatcher};
pub use error::{EngineError, ProtocolAnomaly};
pub use rest::{HttpRestClient, RestClient};
pub use store::{ConnectionState, Session, SessionStore, SessionUpdate};
pub use transport::{ChannelEvents, ChannelLink, ChannelSignal, Connector, EngineEvent, WsConnector};

use channel::{ChannelReaction, CloseOutcome};

pub struct ConferenceEngine {
    rest: Arc<dyn RestClient>,
    store: SessionStore,
    channels: ChannelManager,
    inbox: mpsc::UnboundedReceiver<EngineEvent>,
}

impl ConferenceEngine {
    pub fn new(
        rest: Arc<dyn RestClient>,
        connector: Arc<dyn Connector>,
        scheduler: Arc<dyn Scheduler>,
        policy: ReconnectPolicy,
        event_buffer: usize,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        Self {
            rest,
            store: SessionStore::new(event_buffer),
            channels: ChannelManager::new(connector, scheduler, policy, inbox_tx),
            inbox,
        }
    }

    /// Production wiring: reqwest, websocket and tokio timers.
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        let connector = WsConnector::new(&settings.server_url)?;
        Ok(Self::new(
            Arc::new(HttpRestClient::new(settings.server_url.clone())),
            Arc::new(connector),
            Arc::new(TokioClock),
            settings.reconnect_policy(),
            settings.event_buffer,
        ))
    }

    pub fn rest(&self) -> Arc<dyn RestClient> {
        Arc::clone(&self.rest)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.store.subscribe()
    }

    pub fn session(&self) -> &Session {
        self.store.session()
    }

    pub fn snapshot(&self) -> Session {
        self.store.snapshot()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.channels.status()
    }

    /// Creates a session on the backend and opens its channel.
    pub async fn start_session(&mut self, config: SessionConfig) -> Result<SessionId, EngineError> {
        self.channels.reset();
        self.store.begin(config);
        self.sync_connection(None);
        self.create_and_connect().await
    }

    async fn create_and_connect(&mut self) -> Result<SessionId, EngineError> {
        let config = self.store.config().clone();
        match self.rest.create_session(&config).await {
            Ok(session_id) => {
                self.store.assign_id(session_id.clone());
                self.channels.connect(session_id.clone());
                self.sync_connection(None);
                Ok(session_id)
            }
            Err(err) => {
                let error = EngineError::CreationFailure(format!("{err:#}"));
                warn!(error = %error, "engine: session creation failed");
                self.store.record_error(error.to_string());
                Err(error)
            }
        }
    }

    pub async fn fetch_remote_session(&self) -> Result<SessionRecord, EngineError> {
        let session_id = self.current_id()?;
        self.rest
            .fetch_session(&session_id)
            .await
            .map_err(|err| lookup_error(&session_id, err))
    }

    /// One page of the backend's message history for the current session.
    pub async fn fetch_history(&self, limit: u32, offset: u32) -> Result<MessagePage, EngineError> {
        let session_id = self.current_id()?;
        self.rest
            .fetch_messages(&session_id, limit, offset)
            .await
            .map_err(|err| lookup_error(&session_id, err))
    }

    fn current_id(&self) -> Result<SessionId, EngineError> {
        self.store.session().id.clone().ok_or(EngineError::NoSession)
    }

    pub fn dispatch(&self, command: Command) -> Result<(), EngineError> {
        CommandDispatcher::new(&self.channels).dispatch(command)
    }

    pub fn export_transcript(&self) -> String {
        transcript::export(self.store.session())
    }

    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.inbox.recv().await
    }

    /// Handles everything already queued without waiting. Returns the count.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.inbox.try_recv() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Drives the engine until `done` holds for the session.
    pub async fn run_until(&mut self, mut done: impl FnMut(&Session) -> bool) {
        while !done(self.store.session()) {
            let Some(event) = self.next_event().await else {
                return;
            };
            self.handle_event(event).await;
        }
    }

    /// No live channel and nothing scheduled: the engine will not move on its own.
    pub fn is_settled(&self) -> bool {
        !self.channels.has_live_channel()
            && self.channels.retry_pending().is_none()
            && matches!(
                self.channels.status(),
                ConnectionStatus::Closed | ConnectionStatus::Faulted | ConnectionStatus::Idle
            )
    }

    pub async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Channel { generation, signal } => {
                self.on_channel_signal(generation, signal)
            }
            EngineEvent::RetryDue { generation } => self.on_retry_due(generation).await,
        }
    }

    fn on_channel_signal(&mut self, generation: u64, signal: ChannelSignal) {
        match self.channels.handle_signal(generation, signal) {
            ChannelReaction::Ignored => {}
            ChannelReaction::Opened => {
                self.store.clear_error();
                self.sync_connection(None);
            }
            ChannelReaction::Frame(frame) => {
                let outcome = self.store.apply(&frame);
                if outcome.resynced {
                    self.channels.mark_synchronized();
                }
                if outcome.session_missing {
                    self.channels.mark_session_missing();
                }
            }
            ChannelReaction::TransportFailed { error, retry } => {
                self.sync_connection(None);
                match retry {
                    Some(action) => self
                        .store
                        .record_error(format!("{error}; {}", recovery_notice(action))),
                    None => self.store.record_error(error.to_string()),
                }
            }
            ChannelReaction::Closed { code, outcome } => {
                self.sync_connection(Some(code));
                match outcome {
                    CloseOutcome::Clean => {}
                    CloseOutcome::Fatal(error) => self.store.record_error(error.to_string()),
                    CloseOutcome::Retrying(action) => self.store.record_error(format!(
                        "connection closed (code {code}); {}",
                        recovery_notice(action)
                    )),
                    CloseOutcome::GaveUp(reason) => self.store.record_error(reason),
                }
            }
        }
    }

    async fn on_retry_due(&mut self, generation: u64) {
        let Some((action, session_id)) = self.channels.take_due_retry(generation) else {
            return;
        };

        match action {
            RetryAction::Reconnect => {
                info!(session_id = %session_id, "engine: reconnecting");
                self.channels.connect(session_id);
                self.sync_connection(None);
            }
            RetryAction::Recreate => {
                info!(stale_session_id = %session_id, "engine: recreating session");
                self.channels.begin_recreation();
                let config = self.store.config().clone();
                self.store.begin(config);
                self.sync_connection(None);
                if self.create_and_connect().await.is_err() {
                    self.channels.fail();
                    self.sync_connection(None);
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.channels.close();
        self.sync_connection(None);
    }

    fn sync_connection(&mut self, close_code: Option<u16>) {
        self.store
            .set_connection_status(self.channels.status(), close_code);
    }
}

fn lookup_error(session_id: &SessionId, err: anyhow::Error) -> EngineError {
    match err.downcast_ref::<ApiException>() {
        Some(api) if api.status == 404 || error::indicates_session_missing(&api.message) => {
            EngineError::SessionNotFound(session_id.to_string())
        }
        _ => EngineError::Transport(format!("{err:#}")),
    }
}

fn recovery_notice(action: RetryAction) -> &'static str {
    match action {
        RetryAction::Reconnect => "reconnecting",
        RetryAction::Recreate => "session not found, recreating",
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
