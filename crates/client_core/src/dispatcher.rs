use shared::protocol::CommandFrame;
use tracing::{debug, warn};

use crate::{channel::ChannelManager, error::EngineError};

/// User intent the backend can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    NextRound,
    EndConference,
    PauseConference,
    ResumeConference,
}

impl Command {
    pub fn name(self) -> &'static str {
        CommandFrame::from(self).tag()
    }
}

impl From<Command> for CommandFrame {
    fn from(command: Command) -> Self {
        match command {
            Command::NextRound => CommandFrame::NextRound,
            Command::EndConference => CommandFrame::EndConference,
            Command::PauseConference => CommandFrame::PauseConference,
            Command::ResumeConference => CommandFrame::ResumeConference,
        }
    }
}

/// Sends commands through the current channel. Nothing is queued or retried:
/// a command that cannot go out right now is rejected to the caller.
pub struct CommandDispatcher<'a> {
    channels: &'a ChannelManager,
}

impl<'a> CommandDispatcher<'a> {
    pub fn new(channels: &'a ChannelManager) -> Self {
        Self { channels }
    }

    pub fn dispatch(&self, command: Command) -> Result<(), EngineError> {
        let frame = CommandFrame::from(command);
        match self.channels.send(frame) {
            Ok(()) => {
                debug!(command = frame.tag(), "dispatch: command sent");
                Ok(())
            }
            Err(err) => {
                warn!(command = frame.tag(), error = %err, "dispatch: command rejected");
                Err(err)
            }
        }
    }
}
