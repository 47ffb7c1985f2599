use shared::domain::Stage;
use thiserror::Error;

use crate::channel::ConnectionStatus;

/// Failures the engine surfaces to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("failed to create session: {0}")]
    CreationFailure(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("server fault (close code {code}): {reason}")]
    ServerFault { code: u16, reason: String },
    #[error("command `{command}` rejected: channel is {status}")]
    CommandRejected {
        command: &'static str,
        status: ConnectionStatus,
    },
    #[error("no session is active")]
    NoSession,
}

/// Something in the inbound stream did not match the protocol. Recorded on the
/// session and logged; never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolAnomaly {
    #[error("malformed frame: {reason}")]
    Malformed { reason: String },
    #[error("`{tag}` frame arrived before init")]
    FrameBeforeInit { tag: &'static str },
    #[error("unexpected stage transition {from} -> {to}")]
    UnexpectedStage { from: Stage, to: Stage },
    #[error("resumed into {actual}, but the session was paused during {expected}")]
    UnexpectedResume { expected: Stage, actual: Stage },
    #[error("round went backwards from {from} to {to}")]
    RoundRegressed { from: u32, to: u32 },
    #[error("round {round} exceeds the target of {target}")]
    RoundBeyondTarget { round: u32, target: u32 },
    #[error("conclusion delivered again; previous text overwritten")]
    RepeatedConclusion,
    #[error("conclusion delivered during {stage}")]
    ConclusionOutsideStage { stage: Stage },
}

const SESSION_MISSING_MARKERS: &[&str] = &[
    "session not found",
    "unknown session",
    "會議不存在",
    "找不到指定的會議",
];

/// Whether a backend error message says the session id is unknown to it.
pub fn indicates_session_missing(message: &str) -> bool {
    let lower = message.to_lowercase();
    SESSION_MISSING_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}
