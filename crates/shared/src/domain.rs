use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(SessionId);
id_newtype!(ParticipantId);
id_newtype!(MessageId);

/// Coarse phase of a conference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Loading,
    Waiting,
    Introduction,
    Discussion,
    Paused,
    Conclusion,
    Ended,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Loading => "loading",
            Stage::Waiting => "waiting",
            Stage::Introduction => "introduction",
            Stage::Discussion => "discussion",
            Stage::Paused => "paused",
            Stage::Conclusion => "conclusion",
            Stage::Ended => "ended",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Ended
    }

    /// Stages a pause command may interrupt.
    pub fn is_pausable(self) -> bool {
        matches!(
            self,
            Stage::Loading | Stage::Introduction | Stage::Discussion | Stage::Conclusion
        )
    }

    /// Whether `next` is reachable from `self` in one step.
    ///
    /// Leaving `Paused` is accepted for any pausable stage here; checking that
    /// the session resumes into the stage it was paused from needs history and
    /// is left to the caller.
    pub fn can_transition_to(self, next: Stage) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next == Stage::Ended {
            return true;
        }
        if next == Stage::Paused {
            return self.is_pausable();
        }

        match self {
            Stage::Loading => matches!(next, Stage::Waiting | Stage::Introduction),
            Stage::Waiting => next == Stage::Introduction,
            Stage::Introduction => next == Stage::Discussion,
            Stage::Discussion => next == Stage::Conclusion,
            Stage::Paused => next.is_pausable(),
            Stage::Conclusion | Stage::Ended => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub personality: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expertise: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

pub const MODERATOR_ID: &str = "moderator";

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: ParticipantId::new(id),
            name: name.into(),
            title: title.into(),
            personality: String::new(),
            expertise: String::new(),
            is_active: true,
        }
    }

    /// Facilitator seat the backend expects at the head of the participant list.
    pub fn moderator() -> Self {
        Self {
            id: ParticipantId::new(MODERATOR_ID),
            name: "Moderator".to_string(),
            title: "AI meeting facilitator".to_string(),
            personality: "professional, impartial, organised".to_string(),
            expertise: "meeting facilitation and summaries".to_string(),
            is_active: true,
        }
    }

    pub fn is_moderator(&self) -> bool {
        self.id.as_str() == MODERATOR_ID
    }
}

/// One utterance in the dialogue. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub speaker_id: ParticipantId,
    pub speaker_name: String,
    pub speaker_title: String,
    pub text: String,
    pub timestamp: String,
}
