use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::channel::ReconnectPolicy;

pub const DEFAULT_SETTINGS_FILE: &str = "conference.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub server_url: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".into(),
            reconnect_delay_ms: 3_000,
            max_reconnect_attempts: 1,
            event_buffer: 1024,
        }
    }
}

impl EngineSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_delay_ms),
            self.max_reconnect_attempts,
        )
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    reconnect_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    event_buffer: Option<usize>,
}

/// Defaults, then `path` if it exists, then environment overrides.
pub fn load_settings(path: &Path) -> EngineSettings {
    let mut settings = EngineSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), error = %err, "ignoring unreadable settings file"),
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut EngineSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.reconnect_delay_ms {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = file_cfg.max_reconnect_attempts {
        settings.max_reconnect_attempts = v;
    }
    if let Some(v) = file_cfg.event_buffer {
        settings.event_buffer = v;
    }
}

pub(crate) fn apply_env_overrides(
    settings: &mut EngineSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(v) = lookup("CONFERENCE_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = lookup("APP__RECONNECT_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_delay_ms = parsed;
        }
    }
    if let Some(v) = lookup("APP__MAX_RECONNECT_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.max_reconnect_attempts = parsed;
        }
    }
    if let Some(v) = lookup("APP__EVENT_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.event_buffer = parsed;
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
