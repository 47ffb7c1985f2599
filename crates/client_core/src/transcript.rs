use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::store::Session;

pub fn export(session: &Session) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Conference Transcript\n");
    let _ = writeln!(out, "## Topic: {}\n", session.topic());
    let _ = writeln!(
        out,
        "## Mode: {}\n",
        session.config.scenario.as_deref().unwrap_or("default")
    );

    let _ = writeln!(out, "## Participants:");
    for participant in session.config.active_participants() {
        let _ = writeln!(out, "- {} ({})", participant.name, participant.title);
    }

    let _ = writeln!(out, "\n## Dialogue:\n");
    for message in &session.messages {
        let _ = writeln!(
            out,
            "### {} - {} ({}):\n{}\n",
            clock_time(&message.timestamp),
            message.speaker_name,
            message.speaker_title,
            message.text
        );
    }

    if let Some(conclusion) = &session.conclusion {
        let _ = writeln!(out, "## Conclusion:\n\n{conclusion}");
    }
    out
}

/// `transcript-<topic>-<YYYY-MM-DD>.md`, with path-hostile characters replaced.
pub fn suggested_filename(session: &Session, date: NaiveDate) -> String {
    let topic: String = session
        .topic()
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    let topic = if topic.is_empty() { "untitled" } else { topic.as_str() };
    format!("transcript-{topic}-{}.md", date.format("%Y-%m-%d"))
}

// Backend timestamps are ISO-8601, usually without an offset.
fn clock_time(timestamp: &str) -> String {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
        return parsed.format("%H:%M:%S").to_string();
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f") {
        return parsed.format("%H:%M:%S").to_string();
    }
    timestamp.to_string()
}
