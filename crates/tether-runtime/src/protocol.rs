//! JSONL framing between the engine and an executor process.
//!
//! The engine writes [`InputLine`]s to the child's stdin. Every stdout line is
//! either an event payload, a control request, or free text that is surfaced
//! as a `notice` event.

use serde::{Deserialize, Serialize};

use tether_types::{EventPayload, RunStatus, SessionKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputLine {
    Input {
        text: String,
    },
    FollowUp {
        text: String,
    },
    SubagentSpawned {
        #[serde(rename = "childSessionKey")]
        child_session_key: SessionKey,
    },
    SubagentError {
        error: String,
    },
    SubagentsSettled {
        status: RunStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlLine {
    SpawnSubagent {
        task: String,
        #[serde(default)]
        label: Option<String>,
    },
    WaitSubagents,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    Event(EventPayload),
    Control(ControlLine),
}

/// `None` for blank lines.
pub fn parse_output_line(line: &str) -> Option<OutputLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(control) = serde_json::from_str::<ControlLine>(trimmed) {
        return Some(OutputLine::Control(control));
    }
    if let Ok(payload) = serde_json::from_str::<EventPayload>(trimmed) {
        return Some(OutputLine::Event(payload));
    }
    Some(OutputLine::Event(EventPayload::notice(trimmed)))
}

pub fn encode_input_line(line: &InputLine) -> anyhow::Result<String> {
    let mut raw = serde_json::to_string(line)?;
    raw.push('\n');
    Ok(raw)
}
