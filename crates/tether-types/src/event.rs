use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{RunOutcome, RunStatus, SessionKey};

/// Observable unit of progress inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    TextDelta {
        text: String,
    },
    ToolCall {
        #[serde(rename = "callID")]
        call_id: String,
        tool: String,
        #[serde(default)]
        args: Value,
    },
    ToolResult {
        #[serde(rename = "callID")]
        call_id: String,
        #[serde(default)]
        output: Value,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },
    StatusChanged {
        from: RunStatus,
        to: RunStatus,
    },
    SubagentSpawned {
        #[serde(rename = "childSessionKey")]
        child_session_key: SessionKey,
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    FollowUp {
        message: String,
    },
    Notice {
        message: String,
    },
}

impl EventPayload {
    pub fn text(text: impl Into<String>) -> Self {
        EventPayload::TextDelta { text: text.into() }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        EventPayload::Notice {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::TextDelta { .. } => "text_delta",
            EventPayload::ToolCall { .. } => "tool_call",
            EventPayload::ToolResult { .. } => "tool_result",
            EventPayload::StatusChanged { .. } => "status_changed",
            EventPayload::SubagentSpawned { .. } => "subagent_spawned",
            EventPayload::FollowUp { .. } => "follow_up",
            EventPayload::Notice { .. } => "notice",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u64,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: u64,
    pub payload: EventPayload,
}

/// Sentinel that closes a run's buffer. Not an event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalMarker {
    pub seq: u64,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: u64,
    pub outcome: RunOutcome,
}

/// What a listener receives: buffered/live events, then exactly one terminal marker.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(RunEvent),
    Terminal(TerminalMarker),
}

impl StreamItem {
    pub fn seq(&self) -> u64 {
        match self {
            StreamItem::Event(event) => event.seq,
            StreamItem::Terminal(marker) => marker.seq,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamItem::Terminal(_))
    }

    pub fn as_event(&self) -> Option<&RunEvent> {
        match self {
            StreamItem::Event(event) => Some(event),
            StreamItem::Terminal(_) => None,
        }
    }
}

/// One JSON object per delivery on the wire. `payload: null` marks the end of
/// the stream; the transport closes the channel after sending it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "sessionKey")]
    pub session_key: SessionKey,
    pub seq: u64,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: u64,
    pub payload: Option<EventPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

impl WireFrame {
    pub fn from_item(session_key: &SessionKey, item: &StreamItem) -> Self {
        match item {
            StreamItem::Event(event) => Self {
                session_key: session_key.clone(),
                seq: event.seq,
                timestamp_ms: event.timestamp_ms,
                payload: Some(event.payload.clone()),
                outcome: None,
            },
            StreamItem::Terminal(marker) => Self {
                session_key: session_key.clone(),
                seq: marker.seq,
                timestamp_ms: marker.timestamp_ms,
                payload: None,
                outcome: Some(marker.outcome.clone()),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_none()
    }
}
