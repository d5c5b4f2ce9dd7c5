use serde::{Deserialize, Serialize};

use crate::SessionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Idle,
    Running,
    WaitingForSubagents,
    Completed,
    Errored,
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::WaitingForSubagents => "waiting-for-subagents",
            RunStatus::Completed => "completed",
            RunStatus::Errored => "errored",
            RunStatus::Aborted => "aborted",
        }
    }

    /// Terminal for scheduling: no further progress will happen on this run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Idle | RunStatus::Completed | RunStatus::Errored | RunStatus::Aborted
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether the execution is still alive to receive new input.
    pub fn accepts_follow_up(self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::WaitingForSubagents)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Errored,
    Aborted,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Completed => "completed",
            OutcomeStatus::Errored => "errored",
            OutcomeStatus::Aborted => "aborted",
        }
    }
}

impl From<OutcomeStatus> for RunStatus {
    fn from(value: OutcomeStatus) -> Self {
        match value {
            OutcomeStatus::Completed => RunStatus::Completed,
            OutcomeStatus::Errored => RunStatus::Errored,
            OutcomeStatus::Aborted => RunStatus::Aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn completed() -> Self {
        Self {
            status: OutcomeStatus::Completed,
            error: None,
        }
    }

    pub fn errored(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Errored,
            error: Some(error.into()),
        }
    }

    pub fn aborted() -> Self {
        Self {
            status: OutcomeStatus::Aborted,
            error: None,
        }
    }

    pub fn run_status(&self) -> RunStatus {
        self.status.into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(rename = "sessionKey")]
    pub session_key: SessionKey,
    #[serde(rename = "runID")]
    pub run_id: String,
    pub status: RunStatus,
    #[serde(rename = "parentSessionKey", skip_serializing_if = "Option::is_none")]
    pub parent_session_key: Option<SessionKey>,
    #[serde(rename = "childSessionKeys", default)]
    pub child_session_keys: Vec<SessionKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "createdAtMs")]
    pub created_at_ms: u64,
    #[serde(rename = "endedAtMs", skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(rename = "eventCount")]
    pub event_count: usize,
    /// False for runs rebuilt from the persistent registry without a live execution.
    pub attached: bool,
}
