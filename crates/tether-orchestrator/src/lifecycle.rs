use thiserror::Error;

use tether_types::{OutcomeStatus, RunOutcome, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Start,
    /// The execution asked to block on its outstanding children.
    ChildSpawnedBlock,
    AllChildrenTerminal,
    Finish { success: bool },
    Abort,
}

impl RunTrigger {
    pub fn for_outcome(outcome: &RunOutcome) -> Self {
        match outcome.status {
            OutcomeStatus::Completed => RunTrigger::Finish { success: true },
            OutcomeStatus::Errored => RunTrigger::Finish { success: false },
            OutcomeStatus::Aborted => RunTrigger::Abort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot apply {trigger:?} to a run in status {from}")]
pub struct InvalidTransition {
    pub from: RunStatus,
    pub trigger: RunTrigger,
}

/// Next status for `from` under `trigger`.
///
/// A finish is accepted while waiting for subagents: the execution decides
/// when it is done, even if children are still outstanding.
pub fn transition(from: RunStatus, trigger: RunTrigger) -> Result<RunStatus, InvalidTransition> {
    use RunStatus::*;

    let next = match (from, trigger) {
        (Idle | Completed | Errored | Aborted, RunTrigger::Start) => Running,
        (Running, RunTrigger::ChildSpawnedBlock) => WaitingForSubagents,
        (WaitingForSubagents, RunTrigger::AllChildrenTerminal) => Running,
        (Running | WaitingForSubagents, RunTrigger::Finish { success: true }) => Completed,
        (Running | WaitingForSubagents, RunTrigger::Finish { success: false }) => Errored,
        (Running | WaitingForSubagents, RunTrigger::Abort) => Aborted,
        (
            Running | WaitingForSubagents,
            RunTrigger::Start,
        )
        | (
            Idle | WaitingForSubagents | Completed | Errored | Aborted,
            RunTrigger::ChildSpawnedBlock,
        )
        | (
            Idle | Running | Completed | Errored | Aborted,
            RunTrigger::AllChildrenTerminal,
        )
        | (Idle | Completed | Errored | Aborted, RunTrigger::Finish { .. })
        | (Idle | Completed | Errored | Aborted, RunTrigger::Abort) => {
            return Err(InvalidTransition { from, trigger })
        }
    };
    Ok(next)
}
