use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_types::{EventPayload, RunEvent, RunStatus, SessionKey};

use crate::registry::RunSlot;
use crate::{HierarchyCoordinator, OrchestratorError, RunRegistry};

/// Does the actual work of a run.
///
/// Returning `Ok` completes the run, `Err` errors it. When the run is aborted
/// or times out the future is dropped, so implementations must not rely on
/// code after an `.await` running to completion.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: RunContext) -> anyhow::Result<()>;
}

/// Everything an execution gets to observe and drive its run.
pub struct RunContext {
    pub session_key: SessionKey,
    pub run_id: String,
    pub input: String,
    pub cancel: CancellationToken,
    pub follow_ups: mpsc::UnboundedReceiver<String>,
    pub control: RunControl,
}

impl RunContext {
    pub(crate) fn new(
        slot: Arc<RunSlot>,
        registry: RunRegistry,
        input: String,
        follow_ups: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            session_key: slot.key.clone(),
            run_id: slot.run_id.clone(),
            input,
            cancel: slot.cancel.clone(),
            follow_ups,
            control: RunControl { slot, registry },
        }
    }

    /// Moves the follow-up receiver out so it can be polled alongside the control handle.
    pub fn take_follow_ups(&mut self) -> mpsc::UnboundedReceiver<String> {
        let (_, closed) = mpsc::unbounded_channel();
        std::mem::replace(&mut self.follow_ups, closed)
    }

    pub fn emit(&self, payload: EventPayload) -> Result<RunEvent, OrchestratorError> {
        self.control.emit(payload)
    }

    pub async fn spawn_subagent(
        &self,
        task: impl Into<String>,
        label: Option<String>,
    ) -> Result<SessionKey, OrchestratorError> {
        self.control.spawn_subagent(task, label).await
    }

    pub async fn wait_for_subagents(&self) -> RunStatus {
        self.control.wait_for_subagents().await
    }
}

/// Cloneable handle onto a live run, shared by an execution's tasks.
#[derive(Clone)]
pub struct RunControl {
    slot: Arc<RunSlot>,
    registry: RunRegistry,
}

impl RunControl {
    pub fn session_key(&self) -> &SessionKey {
        &self.slot.key
    }

    pub fn run_id(&self) -> &str {
        &self.slot.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.slot.status()
    }

    /// Appends progress. Fails once the run is terminal.
    pub fn emit(&self, payload: EventPayload) -> Result<RunEvent, OrchestratorError> {
        self.slot.append_progress(payload)
    }

    /// Registers a new child under this run and starts it with `task` as input.
    pub async fn spawn_subagent(
        &self,
        task: impl Into<String>,
        label: Option<String>,
    ) -> Result<SessionKey, OrchestratorError> {
        let child = self.slot.key.new_subagent();
        HierarchyCoordinator::new(self.registry.clone())
            .register_subagent(&child, &self.slot.key, task, label)
            .await?;
        Ok(child)
    }

    /// Blocks while any child is still active.
    ///
    /// Returns immediately with the current status when there is nothing to
    /// wait for. Otherwise the run enters waiting-for-subagents and this
    /// resolves once it is back to running or has become terminal.
    pub async fn wait_for_subagents(&self) -> RunStatus {
        self.registry.wait_for_children(&self.slot).await
    }
}
