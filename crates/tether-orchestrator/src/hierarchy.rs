use tracing::Level;

use tether_observability::{emit, Lifecycle, LifecycleRecord};
use tether_subagents::{SubagentRunRecord, SubagentStore};
use tether_types::{RunOutcome, SessionKey};

use crate::{OrchestratorError, RunRegistry, StartRunParams};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registered {
    Created { run_id: String },
    /// The child already had an active run; nothing was changed.
    AlreadyActive { run_id: String },
}

impl Registered {
    pub fn run_id(&self) -> &str {
        match self {
            Registered::Created { run_id } | Registered::AlreadyActive { run_id } => run_id,
        }
    }
}

/// Parent/child bookkeeping on top of [`RunRegistry`], backed by the durable
/// subagent store so children can be found again after a restart.
#[derive(Clone)]
pub struct HierarchyCoordinator {
    registry: RunRegistry,
}

impl HierarchyCoordinator {
    pub fn new(registry: RunRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    fn store(&self) -> &SubagentStore {
        &self.registry.inner.store
    }

    /// Parent encoded in the key, else the requester recorded on disk.
    pub async fn derive_parent(&self, child: &str) -> Option<SessionKey> {
        let child = SessionKey::parse(child).ok()?;
        if let Some(parent) = child.parent() {
            return Some(parent);
        }
        match self.store().find_by_child(&child, None).await {
            Ok(record) => record.map(|r| r.requester_session_key),
            Err(err) => {
                tracing::warn!(session_key = %child, error = %err, "subagent lookup failed");
                None
            }
        }
    }

    /// Starts `child` under `parent` with `task` as its first input.
    pub async fn register_subagent(
        &self,
        child: &SessionKey,
        parent: &SessionKey,
        task: impl Into<String>,
        label: Option<String>,
    ) -> Result<Registered, OrchestratorError> {
        let task = task.into();
        self.register_subagent_with_input(child, parent, task.clone(), label, task)
            .await
    }

    /// Like [`register_subagent`](Self::register_subagent) but with a first
    /// input that differs from the recorded task.
    pub async fn register_subagent_with_input(
        &self,
        child: &SessionKey,
        parent: &SessionKey,
        task: impl Into<String>,
        label: Option<String>,
        input: impl Into<String>,
    ) -> Result<Registered, OrchestratorError> {
        let task = task.into();
        if let Some(encoded) = child.parent() {
            if &encoded != parent {
                return Err(OrchestratorError::ParentMismatch {
                    child: child.clone(),
                    parent: parent.clone(),
                });
            }
        }
        self.registry.refresh_key(child).await;
        if let Some(active) = self.registry.get_active_run(child) {
            return Ok(Registered::AlreadyActive {
                run_id: active.run_id,
            });
        }
        let depth = child.depth().max(parent.depth() + 1);
        let max = self.registry.config().max_subagent_depth;
        if depth > max {
            return Err(OrchestratorError::DepthExceeded { depth, max });
        }

        match self
            .start_child_run(child, parent, task, label, input.into())
            .await
        {
            Ok(run_id) => {
                emit(
                    Level::INFO,
                    LifecycleRecord::new(Lifecycle::SubagentRegistered)
                        .run(child, &run_id)
                        .parent(Some(parent)),
                );
                Ok(Registered::Created { run_id })
            }
            Err(OrchestratorError::AlreadyRunning { run_id, .. }) => {
                Ok(Registered::AlreadyActive { run_id })
            }
            Err(err) => Err(err),
        }
    }

    /// Reserves the child's run, persists its entry, links it to the parent,
    /// and only then starts the execution, so completion always finds the entry.
    async fn start_child_run(
        &self,
        child: &SessionKey,
        parent: &SessionKey,
        task: String,
        label: Option<String>,
        input: String,
    ) -> Result<String, OrchestratorError> {
        let params = StartRunParams {
            input,
            parent: Some(parent.clone()),
            task: Some(task.clone()),
            label: label.clone(),
        };
        let (slot, channels) = self.registry.reserve(child, &params)?;
        let record = SubagentRunRecord::new(
            slot.run_id.clone(),
            child.clone(),
            parent.clone(),
            task.clone(),
            label.clone(),
        );
        if let Err(err) = self.store().put(&record).await {
            let message = format!("failed to persist subagent entry: {err}");
            self.registry
                .finish(&slot, RunOutcome::errored(message.clone()))
                .await;
            return Err(OrchestratorError::Storage(message));
        }
        self.registry.link_child(parent, child, &task, label);
        let run_id = slot.run_id.clone();
        self.registry.launch(slot, params.input, channels);
        Ok(run_id)
    }

    /// Rebuilds the newest durable entry for `child` into memory when the
    /// registry does not know it. True if the run is (now) known.
    ///
    /// A run already rebuilt earlier is refreshed instead, so an end recorded
    /// on disk since then is picked up.
    pub async fn ensure_registered_from_disk(
        &self,
        child: &SessionKey,
        parent_hint: Option<&SessionKey>,
    ) -> bool {
        if self.registry.get_run(child).is_some() {
            self.registry.refresh_key(child).await;
            return true;
        }
        let record = match self.store().find_by_child(child, parent_hint).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(session_key = %child, error = %err, "subagent reconciliation failed");
                return false;
            }
        };
        if self.registry.insert_reconstructed(&record) {
            emit(
                Level::INFO,
                LifecycleRecord::new(Lifecycle::SubagentReconciled)
                    .run(child, &record.run_id)
                    .parent(Some(&record.requester_session_key))
                    .run_status(record.inferred_status()),
            );
        }
        self.registry.refresh_key(child).await;
        true
    }

    /// Sends `message` to `child`, reconciling from disk first if needed.
    ///
    /// A finished child is started again with `message` as its input. This
    /// does not depend on whether the parent is waiting.
    pub async fn send_follow_up(&self, child: &SessionKey, message: impl Into<String>) -> bool {
        let message = message.into();
        let parent_hint = child.parent();
        if !self
            .ensure_registered_from_disk(child, parent_hint.as_ref())
            .await
        {
            return false;
        }
        match self.registry.follow_up(child, message.clone()).await {
            Ok(()) => true,
            Err(OrchestratorError::NotRunning(_)) => self.reactivate(child, message).await,
            Err(err) => {
                tracing::debug!(session_key = %child, error = %err, "follow-up rejected");
                false
            }
        }
    }

    async fn reactivate(&self, child: &SessionKey, message: String) -> bool {
        let Some(previous) = self.registry.get_run(child) else {
            return false;
        };
        if previous.status.is_active() {
            // Active but without a live execution in this process.
            return false;
        }
        let started = match previous.parent_session_key {
            Some(parent) => self
                .start_child_run(
                    child,
                    &parent,
                    previous.task.unwrap_or_default(),
                    previous.label,
                    message.clone(),
                )
                .await
                .map(|_| ()),
            None => self
                .registry
                .start_run(child, StartRunParams::new(message.clone()))
                .await
                .map(|_| ()),
        };
        match started {
            Ok(()) => true,
            // Someone else reactivated it first; deliver to that run instead.
            Err(OrchestratorError::AlreadyRunning { .. }) => {
                self.registry.follow_up(child, message).await.is_ok()
            }
            Err(err) => {
                tracing::warn!(session_key = %child, error = %err, "failed to reactivate subagent");
                false
            }
        }
    }

    /// Durable entries requested by `parent`, oldest first.
    pub async fn list_children(&self, parent: &SessionKey) -> anyhow::Result<Vec<SubagentRunRecord>> {
        self.store().list_by_requester(parent).await
    }
}
