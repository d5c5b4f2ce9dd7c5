use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use tether_core::{EventBuffer, OrchestratorConfig, RunListener, Subscription, TranscriptSink};
use tether_observability::{emit, redact_input, Lifecycle, LifecycleRecord};
use tether_subagents::{SubagentRunRecord, SubagentStore};
use tether_types::{
    now_ms, EventPayload, OutcomeStatus, RunEvent, RunOutcome, RunStatus, RunSummary, SessionKey,
    TranscriptMessage,
};

use crate::{
    transition, Executor, HierarchyCoordinator, InvalidTransition, OrchestratorError, RunContext,
    RunTrigger,
};

const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct StartRunParams {
    pub input: String,
    pub parent: Option<SessionKey>,
    pub task: Option<String>,
    pub label: Option<String>,
}

impl StartRunParams {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }
}

pub(crate) struct SlotState {
    pub(crate) status: RunStatus,
    pub(crate) parent: Option<SessionKey>,
    pub(crate) children: Vec<SessionKey>,
    pub(crate) task: Option<String>,
    pub(crate) label: Option<String>,
    pub(crate) created_at_ms: u64,
    pub(crate) ended_at_ms: Option<u64>,
    pub(crate) outcome: Option<RunOutcome>,
    pub(crate) follow_up_tx: Option<mpsc::UnboundedSender<String>>,
    /// User messages queued for the transcript writer, in arrival order.
    pub(crate) transcript_tx: Option<mpsc::UnboundedSender<String>>,
}

/// Receivers handed from `reserve` to `launch`.
pub(crate) struct RunChannels {
    pub(crate) follow_ups: mpsc::UnboundedReceiver<String>,
    pub(crate) transcript: mpsc::UnboundedReceiver<String>,
}

/// One run of one session. The registry keeps the latest slot per key.
pub(crate) struct RunSlot {
    pub(crate) key: SessionKey,
    pub(crate) run_id: String,
    pub(crate) buffer: EventBuffer,
    pub(crate) cancel: CancellationToken,
    /// False for runs rebuilt from disk with no execution behind them.
    pub(crate) attached: bool,
    pub(crate) state: Mutex<SlotState>,
    status_tx: watch::Sender<RunStatus>,
}

impl RunSlot {
    fn new(key: SessionKey, run_id: String, buffer: EventBuffer, attached: bool, state: SlotState) -> Self {
        let (status_tx, _) = watch::channel(state.status);
        Self {
            key,
            run_id,
            buffer,
            cancel: CancellationToken::new(),
            attached,
            state: Mutex::new(state),
            status_tx,
        }
    }

    pub(crate) fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn summary(&self) -> RunSummary {
        let state = self.state.lock();
        RunSummary {
            session_key: self.key.clone(),
            run_id: self.run_id.clone(),
            status: state.status,
            parent_session_key: state.parent.clone(),
            child_session_keys: state.children.clone(),
            task: state.task.clone(),
            label: state.label.clone(),
            created_at_ms: state.created_at_ms,
            ended_at_ms: state.ended_at_ms,
            outcome: state.outcome.clone(),
            event_count: self.buffer.len(),
            attached: self.attached,
        }
    }

    /// Appends under the slot lock so nothing lands after the terminal marker.
    pub(crate) fn append_progress(&self, payload: EventPayload) -> Result<RunEvent, OrchestratorError> {
        let state = self.state.lock();
        if state.status.is_terminal() {
            return Err(OrchestratorError::BufferClosed);
        }
        Ok(self.buffer.append(payload)?)
    }

    /// Moves between non-terminal states and records the change as an event.
    pub(crate) fn shift(
        &self,
        state: &mut SlotState,
        trigger: RunTrigger,
    ) -> Result<RunStatus, InvalidTransition> {
        let from = state.status;
        let to = transition(from, trigger)?;
        state.status = to;
        let _ = self.buffer.append(EventPayload::StatusChanged { from, to });
        self.status_tx.send_replace(to);
        Ok(to)
    }

    /// Terminal transition. Closes the buffer and cancels the execution.
    fn terminate(
        &self,
        state: &mut SlotState,
        outcome: &RunOutcome,
        ended_at_ms: u64,
    ) -> Result<(), InvalidTransition> {
        let to = transition(state.status, RunTrigger::for_outcome(outcome))?;
        state.status = to;
        state.ended_at_ms = Some(ended_at_ms);
        state.outcome = Some(outcome.clone());
        state.follow_up_tx = None;
        state.transcript_tx = None;
        let _ = self.buffer.close(outcome.clone());
        self.cancel.cancel();
        self.status_tx.send_replace(to);
        Ok(())
    }
}

pub(crate) struct RegistryInner {
    runs: Mutex<HashMap<SessionKey, Arc<RunSlot>>>,
    executor: Arc<dyn Executor>,
    transcripts: Arc<dyn TranscriptSink>,
    pub(crate) store: SubagentStore,
    pub(crate) config: OrchestratorConfig,
}

/// Tracks every run by session key: at most one active run per key, plus
/// finished runs kept for late replay until they age out.
#[derive(Clone)]
pub struct RunRegistry {
    pub(crate) inner: Arc<RegistryInner>,
}

impl RunRegistry {
    pub fn new(
        executor: Arc<dyn Executor>,
        transcripts: Arc<dyn TranscriptSink>,
        store: SubagentStore,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                runs: Mutex::new(HashMap::new()),
                executor,
                transcripts,
                store,
                config,
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn hierarchy(&self) -> HierarchyCoordinator {
        HierarchyCoordinator::new(self.clone())
    }

    pub(crate) fn slot(&self, key: &SessionKey) -> Option<Arc<RunSlot>> {
        self.inner.runs.lock().get(key).cloned()
    }

    pub fn has_active_run(&self, key: &SessionKey) -> bool {
        self.slot(key)
            .map(|slot| slot.status().is_active())
            .unwrap_or(false)
    }

    /// Latest run for `key`, including finished runs still retained.
    pub fn get_run(&self, key: &SessionKey) -> Option<RunSummary> {
        self.slot(key).map(|slot| slot.summary())
    }

    pub fn get_active_run(&self, key: &SessionKey) -> Option<RunSummary> {
        self.get_run(key).filter(|run| run.status.is_active())
    }

    pub fn list_runs(&self) -> Vec<RunSummary> {
        let slots = self.inner.runs.lock().values().cloned().collect::<Vec<_>>();
        let mut runs = slots.iter().map(|slot| slot.summary()).collect::<Vec<_>>();
        runs.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.session_key.cmp(&b.session_key))
        });
        runs
    }

    pub fn active_run_count(&self) -> usize {
        let slots = self.inner.runs.lock().values().cloned().collect::<Vec<_>>();
        slots.iter().filter(|slot| slot.status().is_active()).count()
    }

    pub fn watch_status(&self, key: &SessionKey) -> Option<watch::Receiver<RunStatus>> {
        self.slot(key).map(|slot| slot.watch_status())
    }

    /// Attaches `listener` to the latest run for `key`. `None` for unknown keys.
    pub fn subscribe(
        &self,
        key: &SessionKey,
        listener: Arc<dyn RunListener>,
        replay: bool,
    ) -> Option<Subscription> {
        self.slot(key)
            .map(|slot| slot.buffer.subscribe(listener, replay))
    }

    /// Starts a run and spawns its execution. Returns once the execution is
    /// scheduled, not when it finishes.
    ///
    /// Only for runs without a parent. Subagents are started through
    /// [`HierarchyCoordinator::register_subagent`] so they get linked and
    /// persisted.
    pub async fn start_run(
        &self,
        key: &SessionKey,
        params: StartRunParams,
    ) -> Result<RunSummary, OrchestratorError> {
        if key.is_subagent() || params.parent.is_some() {
            return Err(OrchestratorError::SubagentRequiresParent(key.clone()));
        }
        self.refresh_key(key).await;
        let (slot, channels) = self.reserve(key, &params)?;
        self.launch(slot.clone(), params.input, channels);
        Ok(slot.summary())
    }

    /// Creates the slot in `running` without starting anything. The map lock
    /// is the single decision point for single-flight.
    pub(crate) fn reserve(
        &self,
        key: &SessionKey,
        params: &StartRunParams,
    ) -> Result<(Arc<RunSlot>, RunChannels), OrchestratorError> {
        if let Some(encoded) = key.parent() {
            match &params.parent {
                None => return Err(OrchestratorError::SubagentRequiresParent(key.clone())),
                Some(parent) if *parent != encoded => {
                    return Err(OrchestratorError::ParentMismatch {
                        child: key.clone(),
                        parent: parent.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        let mut runs = self.inner.runs.lock();
        let previous = match runs.get(key) {
            Some(existing) => {
                let status = existing.status();
                if status.is_active() {
                    return Err(OrchestratorError::AlreadyRunning {
                        session_key: key.clone(),
                        run_id: existing.run_id.clone(),
                    });
                }
                status
            }
            None => RunStatus::Idle,
        };
        let status = transition(previous, RunTrigger::Start)?;
        let (follow_up_tx, follow_ups) = mpsc::unbounded_channel();
        let (transcript_tx, transcript) = mpsc::unbounded_channel();
        let _ = transcript_tx.send(params.input.clone());
        let slot = Arc::new(RunSlot::new(
            key.clone(),
            Uuid::new_v4().to_string(),
            EventBuffer::new(),
            true,
            SlotState {
                status,
                parent: params.parent.clone(),
                children: Vec::new(),
                task: params.task.clone(),
                label: params.label.clone(),
                created_at_ms: now_ms(),
                ended_at_ms: None,
                outcome: None,
                follow_up_tx: Some(follow_up_tx),
                transcript_tx: Some(transcript_tx),
            },
        ));
        runs.insert(key.clone(), slot.clone());
        Ok((slot, RunChannels { follow_ups, transcript }))
    }

    /// Starts the transcript writer and the execution for a reserved slot.
    pub(crate) fn launch(&self, slot: Arc<RunSlot>, input: String, channels: RunChannels) {
        let parent = slot.state.lock().parent.clone();
        emit(
            Level::INFO,
            LifecycleRecord::new(Lifecycle::RunStarted)
                .run(&slot.key, &slot.run_id)
                .parent(parent.as_ref())
                .run_status(RunStatus::Running)
                .detail(redact_input(&input)),
        );
        self.spawn_transcript_writer(slot.key.clone(), channels.transcript);
        let ctx = RunContext::new(slot.clone(), self.clone(), input, channels.follow_ups);
        self.spawn_execution(slot, ctx);
    }

    /// Records queued user messages one at a time. Ends when the run's
    /// sender is dropped at its terminal transition.
    fn spawn_transcript_writer(&self, key: SessionKey, mut messages: mpsc::UnboundedReceiver<String>) {
        let transcripts = self.inner.transcripts.clone();
        tokio::spawn(async move {
            while let Some(text) = messages.recv().await {
                let message = TranscriptMessage::user(text);
                if let Err(err) = transcripts.record(&key, &message).await {
                    tracing::warn!(session_key = %key, error = %err, "failed to record transcript message");
                }
            }
        });
    }

    fn spawn_execution(&self, slot: Arc<RunSlot>, ctx: RunContext) {
        let registry = self.clone();
        tokio::spawn(async move {
            let cancel = slot.cancel.clone();
            let timeout_secs = registry.inner.config.run_timeout_secs;
            let run_fut = registry.inner.executor.execute(ctx);
            tokio::pin!(run_fut);
            let timeout = async move {
                if timeout_secs == 0 {
                    std::future::pending::<()>().await;
                } else {
                    tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
                }
            };
            tokio::pin!(timeout);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                _ = &mut timeout => Some(RunOutcome::errored("run timed out")),
                result = &mut run_fut => Some(match result {
                    Ok(()) => RunOutcome::completed(),
                    Err(err) => RunOutcome::errored(truncate_text(&err.to_string(), MAX_ERROR_CHARS)),
                }),
            };
            if let Some(outcome) = outcome {
                registry.finish(&slot, outcome).await;
            }
        });
    }

    /// Records a terminal outcome. False if the run was already terminal.
    pub(crate) async fn finish(&self, slot: &Arc<RunSlot>, outcome: RunOutcome) -> bool {
        self.settle(slot, outcome, now_ms(), true).await
    }

    /// Terminal transition plus its side effects. `persist` is false when the
    /// durable entry already holds this outcome.
    async fn settle(
        &self,
        slot: &Arc<RunSlot>,
        outcome: RunOutcome,
        ended_at_ms: u64,
        persist: bool,
    ) -> bool {
        {
            let mut state = slot.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            if let Err(err) = slot.terminate(&mut state, &outcome, ended_at_ms) {
                tracing::warn!(session_key = %slot.key, error = %err, "rejected terminal transition");
                return false;
            }
        }
        self.after_terminal(slot, &outcome, ended_at_ms, persist).await;
        true
    }

    /// Cancels the execution and marks the run aborted right away. False if
    /// there is no active run for `key`.
    pub async fn abort_run(&self, key: &SessionKey) -> bool {
        let Some(slot) = self.slot(key) else {
            return false;
        };
        self.finish(&slot, RunOutcome::aborted()).await
    }

    /// Delivers `message` to a live execution and records it.
    pub async fn follow_up(
        &self,
        key: &SessionKey,
        message: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let message = message.into();
        let slot = self
            .slot(key)
            .ok_or_else(|| OrchestratorError::NotRunning(key.clone()))?;
        {
            let state = slot.state.lock();
            if !state.status.accepts_follow_up() {
                return Err(OrchestratorError::NotRunning(key.clone()));
            }
            let tx = state
                .follow_up_tx
                .as_ref()
                .ok_or_else(|| OrchestratorError::NotRunning(key.clone()))?;
            tx.send(message.clone())
                .map_err(|_| OrchestratorError::NotRunning(key.clone()))?;
            slot.buffer.append(EventPayload::FollowUp {
                message: message.clone(),
            })?;
            if let Some(transcript) = &state.transcript_tx {
                let _ = transcript.send(message.clone());
            }
        }
        emit(
            Level::INFO,
            LifecycleRecord::new(Lifecycle::RunFollowUp)
                .run(key, &slot.run_id)
                .detail(redact_input(&message)),
        );
        Ok(())
    }

    /// Periodic upkeep: settles detached runs whose outcome is known or that
    /// outlived the run timeout, then evicts expired finished runs.
    pub async fn reap(&self) -> Vec<SessionKey> {
        let detached = self
            .inner
            .runs
            .lock()
            .values()
            .filter(|slot| !slot.attached)
            .cloned()
            .collect::<Vec<_>>();
        for slot in detached {
            self.refresh_detached(&slot).await;
        }
        self.prune_expired()
    }

    /// Refreshes the run for `key` if it is a detached one.
    pub(crate) async fn refresh_key(&self, key: &SessionKey) {
        if let Some(slot) = self.slot(key) {
            self.refresh_detached(&slot).await;
        }
    }

    /// A detached run has no execution to finish it. It ends when its durable
    /// entry records an end, or errors once older than the run timeout.
    /// True if the run was settled.
    pub(crate) async fn refresh_detached(&self, slot: &Arc<RunSlot>) -> bool {
        if slot.attached || slot.status().is_terminal() {
            return false;
        }
        let ended = self
            .inner
            .store
            .get(&slot.run_id)
            .await
            .and_then(|record| Some((record.ended_at_ms?, record.outcome)));
        if let Some((ended_at_ms, outcome)) = ended {
            let outcome = outcome.unwrap_or_else(RunOutcome::completed);
            return self.settle(slot, outcome, ended_at_ms, false).await;
        }
        let timeout_ms = self.inner.config.run_timeout_secs.saturating_mul(1000);
        let created_at_ms = slot.state.lock().created_at_ms;
        if timeout_ms > 0 && now_ms().saturating_sub(created_at_ms) >= timeout_ms {
            return self
                .finish(slot, RunOutcome::errored("run lost its execution"))
                .await;
        }
        false
    }

    /// Evicts finished runs older than the retention window.
    pub fn prune_expired(&self) -> Vec<SessionKey> {
        self.prune_expired_at(now_ms())
    }

    pub(crate) fn prune_expired_at(&self, now: u64) -> Vec<SessionKey> {
        let retention_ms = self.inner.config.retention_secs.saturating_mul(1000);
        let mut runs = self.inner.runs.lock();
        let expired = runs
            .iter()
            .filter_map(|(key, slot)| {
                let state = slot.state.lock();
                let ended_at_ms = state.ended_at_ms?;
                (state.status.is_terminal() && now.saturating_sub(ended_at_ms) >= retention_ms)
                    .then(|| key.clone())
            })
            .collect::<Vec<_>>();
        for key in &expired {
            runs.remove(key);
        }
        expired
    }

    /// Aborts every active run.
    pub async fn shutdown(&self) -> usize {
        let active = self
            .inner
            .runs
            .lock()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut aborted = 0;
        for slot in active {
            if self.finish(&slot, RunOutcome::aborted()).await {
                aborted += 1;
            }
        }
        aborted
    }

    pub(crate) async fn wait_for_children(&self, slot: &Arc<RunSlot>) -> RunStatus {
        loop {
            let (expected, children) = self.children_of(slot);
            let mut state = slot.state.lock();
            if state.status != RunStatus::Running {
                return state.status;
            }
            // A child linked since the snapshot; look again.
            if state.children != expected {
                continue;
            }
            let pending = children
                .iter()
                .any(|child| child.as_ref().map(|c| c.status().is_active()).unwrap_or(false));
            if !pending {
                return RunStatus::Running;
            }
            if let Err(err) = slot.shift(&mut state, RunTrigger::ChildSpawnedBlock) {
                tracing::warn!(session_key = %slot.key, error = %err, "cannot enter waiting state");
                return state.status;
            }
            break;
        }
        emit(
            Level::INFO,
            LifecycleRecord::new(Lifecycle::ParentWaiting)
                .run(&slot.key, &slot.run_id)
                .run_status(RunStatus::WaitingForSubagents),
        );
        let mut rx = slot.watch_status();
        let resumed = match rx
            .wait_for(|status| *status != RunStatus::WaitingForSubagents)
            .await
        {
            Ok(status) => *status,
            Err(_) => slot.status(),
        };
        resumed
    }

    /// Snapshot of a run's children keys and their current slots.
    fn children_of(&self, slot: &Arc<RunSlot>) -> (Vec<SessionKey>, Vec<Option<Arc<RunSlot>>>) {
        let runs = self.inner.runs.lock();
        let keys = slot.state.lock().children.clone();
        let children = keys.iter().map(|key| runs.get(key).cloned()).collect();
        (keys, children)
    }

    /// Puts a waiting parent back to running once every child is terminal.
    pub(crate) fn resume_parent_if_ready(&self, parent: &SessionKey) {
        let Some(parent_slot) = self.slot(parent) else {
            return;
        };
        let (expected, children) = self.children_of(&parent_slot);
        {
            let mut state = parent_slot.state.lock();
            if state.status != RunStatus::WaitingForSubagents {
                return;
            }
            // A child added since the snapshot will trigger its own check.
            if state.children != expected {
                return;
            }
            let all_terminal = children
                .iter()
                .all(|child| child.as_ref().map(|c| c.status().is_terminal()).unwrap_or(true));
            if !all_terminal {
                return;
            }
            if let Err(err) = parent_slot.shift(&mut state, RunTrigger::AllChildrenTerminal) {
                tracing::warn!(session_key = %parent, error = %err, "cannot resume parent");
                return;
            }
        }
        emit(
            Level::INFO,
            LifecycleRecord::new(Lifecycle::ParentResumed)
                .run(parent, &parent_slot.run_id)
                .run_status(RunStatus::Running),
        );
    }

    /// Adds `child` to the parent's child list. Announces it with a
    /// `subagent_spawned` event only when newly linked to an active parent.
    pub(crate) fn link_child(
        &self,
        parent: &SessionKey,
        child: &SessionKey,
        task: &str,
        label: Option<String>,
    ) {
        let Some(parent_slot) = self.slot(parent) else {
            return;
        };
        let mut state = parent_slot.state.lock();
        if state.children.contains(child) {
            return;
        }
        state.children.push(child.clone());
        if state.status.is_active() {
            let _ = parent_slot.buffer.append(EventPayload::SubagentSpawned {
                child_session_key: child.clone(),
                task: task.to_string(),
                label,
            });
        }
    }

    /// Inserts a run rebuilt from a durable entry unless `key` already has one.
    pub(crate) fn insert_reconstructed(&self, record: &SubagentRunRecord) -> bool {
        let status = record.inferred_status();
        let outcome = if status.is_terminal() {
            Some(record.outcome.clone().unwrap_or_else(RunOutcome::completed))
        } else {
            None
        };
        let buffer = match &outcome {
            Some(outcome) => EventBuffer::closed(outcome.clone()),
            None => EventBuffer::new(),
        };
        let slot = Arc::new(RunSlot::new(
            record.child_session_key.clone(),
            record.run_id.clone(),
            buffer,
            false,
            SlotState {
                status,
                parent: Some(record.requester_session_key.clone()),
                children: Vec::new(),
                task: Some(record.task.clone()),
                label: record.label.clone(),
                created_at_ms: record.created_at_ms,
                ended_at_ms: record.ended_at_ms,
                outcome,
                follow_up_tx: None,
                transcript_tx: None,
            },
        ));
        let mut runs = self.inner.runs.lock();
        if runs.contains_key(&record.child_session_key) {
            return false;
        }
        runs.insert(record.child_session_key.clone(), slot);
        true
    }

    async fn after_terminal(
        &self,
        slot: &Arc<RunSlot>,
        outcome: &RunOutcome,
        ended_at_ms: u64,
        persist: bool,
    ) {
        let (lifecycle, level) = match outcome.status {
            OutcomeStatus::Aborted => (Lifecycle::RunAborted, Level::INFO),
            OutcomeStatus::Errored => (Lifecycle::RunFinished, Level::WARN),
            OutcomeStatus::Completed => (Lifecycle::RunFinished, Level::INFO),
        };
        let parent = slot.state.lock().parent.clone();
        let mut record = LifecycleRecord::new(lifecycle)
            .run(&slot.key, &slot.run_id)
            .parent(parent.as_ref())
            .status(outcome.status.as_str());
        if let Some(error) = &outcome.error {
            record = record.detail(error.clone());
        }
        emit(level, record);

        let Some(parent) = parent else {
            return;
        };
        self.resume_parent_if_ready(&parent);
        if !persist {
            return;
        }
        if let Err(err) = self
            .inner
            .store
            .mark_ended(&slot.run_id, ended_at_ms, outcome.clone())
            .await
        {
            tracing::warn!(
                session_key = %slot.key,
                run_id = %slot.run_id,
                error = %err,
                "failed to record subagent completion"
            );
        }
    }

}

pub fn truncate_text(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out = input.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}
