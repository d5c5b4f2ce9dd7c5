//! Deterministic executor for exercising the registry without a real agent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use tether_types::{EventPayload, SessionKey};

use crate::{Executor, RunContext};

#[derive(Debug, Clone)]
pub enum Step {
    Emit(EventPayload),
    Sleep(Duration),
    SpawnSubagent { task: String, label: Option<String> },
    WaitForSubagents,
    /// Waits for the next follow-up and echoes it as `ack: <message>`.
    AwaitFollowUp,
    /// Blocks until [`ScriptedExecutor::open_gate`] is called with this name.
    Gate(String),
    Fail(String),
    /// Emits numbered text deltas until the run stops accepting events.
    Stream,
    /// Never finishes on its own.
    Hang,
}

impl Step {
    pub fn text(text: impl Into<String>) -> Self {
        Step::Emit(EventPayload::text(text))
    }

    pub fn spawn(task: impl Into<String>) -> Self {
        Step::SpawnSubagent {
            task: task.into(),
            label: None,
        }
    }

    pub fn gate(name: impl Into<String>) -> Self {
        Step::Gate(name.into())
    }
}

/// Runs a script chosen by the run's input text, falling back to a default.
pub struct ScriptedExecutor {
    default_script: Vec<Step>,
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    gates: Mutex<HashMap<String, Arc<watch::Sender<bool>>>>,
    spawned: Mutex<Vec<SessionKey>>,
    started: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(default_script: Vec<Step>) -> Self {
        Self {
            default_script,
            scripts: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            spawned: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
        }
    }

    pub fn with_script(self, input: impl Into<String>, steps: Vec<Step>) -> Self {
        self.scripts.lock().insert(input.into(), steps);
        self
    }

    pub fn open_gate(&self, name: &str) {
        self.gate_sender(name).send_replace(true);
    }

    pub fn spawned(&self) -> Vec<SessionKey> {
        self.spawned.lock().clone()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn gate_sender(&self, name: &str) -> Arc<watch::Sender<bool>> {
        self.gates
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(watch::channel(false).0))
            .clone()
    }

    fn script_for(&self, input: &str) -> Vec<Step> {
        self.scripts
            .lock()
            .get(input)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, mut ctx: RunContext) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let script = self.script_for(&ctx.input);
        let mut follow_ups = ctx.take_follow_ups();
        for step in script {
            match step {
                Step::Emit(payload) => {
                    ctx.emit(payload)?;
                }
                Step::Sleep(duration) => tokio::time::sleep(duration).await,
                Step::SpawnSubagent { task, label } => {
                    let child = ctx.spawn_subagent(task, label).await?;
                    self.spawned.lock().push(child);
                }
                Step::WaitForSubagents => {
                    ctx.wait_for_subagents().await;
                }
                Step::AwaitFollowUp => {
                    let Some(message) = follow_ups.recv().await else {
                        anyhow::bail!("follow-up channel closed");
                    };
                    ctx.emit(EventPayload::text(format!("ack: {message}")))?;
                }
                Step::Gate(name) => {
                    let mut rx = self.gate_sender(&name).subscribe();
                    rx.wait_for(|open| *open).await?;
                }
                Step::Fail(message) => anyhow::bail!(message),
                Step::Stream => {
                    let mut n = 0u64;
                    while ctx.emit(EventPayload::text(format!("delta {n}"))).is_ok() {
                        n += 1;
                        tokio::task::yield_now().await;
                    }
                    return Ok(());
                }
                Step::Hang => std::future::pending::<()>().await,
            }
        }
        Ok(())
    }
}
