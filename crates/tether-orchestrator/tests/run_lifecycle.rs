use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use tether_core::{ChannelListener, OrchestratorConfig, TranscriptStore};
use tether_orchestrator::testing::{ScriptedExecutor, Step};
use tether_orchestrator::{OrchestratorError, RunRegistry, StartRunParams};
use tether_subagents::{SubagentPaths, SubagentStore};
use tether_types::{
    EventPayload, MessageRole, OutcomeStatus, RunStatus, SessionKey, StreamItem, TranscriptMessage,
};

struct Harness {
    registry: RunRegistry,
    executor: Arc<ScriptedExecutor>,
    transcripts: Arc<TranscriptStore>,
    dir: std::path::PathBuf,
}

impl Harness {
    fn new(executor: ScriptedExecutor) -> Self {
        Self::with_config(executor, OrchestratorConfig::default())
    }

    fn with_config(executor: ScriptedExecutor, config: OrchestratorConfig) -> Self {
        let dir = std::env::temp_dir().join(format!("tether-orchestrator-{}", Uuid::new_v4()));
        let executor = Arc::new(executor);
        let transcripts = Arc::new(TranscriptStore::new(dir.join("transcripts")));
        let registry = RunRegistry::new(
            executor.clone(),
            transcripts.clone(),
            SubagentStore::new(SubagentPaths::new(dir.join("subagents"))),
            config,
        );
        Self {
            registry,
            executor,
            transcripts,
            dir,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn key(raw: &str) -> SessionKey {
    SessionKey::parse(raw).expect("key")
}

async fn wait_for_status(registry: &RunRegistry, key: &SessionKey, status: RunStatus) {
    let mut rx = registry.watch_status(key).expect("known run");
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == status))
        .await
        .expect("status in time")
        .expect("status channel");
}

async fn wait_for_events(registry: &RunRegistry, key: &SessionKey, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if registry.get_run(key).map(|r| r.event_count).unwrap_or(0) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("events in time");
}

async fn collect_until_terminal(rx: &mut mpsc::UnboundedReceiver<StreamItem>) -> Vec<StreamItem> {
    let mut items = Vec::new();
    loop {
        let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("item in time")
            .expect("stream open until terminal");
        let done = item.is_terminal();
        items.push(item);
        if done {
            return items;
        }
    }
}

/// User messages are written in the background; wait until `len` landed.
async fn read_transcript(harness: &Harness, key: &SessionKey, len: usize) -> Vec<TranscriptMessage> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let messages = harness.transcripts.read(key).await.expect("transcript");
            if messages.len() >= len {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("transcript in time")
}

fn texts(items: &[StreamItem]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| match item.as_event().map(|e| &e.payload) {
            Some(EventPayload::TextDelta { text }) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_admit_exactly_one_run() {
    let harness = Harness::new(ScriptedExecutor::new(vec![Step::Hang]));
    let session = key("agent:main:race");

    let mut handles = Vec::new();
    for idx in 0..16 {
        let registry = harness.registry.clone();
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            registry
                .start_run(&session, StartRunParams::new(format!("go {idx}")))
                .await
        }));
    }
    let mut accepted = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(run) => accepted.push(run.run_id),
            Err(OrchestratorError::AlreadyRunning { run_id, .. }) => {
                conflicts += 1;
                assert!(!run_id.is_empty());
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(accepted.len(), 1);
    assert_eq!(conflicts, 15);
    let active = harness.registry.get_active_run(&session).expect("active");
    assert_eq!(active.run_id, accepted[0]);
    harness.registry.shutdown().await;
}

#[tokio::test]
async fn end_to_end_replay_then_live_then_terminal() {
    let harness = Harness::new(ScriptedExecutor::new(vec![
        Step::text("Hi"),
        Step::text("there"),
        Step::gate("live"),
        Step::text("live"),
    ]));
    let session = key("agent:main:s1");
    harness
        .registry
        .start_run(&session, StartRunParams::new("hello"))
        .await
        .expect("start");
    wait_for_events(&harness.registry, &session, 2).await;

    let (listener, mut rx) = ChannelListener::pair();
    let sub = harness
        .registry
        .subscribe(&session, listener, true)
        .expect("subscribe");
    harness.executor.open_gate("live");

    let items = collect_until_terminal(&mut rx).await;
    assert_eq!(texts(&items), vec!["Hi", "there", "live"]);
    let seqs = items.iter().map(StreamItem::seq).collect::<Vec<_>>();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    match items.last() {
        Some(StreamItem::Terminal(marker)) => {
            assert_eq!(marker.outcome.status, OutcomeStatus::Completed)
        }
        other => panic!("expected terminal marker, got {other:?}"),
    }
    assert!(rx.recv().await.is_none());
    sub.unsubscribe();

    let run = harness.registry.get_run(&session).expect("retained");
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.ended_at_ms.is_some());
    assert!(!harness.registry.has_active_run(&session));

    let transcript = read_transcript(&harness, &session, 1).await;
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].text, "hello");
    assert_eq!(transcript[0].role, MessageRole::User);
}

#[tokio::test]
async fn late_subscriber_gets_history_and_marker() {
    let harness = Harness::new(ScriptedExecutor::new(vec![
        Step::text("a"),
        Step::text("b"),
    ]));
    let session = key("agent:main:late");
    harness
        .registry
        .start_run(&session, StartRunParams::new("x"))
        .await
        .expect("start");
    wait_for_status(&harness.registry, &session, RunStatus::Completed).await;

    let (listener, mut rx) = ChannelListener::pair();
    let sub = harness
        .registry
        .subscribe(&session, listener, true)
        .expect("subscribe");
    let items = collect_until_terminal(&mut rx).await;
    assert_eq!(texts(&items), vec!["a", "b"]);
    assert_eq!(items.len(), 3);
    assert!(!sub.is_active());
    sub.unsubscribe();

    let (listener, mut rx) = ChannelListener::pair();
    harness
        .registry
        .subscribe(&session, listener, false)
        .expect("subscribe");
    let items = collect_until_terminal(&mut rx).await;
    assert_eq!(items.len(), 1);

    assert!(harness
        .registry
        .subscribe(&key("agent:main:unknown"), ChannelListener::pair().0, true)
        .is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_terminates_exactly_once() {
    let harness = Harness::new(ScriptedExecutor::new(vec![Step::text("working"), Step::Hang]));
    let session = key("agent:main:abort");
    harness
        .registry
        .start_run(&session, StartRunParams::new("x"))
        .await
        .expect("start");
    wait_for_events(&harness.registry, &session, 1).await;

    let (listener, mut rx) = ChannelListener::pair();
    harness
        .registry
        .subscribe(&session, listener, true)
        .expect("subscribe");

    let first = {
        let registry = harness.registry.clone();
        let session = session.clone();
        tokio::spawn(async move { registry.abort_run(&session).await })
    };
    let second = {
        let registry = harness.registry.clone();
        let session = session.clone();
        tokio::spawn(async move { registry.abort_run(&session).await })
    };
    let results = [first.await.expect("join"), second.await.expect("join")];
    assert_eq!(results.iter().filter(|aborted| **aborted).count(), 1);

    let items = collect_until_terminal(&mut rx).await;
    let terminals = items.iter().filter(|item| item.is_terminal()).count();
    assert_eq!(terminals, 1);
    match items.last() {
        Some(StreamItem::Terminal(marker)) => {
            assert_eq!(marker.outcome.status, OutcomeStatus::Aborted)
        }
        other => panic!("expected terminal marker, got {other:?}"),
    }
    assert!(!harness.registry.abort_run(&session).await);
    assert!(!harness.registry.abort_run(&key("agent:main:nobody")).await);
}

#[tokio::test]
async fn executor_failure_errors_the_run() {
    let harness = Harness::new(ScriptedExecutor::new(vec![
        Step::text("partial"),
        Step::Fail("model exploded".to_string()),
    ]));
    let session = key("agent:main:fail");
    harness
        .registry
        .start_run(&session, StartRunParams::new("x"))
        .await
        .expect("start");
    wait_for_status(&harness.registry, &session, RunStatus::Errored).await;
    let run = harness.registry.get_run(&session).expect("run");
    let outcome = run.outcome.expect("outcome");
    assert_eq!(outcome.status, OutcomeStatus::Errored);
    assert_eq!(outcome.error.as_deref(), Some("model exploded"));

    let restarted = harness
        .registry
        .start_run(&session, StartRunParams::new("again"))
        .await;
    assert!(restarted.is_ok());
}

#[tokio::test]
async fn run_timeout_errors_the_run() {
    let config = OrchestratorConfig {
        run_timeout_secs: 1,
        ..OrchestratorConfig::default()
    };
    let harness = Harness::with_config(ScriptedExecutor::new(vec![Step::Hang]), config);
    let session = key("agent:main:slow");
    harness
        .registry
        .start_run(&session, StartRunParams::new("x"))
        .await
        .expect("start");
    wait_for_status(&harness.registry, &session, RunStatus::Errored).await;
    let outcome = harness
        .registry
        .get_run(&session)
        .and_then(|run| run.outcome)
        .expect("outcome");
    assert_eq!(outcome.error.as_deref(), Some("run timed out"));
}

#[tokio::test]
async fn follow_up_reaches_live_execution() {
    let harness = Harness::new(ScriptedExecutor::new(vec![Step::AwaitFollowUp]));
    let session = key("agent:main:chat");
    harness
        .registry
        .start_run(&session, StartRunParams::new("first"))
        .await
        .expect("start");

    let (listener, mut rx) = ChannelListener::pair();
    harness
        .registry
        .subscribe(&session, listener, true)
        .expect("subscribe");
    harness
        .registry
        .follow_up(&session, "more please")
        .await
        .expect("accepted");

    let items = collect_until_terminal(&mut rx).await;
    let payloads = items
        .iter()
        .filter_map(|item| item.as_event().map(|e| e.payload.clone()))
        .collect::<Vec<_>>();
    assert_eq!(
        payloads,
        vec![
            EventPayload::FollowUp {
                message: "more please".to_string()
            },
            EventPayload::text("ack: more please"),
        ]
    );

    let err = harness
        .registry
        .follow_up(&session, "too late")
        .await
        .expect_err("run is finished");
    assert!(matches!(err, OrchestratorError::NotRunning(_)));

    let transcript = read_transcript(&harness, &session, 2).await;
    let texts = transcript.iter().map(|m| m.text.as_str()).collect::<Vec<_>>();
    assert_eq!(texts, vec!["first", "more please"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_during_streaming_leaves_marker_last() {
    let harness = Harness::new(ScriptedExecutor::new(vec![Step::Stream]));
    let session = key("agent:main:stream");
    harness
        .registry
        .start_run(&session, StartRunParams::new("x"))
        .await
        .expect("start");

    let (listener, mut rx) = ChannelListener::pair();
    harness
        .registry
        .subscribe(&session, listener, true)
        .expect("subscribe");
    wait_for_events(&harness.registry, &session, 50).await;
    assert!(harness.registry.abort_run(&session).await);

    let items = collect_until_terminal(&mut rx).await;
    let (marker, events) = items.split_last().expect("items");
    let StreamItem::Terminal(marker) = marker else {
        panic!("expected terminal marker, got {marker:?}");
    };
    assert_eq!(marker.outcome.status, OutcomeStatus::Aborted);
    assert!(events.iter().all(|item| !item.is_terminal()));
    let seqs = events.iter().map(StreamItem::seq).collect::<Vec<_>>();
    let expected = (1..=events.len() as u64).collect::<Vec<_>>();
    assert_eq!(seqs, expected);
    assert_eq!(marker.seq, events.len() as u64 + 1);
    assert!(rx.recv().await.is_none());

    let settled = harness.registry.get_run(&session).expect("run").event_count;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let run = harness.registry.get_run(&session).expect("run");
    assert_eq!(run.event_count, settled);
    assert_eq!(run.event_count as u64, marker.seq - 1);
    assert_eq!(run.status, RunStatus::Aborted);
}

#[tokio::test]
async fn start_run_refuses_subagent_keys() {
    let harness = Harness::new(ScriptedExecutor::new(vec![Step::Hang]));
    let child = key("agent:main:main:subagent:loose");
    let err = harness
        .registry
        .start_run(&child, StartRunParams::new("x"))
        .await
        .expect_err("needs a parent");
    assert!(matches!(err, OrchestratorError::SubagentRequiresParent(_)));
    assert_eq!(err.code(), "SUBAGENT_REQUIRES_PARENT");

    let root = key("agent:main:plain");
    let params = StartRunParams {
        parent: Some(key("agent:main:main")),
        ..StartRunParams::new("x")
    };
    let err = harness
        .registry
        .start_run(&root, params)
        .await
        .expect_err("parent links go through the coordinator");
    assert!(matches!(err, OrchestratorError::SubagentRequiresParent(_)));
    assert!(harness.registry.get_run(&child).is_none());
    assert!(harness.registry.get_run(&root).is_none());
}
