use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tether_types::{RunStatus, SessionKey};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Target every lifecycle record is written under, so log filters can pick
/// run bookkeeping apart from free-form diagnostics.
pub const LIFECYCLE_TARGET: &str = "tether.lifecycle";
const LOG_FILE_PREFIX: &str = "tether.engine";

/// Run and hierarchy milestones worth a structured log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    RunStarted,
    RunFinished,
    RunAborted,
    RunFollowUp,
    SubagentRegistered,
    SubagentReconciled,
    ParentWaiting,
    ParentResumed,
    LoggingInitialized,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::RunStarted => "run.started",
            Lifecycle::RunFinished => "run.finished",
            Lifecycle::RunAborted => "run.aborted",
            Lifecycle::RunFollowUp => "run.follow_up",
            Lifecycle::SubagentRegistered => "subagent.registered",
            Lifecycle::SubagentReconciled => "subagent.reconciled",
            Lifecycle::ParentWaiting => "parent.waiting",
            Lifecycle::ParentResumed => "parent.resumed",
            Lifecycle::LoggingInitialized => "logging.initialized",
        }
    }
}

/// One lifecycle line. Built with [`LifecycleRecord::new`] and the setters,
/// then handed to [`emit`].
#[derive(Debug, Clone)]
pub struct LifecycleRecord<'a> {
    pub lifecycle: Lifecycle,
    pub session: Option<&'a SessionKey>,
    pub run_id: Option<&'a str>,
    pub parent: Option<&'a SessionKey>,
    pub status: Option<&'a str>,
    pub detail: Option<String>,
}

impl<'a> LifecycleRecord<'a> {
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle,
            session: None,
            run_id: None,
            parent: None,
            status: None,
            detail: None,
        }
    }

    pub fn run(mut self, session: &'a SessionKey, run_id: &'a str) -> Self {
        self.session = Some(session);
        self.run_id = Some(run_id);
        self
    }

    pub fn parent(mut self, parent: Option<&'a SessionKey>) -> Self {
        self.parent = parent;
        self
    }

    pub fn status(mut self, status: &'a str) -> Self {
        self.status = Some(status);
        self
    }

    pub fn run_status(self, status: RunStatus) -> Self {
        self.status(status.as_str())
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn role(&self) -> &'static str {
        self.session.map(|key| key.role().as_str()).unwrap_or("")
    }

    fn depth(&self) -> u64 {
        self.session.map(|key| key.depth() as u64).unwrap_or(0)
    }
}

macro_rules! lifecycle_line {
    ($level:expr, $record:expr) => {
        tracing::event!(
            target: LIFECYCLE_TARGET,
            $level,
            event = $record.lifecycle.as_str(),
            session_key = $record.session.map(SessionKey::as_str).unwrap_or(""),
            role = $record.role(),
            depth = $record.depth(),
            run_id = $record.run_id.unwrap_or(""),
            parent_key = $record.parent.map(SessionKey::as_str).unwrap_or(""),
            status = $record.status.unwrap_or(""),
            detail = $record.detail.as_deref().unwrap_or(""),
            "lifecycle"
        )
    };
}

pub fn emit(level: Level, record: LifecycleRecord<'_>) {
    match level {
        Level::ERROR => lifecycle_line!(Level::ERROR, record),
        Level::WARN => lifecycle_line!(Level::WARN, record),
        Level::DEBUG | Level::TRACE => lifecycle_line!(Level::DEBUG, record),
        _ => lifecycle_line!(Level::INFO, record),
    }
}

/// Replaces user text with its length and a short fingerprint so inputs can
/// be correlated across lines without landing in the log files.
pub fn redact_input(text: &str) -> String {
    use std::hash::{Hash, Hasher};

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    trimmed.hash(&mut hasher);
    format!(
        "[input chars={} fp={:08x}]",
        trimmed.chars().count(),
        hasher.finish() as u32
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub logs_dir: String,
    pub file_prefix: String,
    pub retention_days: u64,
    pub removed_files: usize,
    pub initialized_at: DateTime<Utc>,
}

/// Console plus daily JSONL files under `logs_dir`, dropping files older than
/// `retention_days` first. The guard must live as long as the process.
pub fn init_engine_logging(
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let removed_files = prune_log_files(logs_dir, retention_days, Utc::now().date_naive())?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok((
        guard,
        LoggingInitInfo {
            logs_dir: logs_dir.display().to_string(),
            file_prefix: LOG_FILE_PREFIX.to_string(),
            retention_days,
            removed_files,
            initialized_at: Utc::now(),
        },
    ))
}

/// Deletes `tether.engine.<date>.jsonl` files dated before the retention
/// window ending at `today`. Returns how many were removed.
fn prune_log_files(logs_dir: &Path, retention_days: u64, today: NaiveDate) -> anyhow::Result<usize> {
    let Some(cutoff) = today.checked_sub_days(chrono::Days::new(retention_days)) else {
        return Ok(0);
    };
    let mut removed = 0;
    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(log_file_date)
        else {
            continue;
        };
        if date < cutoff && path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn log_file_date(name: &str) -> Option<NaiveDate> {
    let date = name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_prefix('.')?
        .strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

pub fn logs_dir_for(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}
