use thiserror::Error;

use tether_core::BufferClosed;
use tether_types::{SessionKey, SessionKeyError};

use crate::InvalidTransition;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("session {session_key} already has an active run {run_id}")]
    AlreadyRunning {
        session_key: SessionKey,
        run_id: String,
    },
    #[error("run buffer is closed")]
    BufferClosed,
    #[error("session {0} has no running execution")]
    NotRunning(SessionKey),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("subagent depth {depth} exceeds the limit of {max}")]
    DepthExceeded { depth: usize, max: usize },
    #[error(transparent)]
    InvalidKey(#[from] SessionKeyError),
    #[error("session {child} is not a subagent of {parent}")]
    ParentMismatch { child: SessionKey, parent: SessionKey },
    #[error("session {0} is a subagent and must be started under its parent")]
    SubagentRequiresParent(SessionKey),
    #[error("subagent registry write failed: {0}")]
    Storage(String),
}

impl From<BufferClosed> for OrchestratorError {
    fn from(_: BufferClosed) -> Self {
        OrchestratorError::BufferClosed
    }
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::AlreadyRunning { .. } => "SESSION_RUN_CONFLICT",
            OrchestratorError::BufferClosed => "BUFFER_CLOSED",
            OrchestratorError::NotRunning(_) => "NOT_RUNNING",
            OrchestratorError::InvalidTransition(_) => "INVALID_TRANSITION",
            OrchestratorError::DepthExceeded { .. } => "SUBAGENT_DEPTH_EXCEEDED",
            OrchestratorError::InvalidKey(_) => "INVALID_SESSION_KEY",
            OrchestratorError::ParentMismatch { .. } => "PARENT_MISMATCH",
            OrchestratorError::SubagentRequiresParent(_) => "SUBAGENT_REQUIRES_PARENT",
            OrchestratorError::Storage(_) => "STORAGE_ERROR",
        }
    }
}
