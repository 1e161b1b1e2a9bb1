use std::time::Duration;

use warden_core::ids::ToolCallId;
use warden_core::tool_call::ToolCallStatus;
use warden_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool call not found: {0}")]
    NotFound(ToolCallId),

    #[error("tool call {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ToolCallId,
        from: ToolCallStatus,
        to: ToolCallStatus,
    },
}

/// Why the scheduler refused a task. Callers surface these to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("task queue is full")]
    QueueFull,

    #[error("session already has an active task")]
    SessionBusy,

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::SessionBusy => "session_busy",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// An approval wait that ended without a decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionError {
    #[error("permission request abandoned")]
    Cancelled,

    #[error("permission request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox transport error: {0}")]
    Transport(String),

    #[error("sandbox returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("sandbox error: {0}")]
    Remote(String),

    #[error("invalid sandbox response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for SandboxError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SandboxError::Decode(e.to_string())
        } else {
            SandboxError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("{0}")]
    Sandbox(#[from] SandboxError),

    #[error("agent aborted")]
    Aborted,

    #[error("run timeout after {0:?}")]
    RunTimeout(Duration),

    #[error("{0}")]
    Internal(String),
}
