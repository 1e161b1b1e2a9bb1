use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, TaskId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default = "default_mime")]
    pub mime_type: String,
    pub content: String,
}

fn default_mime() -> String {
    "text/plain".to_string()
}

/// One user turn handed to the agent runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTask {
    pub session_id: SessionId,
    pub prompt: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Unix milliseconds.
    pub submitted_at: i64,
}

impl AgentTask {
    pub fn new(session_id: SessionId, prompt: impl Into<String>) -> Self {
        Self {
            session_id,
            prompt: prompt.into(),
            attachments: Vec::new(),
            submitted_at: crate::now_millis(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Failed,
    Canceled,
}

/// How a task ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed { error: String },
    TimedOut,
    Canceled,
    /// Still queued or running when the scheduler shut down.
    Shutdown,
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            Self::Completed => TaskState::Done,
            Self::Failed { .. } | Self::TimedOut => TaskState::Failed,
            Self::Canceled | Self::Shutdown => TaskState::Canceled,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
    pub timestamp: i64,
}

impl TaskEvent {
    pub fn transition(task_id: TaskId, session_id: SessionId, state: TaskState) -> Self {
        Self {
            task_id,
            session_id,
            state,
            outcome: None,
            timestamp: crate::now_millis(),
        }
    }

    pub fn finished(task_id: TaskId, session_id: SessionId, outcome: TaskOutcome) -> Self {
        Self {
            task_id,
            session_id,
            state: outcome.state(),
            outcome: Some(outcome),
            timestamp: crate::now_millis(),
        }
    }
}
