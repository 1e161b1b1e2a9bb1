//! Incremental message updates streamed to clients.

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId, ToolCallId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "delta_type", rename_all = "snake_case")]
pub enum DeltaPart {
    Text {
        content: String,
    },
    Reasoning {
        content: String,
    },
    ToolInput {
        tool_call_id: ToolCallId,
        content: String,
    },
    ToolCallStarted {
        tool_call_id: ToolCallId,
        tool_call_name: String,
    },
    Finish {
        finish_reason: String,
    },
    Error {
        content: String,
    },
}

impl DeltaPart {
    pub fn delta_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolInput { .. } => "tool_input",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::Finish { .. } => "finish",
            Self::Error { .. } => "error",
        }
    }

    pub fn tool_call_id(&self) -> Option<&ToolCallId> {
        match self {
            Self::ToolInput { tool_call_id, .. } | Self::ToolCallStarted { tool_call_id, .. } => {
                Some(tool_call_id)
            }
            Self::Text { .. } | Self::Reasoning { .. } | Self::Finish { .. } | Self::Error { .. } => {
                None
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDelta {
    pub message_id: MessageId,
    pub session_id: SessionId,
    /// Unix milliseconds.
    pub timestamp: i64,
    #[serde(flatten)]
    pub part: DeltaPart,
}

impl StreamDelta {
    pub fn new(session_id: SessionId, message_id: MessageId, part: DeltaPart) -> Self {
        Self {
            message_id,
            session_id,
            timestamp: crate::now_millis(),
            part,
        }
    }

    pub fn text(session_id: SessionId, message_id: MessageId, content: impl Into<String>) -> Self {
        Self::new(
            session_id,
            message_id,
            DeltaPart::Text {
                content: content.into(),
            },
        )
    }

    pub fn finish(session_id: SessionId, message_id: MessageId, reason: impl Into<String>) -> Self {
        Self::new(
            session_id,
            message_id,
            DeltaPart::Finish {
                finish_reason: reason.into(),
            },
        )
    }

    pub fn error(session_id: SessionId, message_id: MessageId, content: impl Into<String>) -> Self {
        Self::new(
            session_id,
            message_id,
            DeltaPart::Error {
                content: content.into(),
            },
        )
    }
}
