//! JSON frames exchanged over the client socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use warden_core::ids::{PermissionId, SessionId};
use warden_core::permission::GrantScope;
use warden_core::task::Attachment;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Delta,
    ToolCall,
    PermissionRequest,
    PermissionNotification,
    Task,
    TaskAccepted,
    Attached,
    ReplayComplete,
    Error,
}

impl FrameType {
    /// Frames that are sequenced and kept for replay.
    pub fn is_buffered(self) -> bool {
        matches!(
            self,
            Self::Delta | Self::ToolCall | Self::PermissionNotification | Self::Task
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delta => "delta",
            Self::ToolCall => "tool_call",
            Self::PermissionRequest => "permission_request",
            Self::PermissionNotification => "permission_notification",
            Self::Task => "task",
            Self::TaskAccepted => "task_accepted",
            Self::Attached => "attached",
            Self::ReplayComplete => "replay_complete",
            Self::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub payload: Value,
}

impl OutboundFrame {
    pub fn new(frame_type: FrameType, session_id: Option<SessionId>, payload: Value) -> Self {
        Self {
            frame_type,
            session_id,
            seq: None,
            payload,
        }
    }

    pub fn for_session(frame_type: FrameType, session_id: &SessionId, payload: Value) -> Self {
        Self::new(frame_type, Some(session_id.clone()), payload)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            FrameType::Error,
            None,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }

    pub fn with_seq(mut self, seq: Option<u64>) -> Self {
        self.seq = seq;
        self
    }

    pub fn to_json(&self) -> String {
        // Every field is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Client requests.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Prompt {
        #[serde(default)]
        session_id: Option<SessionId>,
        content: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    PermissionResponse {
        id: PermissionId,
        granted: bool,
        #[serde(default)]
        scope: GrantScope,
    },
    Cancel {
        #[serde(default)]
        session_id: Option<SessionId>,
    },
    Attach {
        session_id: SessionId,
    },
    Reconnect {
        session_id: SessionId,
        #[serde(default)]
        last_seq: u64,
    },
    AutoApprove {
        #[serde(default)]
        session_id: Option<SessionId>,
    },
    CloseSession {
        #[serde(default)]
        session_id: Option<SessionId>,
    },
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
