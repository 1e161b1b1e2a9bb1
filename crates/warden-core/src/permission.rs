use serde::{Deserialize, Serialize};

use crate::ids::{PermissionId, SessionId, ToolCallId};

/// What a tool asks the gate to approve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreatePermissionRequest {
    pub session_id: SessionId,
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub action: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// An outstanding approval prompt. `path` is the resolved directory scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: PermissionId,
    pub session_id: SessionId,
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub action: String,
    pub path: String,
    pub description: String,
    pub params: serde_json::Value,
}

impl PermissionRequest {
    pub fn from_create(req: CreatePermissionRequest, resolved_path: String) -> Self {
        Self {
            id: PermissionId::new(),
            session_id: req.session_id,
            tool_call_id: req.tool_call_id,
            tool_name: req.tool_name,
            action: req.action,
            path: resolved_path,
            description: req.description,
            params: req.params,
        }
    }
}

/// How far a grant reaches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantScope {
    /// This request only.
    #[default]
    Once,
    /// Same tool, action and directory for the rest of the session.
    Persistent,
    /// Same tool and action anywhere for the rest of the session.
    Session,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionNotification {
    pub id: PermissionId,
    pub session_id: SessionId,
    pub tool_call_id: ToolCallId,
    pub granted: bool,
    pub denied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<GrantScope>,
}
