//! Runs one tool call end to end: record it, ask for approval, execute it in
//! the sandbox, and record the result.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use warden_core::delta::{DeltaPart, StreamDelta};
use warden_core::ids::{MessageId, SessionId, ToolCallId};
use warden_core::permission::CreatePermissionRequest;
use warden_core::tool_call::ToolCall;
use warden_core::{Broker, EventKind};

use crate::error::{EngineError, LedgerError, PermissionError, SandboxError};
use crate::ledger::ToolCallLedger;
use crate::permission::PermissionGate;
use crate::sandbox::Sandbox;

pub const DENIED_MESSAGE: &str = "permission denied";
pub const TIMED_OUT_MESSAGE: &str = "permission request timed out";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolRequest {
    Execute {
        command: String,
        working_dir: Option<String>,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    ListFiles {
        path: String,
    },
}

impl ToolRequest {
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Execute { .. } => "bash",
            Self::ReadFile { .. } => "read",
            Self::WriteFile { .. } => "write",
            Self::ListFiles { .. } => "ls",
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Execute { .. } => "execute",
            Self::ReadFile { .. } => "read",
            Self::WriteFile { .. } => "write",
            Self::ListFiles { .. } => "list",
        }
    }

    /// Path used to scope the approval.
    pub fn path(&self) -> &str {
        match self {
            Self::Execute { working_dir, .. } => working_dir.as_deref().unwrap_or(""),
            Self::ReadFile { path } | Self::WriteFile { path, .. } | Self::ListFiles { path } => {
                path
            }
        }
    }

    pub fn input(&self) -> serde_json::Value {
        match self {
            Self::Execute {
                command,
                working_dir,
            } => json!({ "command": command, "working_dir": working_dir }),
            Self::ReadFile { path } => json!({ "file_path": path }),
            Self::WriteFile { path, content } => json!({ "file_path": path, "content": content }),
            Self::ListFiles { path } => json!({ "path": path }),
        }
    }

    fn description(&self) -> String {
        match self {
            Self::Execute { command, .. } => format!("Run `{command}`"),
            Self::ReadFile { path } => format!("Read {path}"),
            Self::WriteFile { path, content } => {
                format!("Write {} bytes to {path}", content.len())
            }
            Self::ListFiles { path } => format!("List {path}"),
        }
    }
}

/// Where a tool call belongs and how it reports progress.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub cancel: CancellationToken,
    pub deltas: Broker<StreamDelta>,
}

impl ToolContext {
    pub fn emit(&self, part: DeltaPart) {
        self.deltas.publish(
            EventKind::Created,
            StreamDelta::new(self.session_id.clone(), self.message_id.clone(), part),
        );
    }
}

pub struct ToolInvoker {
    gate: Arc<PermissionGate>,
    ledger: Arc<ToolCallLedger>,
    sandbox: Arc<dyn Sandbox>,
}

impl ToolInvoker {
    pub fn new(
        gate: Arc<PermissionGate>,
        ledger: Arc<ToolCallLedger>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Self {
        Self {
            gate,
            ledger,
            sandbox,
        }
    }

    /// Returns the finished call. A denied call is finished as an error and
    /// is not a failure of the task; a cancelled task yields `Aborted`.
    #[instrument(skip(self, ctx, request), fields(session_id = %ctx.session_id, tool = request.tool_name()))]
    pub async fn invoke(
        &self,
        ctx: &ToolContext,
        request: ToolRequest,
    ) -> Result<ToolCall, EngineError> {
        let call = self
            .ledger
            .create(&ctx.session_id, &ctx.message_id, request.tool_name())?;
        ctx.emit(DeltaPart::ToolCallStarted {
            tool_call_id: call.id.clone(),
            tool_call_name: call.name.clone(),
        });

        let input = request.input();
        let raw_input = input.to_string();
        self.ledger.update_input(&call.id, &raw_input)?;
        ctx.emit(DeltaPart::ToolInput {
            tool_call_id: call.id.clone(),
            content: raw_input,
        });

        let approval = self
            .gate
            .request_approval(
                CreatePermissionRequest {
                    session_id: ctx.session_id.clone(),
                    tool_call_id: call.id.clone(),
                    tool_name: request.tool_name().to_string(),
                    action: request.action().to_string(),
                    path: request.path().to_string(),
                    description: request.description(),
                    params: input,
                },
                &ctx.cancel,
            )
            .await;

        match approval {
            Ok(true) => {}
            Ok(false) => return self.refuse(&call.id, DENIED_MESSAGE),
            Err(PermissionError::Timeout(_)) => return self.refuse(&call.id, TIMED_OUT_MESSAGE),
            Err(PermissionError::Cancelled) => {
                self.abandon(&call.id);
                return Err(EngineError::Aborted);
            }
        }

        let result = tokio::select! {
            result = self.run(&ctx.session_id, &request) => result,
            () = ctx.cancel.cancelled() => {
                self.abandon(&call.id);
                return Err(EngineError::Aborted);
            }
        };

        let finished = match result {
            Ok((output, failed)) => self.ledger.complete(&call.id, &output, failed, None)?,
            Err(e) => {
                let message = e.to_string();
                warn!(tool_call_id = %call.id, error = %message, "sandbox call failed");
                self.ledger
                    .complete(&call.id, &message, true, Some(&message))?
            }
        };
        info!(tool_call_id = %finished.id, status = %finished.status, "tool call finished");
        Ok(finished)
    }

    async fn run(
        &self,
        session_id: &SessionId,
        request: &ToolRequest,
    ) -> Result<(String, bool), SandboxError> {
        match request {
            ToolRequest::Execute {
                command,
                working_dir,
            } => {
                let out = self
                    .sandbox
                    .execute(session_id, command, working_dir.as_deref())
                    .await?;
                Ok((out.render(), out.exit_code != 0))
            }
            ToolRequest::ReadFile { path } => {
                Ok((self.sandbox.read_file(session_id, path).await?, false))
            }
            ToolRequest::WriteFile { path, content } => Ok((
                self.sandbox.write_file(session_id, path, content).await?,
                false,
            )),
            ToolRequest::ListFiles { path } => {
                let files = self.sandbox.list_files(session_id, path).await?;
                Ok((files.join("\n"), false))
            }
        }
    }

    fn refuse(&self, id: &ToolCallId, message: &str) -> Result<ToolCall, EngineError> {
        info!(tool_call_id = %id, reason = message, "tool call refused");
        Ok(self.ledger.complete(id, message, true, Some(message))?)
    }

    /// Mark the call cancelled. It may already be terminal if the whole
    /// session was cancelled first.
    fn abandon(&self, id: &ToolCallId) {
        match self.ledger.cancel(id) {
            Ok(_) | Err(LedgerError::InvalidTransition { .. }) | Err(LedgerError::NotFound(_)) => {}
            Err(e) => warn!(tool_call_id = %id, error = %e, "failed to cancel tool call"),
        }
    }
}
