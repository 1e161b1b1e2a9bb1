//! The agent seam: what the scheduler runs for each accepted task.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use warden_core::delta::{DeltaPart, StreamDelta};
use warden_core::ids::{MessageId, TaskId};
use warden_core::task::AgentTask;
use warden_core::Broker;

use crate::error::EngineError;
use crate::tools::{ToolContext, ToolInvoker, ToolRequest};

/// Per-run handles passed to the runtime.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub task_id: TaskId,
    /// Fired on user cancel, timeout or forced shutdown.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run(&self, ctx: RunContext, task: AgentTask) -> Result<(), EngineError>;
}

/// Model-free runtime that treats the prompt as a single tool command.
pub struct DirectRuntime {
    invoker: Arc<ToolInvoker>,
    deltas: Broker<StreamDelta>,
}

impl DirectRuntime {
    pub fn new(invoker: Arc<ToolInvoker>, deltas: Broker<StreamDelta>) -> Self {
        Self { invoker, deltas }
    }
}

#[async_trait]
impl AgentRuntime for DirectRuntime {
    #[instrument(skip_all, fields(task_id = %ctx.task_id, session_id = %task.session_id))]
    async fn run(&self, ctx: RunContext, task: AgentTask) -> Result<(), EngineError> {
        let tool_ctx = ToolContext {
            session_id: task.session_id.clone(),
            message_id: MessageId::new(),
            cancel: ctx.cancel,
            deltas: self.deltas.clone(),
        };

        let result = self.turn(&tool_ctx, task).await;
        match &result {
            Ok(()) => tool_ctx.emit(DeltaPart::Finish {
                finish_reason: "stop".into(),
            }),
            Err(EngineError::Aborted) => tool_ctx.emit(DeltaPart::Finish {
                finish_reason: "canceled".into(),
            }),
            Err(e) => {
                tool_ctx.emit(DeltaPart::Error {
                    content: e.to_string(),
                });
                tool_ctx.emit(DeltaPart::Finish {
                    finish_reason: "error".into(),
                });
            }
        }
        result
    }
}

impl DirectRuntime {
    async fn turn(&self, ctx: &ToolContext, task: AgentTask) -> Result<(), EngineError> {
        for attachment in task
            .attachments
            .into_iter()
            .filter(|a| a.mime_type.starts_with("text/"))
        {
            debug!(name = %attachment.name, "writing attachment");
            self.invoker
                .invoke(
                    ctx,
                    ToolRequest::WriteFile {
                        path: attachment.name,
                        content: attachment.content,
                    },
                )
                .await?;
        }

        let call = self.invoker.invoke(ctx, parse_command(&task.prompt)).await?;
        if !call.result.is_empty() {
            ctx.emit(DeltaPart::Text {
                content: call.result,
            });
        }
        Ok(())
    }
}

/// `read <path>`, `ls [path]`, `write <path>\n<body>`, anything else is shell.
pub fn parse_command(prompt: &str) -> ToolRequest {
    let prompt = prompt.trim_start();
    let (head, body) = match prompt.split_once('\n') {
        Some((head, body)) => (head.trim_end(), Some(body)),
        None => (prompt.trim_end(), None),
    };
    let (verb, arg) = match head.split_once(char::is_whitespace) {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (head, ""),
    };

    match (verb, body) {
        ("read", None) if !arg.is_empty() => ToolRequest::ReadFile { path: arg.into() },
        ("ls", None) => ToolRequest::ListFiles {
            path: if arg.is_empty() { ".".into() } else { arg.into() },
        },
        ("write", Some(body)) if !arg.is_empty() => ToolRequest::WriteFile {
            path: arg.into(),
            content: body.to_string(),
        },
        _ => ToolRequest::Execute {
            command: prompt.trim_end().to_string(),
            working_dir: None,
        },
    }
}
