//! Inbound frame handling and disconnect cleanup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use warden_core::ids::{ConnectionId, SessionId};
use warden_core::task::AgentTask;
use warden_engine::{AgentScheduler, PermissionGate, ToolCallLedger};

use crate::buffer::DeliveryBuffer;
use crate::event_bridge::BridgeCommand;
use crate::protocol::{FrameType, InboundFrame, OutboundFrame};
use crate::router::{ConnectionRouter, DisconnectHandler, MessageHandler, SessionBinding};

pub struct SessionHandler {
    scheduler: Arc<AgentScheduler>,
    gate: Arc<PermissionGate>,
    ledger: Arc<ToolCallLedger>,
    buffer: Arc<DeliveryBuffer>,
    router: ConnectionRouter,
    bridge: mpsc::Sender<BridgeCommand>,
    disconnect_grace: Duration,
    cleanups: TaskTracker,
}

impl SessionHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Arc<AgentScheduler>,
        gate: Arc<PermissionGate>,
        ledger: Arc<ToolCallLedger>,
        buffer: Arc<DeliveryBuffer>,
        router: ConnectionRouter,
        bridge: mpsc::Sender<BridgeCommand>,
        disconnect_grace: Duration,
    ) -> Self {
        Self {
            scheduler,
            gate,
            ledger,
            buffer,
            router,
            bridge,
            disconnect_grace,
            cleanups: TaskTracker::new(),
        }
    }

    /// Pending disconnect cleanups, for shutdown.
    pub fn cleanups(&self) -> &TaskTracker {
        &self.cleanups
    }

    fn session_for(
        &self,
        explicit: Option<SessionId>,
        binding: &SessionBinding,
    ) -> Option<SessionId> {
        explicit.or_else(|| binding.current())
    }

    async fn command(&self, cmd: BridgeCommand) {
        if self.bridge.send(cmd).await.is_err() {
            warn!("event bridge is gone, dropping command");
        }
    }

    fn prompt(&self, session_id: SessionId, task: AgentTask, binding: &SessionBinding) {
        match self.scheduler.submit(task) {
            Ok(ticket) => {
                binding.reply(
                    OutboundFrame::for_session(
                        FrameType::TaskAccepted,
                        &session_id,
                        json!({ "task_id": ticket.task_id }),
                    )
                    .to_json(),
                );
            }
            Err(e) => {
                binding.reply(OutboundFrame::error(e.code(), e.to_string()).to_json());
            }
        }
    }

    /// Tear down everything the session owns.
    fn close_session(&self, session_id: &SessionId) {
        self.scheduler.cancel(session_id);
        let abandoned = self.gate.abandon_session(session_id);
        self.gate.forget_session(session_id);
        if let Err(e) = self.ledger.cancel_session(session_id) {
            warn!(session_id = %session_id, error = %e, "failed to cancel tool calls");
        }
        let deleted = match self.ledger.delete_session(session_id) {
            Ok(n) => n,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to delete tool calls");
                0
            }
        };
        self.buffer.clear(session_id);
        info!(session_id = %session_id, abandoned, deleted, "session closed");
    }
}

#[async_trait]
impl MessageHandler for SessionHandler {
    #[instrument(skip_all, fields(conn = %binding.connection_id()))]
    async fn handle(&self, raw: String, binding: SessionBinding) {
        let frame = match InboundFrame::parse(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "unparseable frame");
                binding.reply(OutboundFrame::error("bad_frame", e.to_string()).to_json());
                return;
            }
        };

        match frame {
            InboundFrame::Prompt {
                session_id,
                content,
                attachments,
            } => {
                let session_id = match self.session_for(session_id, &binding) {
                    Some(id) => id,
                    None => SessionId::new(),
                };
                if binding.current().as_ref() != Some(&session_id) {
                    binding.set(session_id.clone());
                    self.command(BridgeCommand::Attach {
                        conn: binding.connection_id().clone(),
                        session_id: session_id.clone(),
                    })
                    .await;
                }
                let task = AgentTask::new(session_id.clone(), content).with_attachments(attachments);
                self.prompt(session_id, task, &binding);
            }
            InboundFrame::PermissionResponse { id, granted, scope } => {
                if !self.gate.respond(&id, granted, scope) {
                    binding.reply(
                        OutboundFrame::error("unknown_permission", format!("no pending request {id}"))
                            .to_json(),
                    );
                }
            }
            InboundFrame::Attach { session_id } => {
                self.command(BridgeCommand::Attach {
                    conn: binding.connection_id().clone(),
                    session_id,
                })
                .await;
            }
            InboundFrame::Reconnect {
                session_id,
                last_seq,
            } => {
                self.command(BridgeCommand::Resume {
                    conn: binding.connection_id().clone(),
                    session_id,
                    last_seq,
                })
                .await;
            }
            InboundFrame::Cancel { session_id } => {
                let Some(session_id) = self.session_for(session_id, &binding) else {
                    binding.reply(OutboundFrame::error("no_session", "not attached to a session").to_json());
                    return;
                };
                if !self.scheduler.cancel(&session_id) {
                    debug!(session_id = %session_id, "nothing to cancel");
                }
            }
            InboundFrame::AutoApprove { session_id } => {
                let Some(session_id) = self.session_for(session_id, &binding) else {
                    binding.reply(OutboundFrame::error("no_session", "not attached to a session").to_json());
                    return;
                };
                self.gate.auto_approve_session(&session_id);
            }
            InboundFrame::CloseSession { session_id } => {
                let Some(session_id) = self.session_for(session_id, &binding) else {
                    binding.reply(OutboundFrame::error("no_session", "not attached to a session").to_json());
                    return;
                };
                self.close_session(&session_id);
            }
        }
    }
}

impl DisconnectHandler for SessionHandler {
    fn on_disconnect(&self, conn: ConnectionId, session_id: Option<SessionId>) {
        let Some(session_id) = session_id else {
            return;
        };
        let router = self.router.clone();
        let scheduler = Arc::clone(&self.scheduler);
        let gate = Arc::clone(&self.gate);
        let ledger = Arc::clone(&self.ledger);
        let grace = self.disconnect_grace;

        self.cleanups.spawn(async move {
            tokio::time::sleep(grace).await;
            if router.has_session(&session_id) {
                debug!(conn = %conn, session_id = %session_id, "session reattached, keeping agent");
                return;
            }
            let cancelled = scheduler.cancel(&session_id);
            let abandoned = gate.abandon_session(&session_id);
            let tool_calls = match ledger.cancel_session(&session_id) {
                Ok(n) => n,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "failed to cancel tool calls");
                    0
                }
            };
            info!(
                conn = %conn,
                session_id = %session_id,
                cancelled,
                abandoned,
                tool_calls,
                "session left without a connection"
            );
        });
    }
}
