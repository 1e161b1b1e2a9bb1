//! Engine events to client frames.
//!
//! One task owns every write into the delivery buffer and never waits on a
//! client. A resuming connection is hidden from live session delivery while
//! a separate task streams the buffered frames to it at the client's pace.
//! Once that task has caught up it hands the connection back, and the bridge
//! sends whatever was appended in between and switches the connection to
//! live delivery. Appends and the switch happen on the same task, so the
//! client sees every frame once and in order.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_core::delta::StreamDelta;
use warden_core::ids::{ConnectionId, SessionId};
use warden_core::permission::{PermissionNotification, PermissionRequest};
use warden_core::task::TaskEvent;
use warden_core::tool_call::ToolCall;
use warden_core::{Event, EventKind};
use warden_engine::PermissionGate;
use warden_store::StreamEntry;

use crate::buffer::{DeliveryBuffer, Replay};
use crate::protocol::{FrameType, OutboundFrame};
use crate::router::ConnectionRouter;

const REPLAY_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Free send-queue slots a replaying connection needs before it goes live.
const HANDOFF_HEADROOM: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeCommand {
    /// Bind a connection to a session and announce the current head.
    Attach {
        conn: ConnectionId,
        session_id: SessionId,
    },
    /// Bind and replay everything after `last_seq`.
    Resume {
        conn: ConnectionId,
        session_id: SessionId,
        last_seq: u64,
    },
}

/// A replay that has caught up and is ready for live delivery.
#[derive(Debug)]
struct Handoff {
    conn: ConnectionId,
    session_id: SessionId,
    /// Last sequence number already sent.
    sent: u64,
    from: u64,
    gap: bool,
}

pub struct BridgeSources {
    pub deltas: broadcast::Receiver<Event<StreamDelta>>,
    pub tool_calls: broadcast::Receiver<Event<ToolCall>>,
    pub requests: broadcast::Receiver<Event<PermissionRequest>>,
    pub notifications: broadcast::Receiver<Event<PermissionNotification>>,
    pub tasks: broadcast::Receiver<Event<TaskEvent>>,
}

pub struct EventBridge {
    router: ConnectionRouter,
    buffer: Arc<DeliveryBuffer>,
    gate: Arc<PermissionGate>,
}

enum Step<T> {
    Event(Event<T>),
    Skip,
    Closed,
}

fn step<T>(result: Result<Event<T>, RecvError>, source: &'static str) -> Step<T> {
    match result {
        Ok(event) => Step::Event(event),
        Err(RecvError::Lagged(n)) => {
            warn!(source, skipped = n, "event bridge lagged, dropped events");
            Step::Skip
        }
        Err(RecvError::Closed) => {
            info!(source, "event source closed");
            Step::Closed
        }
    }
}

impl EventBridge {
    pub fn new(
        router: ConnectionRouter,
        buffer: Arc<DeliveryBuffer>,
        gate: Arc<PermissionGate>,
    ) -> Self {
        Self {
            router,
            buffer,
            gate,
        }
    }

    pub fn start(
        self,
        sources: BridgeSources,
        commands: mpsc::Receiver<BridgeCommand>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(sources, commands, cancel))
    }

    async fn run(
        self,
        mut sources: BridgeSources,
        mut commands: mpsc::Receiver<BridgeCommand>,
        cancel: CancellationToken,
    ) {
        let (handoff_tx, mut handoffs) = mpsc::channel::<Handoff>(64);
        loop {
            let closed = tokio::select! {
                biased;
                () = cancel.cancelled() => true,
                Some(handoff) = handoffs.recv() => {
                    self.go_live(handoff);
                    false
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        self.handle_command(cmd, &handoff_tx);
                        false
                    }
                    None => true,
                },
                ev = sources.deltas.recv() => match step(ev, "deltas") {
                    Step::Event(ev) => {
                        let delta = ev.payload;
                        let session_id = delta.session_id.clone();
                        self.publish(FrameType::Delta, &session_id, to_value(&delta));
                        false
                    }
                    Step::Skip => false,
                    Step::Closed => true,
                },
                ev = sources.tool_calls.recv() => match step(ev, "tool_calls") {
                    Step::Event(ev) => {
                        self.publish_tool_call(ev);
                        false
                    }
                    Step::Skip => false,
                    Step::Closed => true,
                },
                ev = sources.requests.recv() => match step(ev, "permission_requests") {
                    Step::Event(ev) => {
                        let req = ev.payload;
                        let frame = OutboundFrame::for_session(
                            FrameType::PermissionRequest,
                            &req.session_id,
                            to_value(&req),
                        );
                        self.router.send_to_session(&req.session_id, &frame.to_json());
                        false
                    }
                    Step::Skip => false,
                    Step::Closed => true,
                },
                ev = sources.notifications.recv() => match step(ev, "permission_notifications") {
                    Step::Event(ev) => {
                        let note = ev.payload;
                        self.publish(FrameType::PermissionNotification, &note.session_id, to_value(&note));
                        false
                    }
                    Step::Skip => false,
                    Step::Closed => true,
                },
                ev = sources.tasks.recv() => match step(ev, "tasks") {
                    Step::Event(ev) => {
                        let task = ev.payload;
                        self.publish(FrameType::Task, &task.session_id, to_value(&task));
                        false
                    }
                    Step::Skip => false,
                    Step::Closed => true,
                },
            };
            if closed {
                break;
            }
        }
        debug!("event bridge stopped");
    }

    fn publish_tool_call(&self, event: Event<ToolCall>) {
        let session_id = event.payload.session_id.clone();
        let payload = json!({ "event": event.kind, "tool_call": event.payload });
        if event.kind == EventKind::Deleted {
            // The session's log is being cleared; deletions are live only.
            let frame = OutboundFrame::for_session(FrameType::ToolCall, &session_id, payload);
            self.router.send_to_session(&session_id, &frame.to_json());
        } else {
            self.publish(FrameType::ToolCall, &session_id, payload);
        }
    }

    /// Sequence the frame, store it, and push it to attached connections.
    fn publish(&self, frame_type: FrameType, session_id: &SessionId, payload: Value) {
        let seq = if frame_type.is_buffered() {
            self.buffer
                .append(session_id, frame_type.as_str(), &payload.to_string())
        } else {
            None
        };
        let frame = OutboundFrame::for_session(frame_type, session_id, payload).with_seq(seq);
        self.router.send_to_session(session_id, &frame.to_json());
    }

    fn handle_command(&self, cmd: BridgeCommand, handoff: &mpsc::Sender<Handoff>) {
        match cmd {
            BridgeCommand::Attach { conn, session_id } => {
                if !self.router.set_session(&conn, session_id.clone()) {
                    return;
                }
                let attached = OutboundFrame::for_session(
                    FrameType::Attached,
                    &session_id,
                    json!({ "head": self.buffer.head(&session_id), "buffered": self.buffer.is_enabled() }),
                );
                if self.router.send_to(&conn, attached.to_json()) {
                    self.resend_active(&conn, &session_id);
                }
            }
            BridgeCommand::Resume {
                conn,
                session_id,
                last_seq,
            } => {
                let Some(tx) = self.router.begin_replay(&conn, session_id.clone()) else {
                    debug!(conn = %conn, "resume ignored, connection gone or already replaying");
                    return;
                };
                let replay = self.buffer.replay(&session_id, last_seq);
                info!(
                    conn = %conn,
                    session_id = %session_id,
                    from = replay.from,
                    to = replay.to,
                    count = replay.entries.len(),
                    "resuming session"
                );
                let job = ReplayJob {
                    router: self.router.clone(),
                    buffer: Arc::clone(&self.buffer),
                    tx,
                    conn,
                    session_id,
                };
                tokio::spawn(job.run(replay, handoff.clone()));
            }
        }
    }

    /// Finish a replay: send what was appended since the replay task's last
    /// read, re-prompt any open approval, and resume live delivery.
    fn go_live(&self, h: Handoff) {
        let mut to = h.sent;
        for entry in self.buffer.entries_after(&h.session_id, h.sent) {
            let seq = entry.seq;
            if let Some(frame) = rebuild(entry) {
                if !self.router.send_to(&h.conn, frame.to_json()) {
                    return;
                }
            }
            to = seq;
        }
        if !self.resend_active(&h.conn, &h.session_id) {
            return;
        }
        let to = to.max(self.buffer.head(&h.session_id));
        let done = OutboundFrame::for_session(
            FrameType::ReplayComplete,
            &h.session_id,
            json!({ "from": h.from, "to": to, "gap": h.gap }),
        );
        if self.router.send_to(&h.conn, done.to_json()) {
            self.router.finish_replay(&h.conn);
            debug!(conn = %h.conn, session_id = %h.session_id, to, "replay complete");
        }
    }

    fn resend_active(&self, conn: &ConnectionId, session_id: &SessionId) -> bool {
        match self.gate.active_request(session_id) {
            Some(req) => {
                let frame =
                    OutboundFrame::for_session(FrameType::PermissionRequest, session_id, to_value(&req));
                self.router.send_to(conn, frame.to_json())
            }
            None => true,
        }
    }
}

/// Streams buffered frames to one connection off the bridge task.
struct ReplayJob {
    router: ConnectionRouter,
    buffer: Arc<DeliveryBuffer>,
    tx: mpsc::Sender<String>,
    conn: ConnectionId,
    session_id: SessionId,
}

impl ReplayJob {
    async fn run(self, replay: Replay, handoff: mpsc::Sender<Handoff>) {
        let mut sent = replay.from.saturating_sub(1);
        let mut batch = replay.entries;
        while !batch.is_empty() {
            for entry in batch {
                let seq = entry.seq;
                if let Some(frame) = rebuild(entry) {
                    if !self.push(frame).await {
                        return;
                    }
                }
                sent = seq;
            }
            batch = self.buffer.entries_after(&self.session_id, sent);
        }

        // The bridge finishes with non-blocking sends, so leave it room.
        let headroom = HANDOFF_HEADROOM.min(self.tx.max_capacity());
        match tokio::time::timeout(REPLAY_SEND_TIMEOUT, self.tx.reserve_many(headroom)).await {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_)) => {
                self.router.remove(&self.conn, "connection closed");
                return;
            }
            Err(_) => {
                self.router.remove(&self.conn, "replay stalled");
                return;
            }
        }

        let ready = Handoff {
            conn: self.conn,
            session_id: self.session_id,
            sent,
            from: replay.from,
            gap: replay.gap,
        };
        if handoff.send(ready).await.is_err() {
            debug!("event bridge stopped before replay finished");
        }
    }

    /// Wait for queue space rather than evicting. A client that stops
    /// reading is dropped.
    async fn push(&self, frame: OutboundFrame) -> bool {
        match tokio::time::timeout(REPLAY_SEND_TIMEOUT, self.tx.send(frame.to_json())).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                self.router.remove(&self.conn, "connection closed");
                false
            }
            Err(_) => {
                self.router.remove(&self.conn, "replay stalled");
                false
            }
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn rebuild(entry: StreamEntry) -> Option<OutboundFrame> {
    let frame_type = FrameType::parse(&entry.frame_type)?;
    let payload = match serde_json::from_str(&entry.payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(seq = entry.seq, error = %e, "skipping unreadable buffered frame");
            return None;
        }
    };
    Some(OutboundFrame::new(frame_type, Some(entry.session_id), payload).with_seq(Some(entry.seq)))
}
