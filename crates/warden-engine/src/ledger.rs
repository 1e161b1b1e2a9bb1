//! Durable tool-call lifecycle.
//!
//! ```text
//! pending --update_input / update_status(running)--> running
//! running --complete(is_error = false)--> completed
//! running --complete(is_error = true)---> error
//! pending | running --cancel--> cancelled
//! ```
//!
//! Every write is guarded in SQL by the source states it may leave, then the
//! row is read back and published. Subscribers therefore only ever see state
//! that is in the store, and a write against a terminal row surfaces as
//! [`LedgerError::InvalidTransition`] instead of reviving it.

use tokio::sync::broadcast;
use tracing::debug;

use warden_core::ids::{MessageId, SessionId, ToolCallId};
use warden_core::now_millis;
use warden_core::tool_call::{ToolCall, ToolCallStatus};
use warden_core::{Broker, Event, EventKind};
use warden_store::{Database, StoreError, ToolCallRepo};

use crate::error::LedgerError;

pub struct ToolCallLedger {
    repo: ToolCallRepo,
    events: Broker<ToolCall>,
}

impl ToolCallLedger {
    pub fn new(db: Database) -> Self {
        Self::with_broker(db, Broker::default())
    }

    pub fn with_broker(db: Database, events: Broker<ToolCall>) -> Self {
        Self {
            repo: ToolCallRepo::new(db),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event<ToolCall>> {
        self.events.subscribe()
    }

    pub fn create(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        name: &str,
    ) -> Result<ToolCall, LedgerError> {
        let call = ToolCall::new(session_id.clone(), message_id.clone(), name);
        self.repo.insert(&call)?;
        let stored = self.get(&call.id)?;
        self.events.publish(EventKind::Created, stored.clone());
        Ok(stored)
    }

    pub fn get(&self, id: &ToolCallId) -> Result<ToolCall, LedgerError> {
        self.repo.get(id).map_err(|e| match e {
            StoreError::NotFound(_) => LedgerError::NotFound(id.clone()),
            other => LedgerError::Store(other),
        })
    }

    pub fn list_by_session(&self, session_id: &SessionId) -> Result<Vec<ToolCall>, LedgerError> {
        Ok(self.repo.list_by_session(session_id)?)
    }

    pub fn list_by_message(&self, message_id: &MessageId) -> Result<Vec<ToolCall>, LedgerError> {
        Ok(self.repo.list_by_message(message_id)?)
    }

    /// Pending and running calls of a session.
    pub fn list_pending(&self, session_id: &SessionId) -> Result<Vec<ToolCall>, LedgerError> {
        Ok(self.repo.list_open(session_id)?)
    }

    /// Record the tool input and mark the call running.
    pub fn update_input(&self, id: &ToolCallId, input: &str) -> Result<ToolCall, LedgerError> {
        let rows = self.repo.update_input(id, input, now_millis())?;
        self.settle(id, ToolCallStatus::Running, rows)
    }

    /// Only `running` moves a call forward. A `pending` target is a no-op
    /// on a pending call. Terminal states are reached through
    /// [`complete`](Self::complete) and [`cancel`](Self::cancel).
    pub fn update_status(
        &self,
        id: &ToolCallId,
        status: ToolCallStatus,
    ) -> Result<ToolCall, LedgerError> {
        if status != ToolCallStatus::Running {
            let current = self.get(id)?;
            if status == ToolCallStatus::Pending && current.status == ToolCallStatus::Pending {
                return Ok(current);
            }
            return Err(LedgerError::InvalidTransition {
                id: id.clone(),
                from: current.status,
                to: status,
            });
        }
        let rows = self.repo.mark_running(id, now_millis())?;
        self.settle(id, status, rows)
    }

    /// Finish a running call with its result.
    pub fn complete(
        &self,
        id: &ToolCallId,
        result: &str,
        is_error: bool,
        error_message: Option<&str>,
    ) -> Result<ToolCall, LedgerError> {
        let to = if is_error {
            ToolCallStatus::Error
        } else {
            ToolCallStatus::Completed
        };
        let rows = self
            .repo
            .complete(id, result, is_error, error_message, now_millis())?;
        self.settle(id, to, rows)
    }

    pub fn cancel(&self, id: &ToolCallId) -> Result<ToolCall, LedgerError> {
        let rows = self.repo.cancel(id, now_millis())?;
        self.settle(id, ToolCallStatus::Cancelled, rows)
    }

    /// Cancel every open call of a session and publish one event per call.
    ///
    /// The bulk update reports only a row count, so the open calls are read
    /// first and the published rows carry a locally stamped time that can
    /// differ slightly from the persisted one.
    pub fn cancel_session(&self, session_id: &SessionId) -> Result<usize, LedgerError> {
        let open = self.repo.list_open(session_id)?;
        if open.is_empty() {
            return Ok(0);
        }

        let now = now_millis();
        let rows = self.repo.cancel_session(session_id, now)?;
        debug!(session_id = %session_id, snapshot = open.len(), rows, "cancelled open tool calls");

        for mut call in open {
            call.status = ToolCallStatus::Cancelled;
            call.finished_at = Some(now);
            call.updated_at = now_millis();
            self.events.publish(EventKind::Updated, call);
        }
        Ok(rows)
    }

    /// Physically remove a session's calls. Publishes a `Deleted` event per row.
    pub fn delete_session(&self, session_id: &SessionId) -> Result<usize, LedgerError> {
        let existing = self.repo.list_by_session(session_id)?;
        let rows = self.repo.delete_session(session_id)?;
        for call in existing {
            self.events.publish(EventKind::Deleted, call);
        }
        Ok(rows)
    }

    /// Read back after a guarded write. Zero rows means the guard refused.
    fn settle(
        &self,
        id: &ToolCallId,
        to: ToolCallStatus,
        rows: usize,
    ) -> Result<ToolCall, LedgerError> {
        let current = self.get(id)?;
        if rows == 0 {
            return Err(LedgerError::InvalidTransition {
                id: id.clone(),
                from: current.status,
                to,
            });
        }
        self.events.publish(EventKind::Updated, current.clone());
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> ToolCallLedger {
        ToolCallLedger::new(Database::in_memory().unwrap())
    }

    fn drain(rx: &mut broadcast::Receiver<Event<ToolCall>>) -> Vec<Event<ToolCall>> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn happy_path_publishes_each_transition() {
        let ledger = ledger();
        let mut rx = ledger.subscribe();
        let session = SessionId::new();

        let call = ledger.create(&session, &MessageId::new(), "bash").unwrap();
        let running = ledger.update_input(&call.id, r#"{"command":"ls"}"#).unwrap();
        assert_eq!(running.status, ToolCallStatus::Running);
        assert!(running.started_at.is_some());

        let done = ledger.complete(&call.id, "a\nb", false, None).unwrap();
        assert_eq!(done.status, ToolCallStatus::Completed);
        assert!(done.finished_at.is_some());

        let events = drain(&mut rx);
        let kinds: Vec<_> = events.iter().map(|e| (e.kind, e.payload.status)).collect();
        assert_eq!(
            kinds,
            vec![
                (EventKind::Created, ToolCallStatus::Pending),
                (EventKind::Updated, ToolCallStatus::Running),
                (EventKind::Updated, ToolCallStatus::Completed),
            ]
        );
        assert_eq!(events[2].payload, done);
    }

    #[test]
    fn complete_with_error_lands_in_error_state() {
        let ledger = ledger();
        let call = ledger.create(&SessionId::new(), &MessageId::new(), "bash").unwrap();
        ledger.update_status(&call.id, ToolCallStatus::Running).unwrap();
        let failed = ledger
            .complete(&call.id, "", true, Some("permission denied"))
            .unwrap();
        assert_eq!(failed.status, ToolCallStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("permission denied"));
    }

    #[test]
    fn complete_from_pending_is_rejected() {
        let ledger = ledger();
        let call = ledger.create(&SessionId::new(), &MessageId::new(), "bash").unwrap();
        let err = ledger.complete(&call.id, "x", false, None).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidTransition {
                from: ToolCallStatus::Pending,
                to: ToolCallStatus::Completed,
                ..
            }
        ));
    }

    #[test]
    fn terminal_calls_never_change_or_publish() {
        let ledger = ledger();
        let call = ledger.create(&SessionId::new(), &MessageId::new(), "bash").unwrap();
        ledger.cancel(&call.id).unwrap();
        let mut rx = ledger.subscribe();

        assert!(ledger.update_input(&call.id, "late").is_err());
        assert!(ledger.update_status(&call.id, ToolCallStatus::Running).is_err());
        assert!(ledger.complete(&call.id, "late", false, None).is_err());
        assert!(ledger.cancel(&call.id).is_err());
        assert!(ledger.update_status(&call.id, ToolCallStatus::Pending).is_err());

        assert!(drain(&mut rx).is_empty());
        let stored = ledger.get(&call.id).unwrap();
        assert_eq!(stored.status, ToolCallStatus::Cancelled);
        assert_eq!(stored.input, "");
    }

    #[test]
    fn update_status_cannot_finish_a_call() {
        let ledger = ledger();
        let call = ledger.create(&SessionId::new(), &MessageId::new(), "bash").unwrap();
        let mut rx = ledger.subscribe();

        for target in [
            ToolCallStatus::Completed,
            ToolCallStatus::Error,
            ToolCallStatus::Cancelled,
        ] {
            assert!(matches!(
                ledger.update_status(&call.id, target),
                Err(LedgerError::InvalidTransition { from: ToolCallStatus::Pending, .. })
            ));
        }
        assert!(drain(&mut rx).is_empty());

        ledger.update_status(&call.id, ToolCallStatus::Running).unwrap();
        assert!(ledger.update_status(&call.id, ToolCallStatus::Completed).is_err());
        let stored = ledger.get(&call.id).unwrap();
        assert_eq!(stored.status, ToolCallStatus::Running);
        assert!(stored.finished_at.is_none());
    }

    #[test]
    fn pending_target_on_pending_call_is_a_noop() {
        let ledger = ledger();
        let call = ledger.create(&SessionId::new(), &MessageId::new(), "read").unwrap();
        let mut rx = ledger.subscribe();
        let same = ledger.update_status(&call.id, ToolCallStatus::Pending).unwrap();
        assert_eq!(same.status, ToolCallStatus::Pending);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn missing_call_is_not_found() {
        let ledger = ledger();
        assert!(matches!(
            ledger.cancel(&ToolCallId::new()),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn cancel_session_publishes_one_event_per_open_call() {
        let ledger = ledger();
        let session = SessionId::new();
        let message = MessageId::new();
        let pending = ledger.create(&session, &message, "read").unwrap();
        let running = ledger.create(&session, &message, "bash").unwrap();
        ledger.update_input(&running.id, "{}").unwrap();
        let finished = ledger.create(&session, &message, "ls").unwrap();
        ledger.update_input(&finished.id, "{}").unwrap();
        ledger.complete(&finished.id, "ok", false, None).unwrap();

        let mut rx = ledger.subscribe();
        assert_eq!(ledger.cancel_session(&session).unwrap(), 2);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        let ids: Vec<_> = events.iter().map(|e| e.payload.id.clone()).collect();
        assert!(ids.contains(&pending.id));
        assert!(ids.contains(&running.id));
        assert!(events
            .iter()
            .all(|e| e.payload.status == ToolCallStatus::Cancelled && e.payload.finished_at.is_some()));
        assert_eq!(
            ledger.get(&finished.id).unwrap().status,
            ToolCallStatus::Completed
        );
    }

    #[test]
    fn cancel_session_without_open_calls_emits_nothing() {
        let ledger = ledger();
        let session = SessionId::new();
        let call = ledger.create(&session, &MessageId::new(), "bash").unwrap();
        ledger.cancel(&call.id).unwrap();

        let mut rx = ledger.subscribe();
        assert_eq!(ledger.cancel_session(&session).unwrap(), 0);
        assert_eq!(ledger.cancel_session(&SessionId::new()).unwrap(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn delete_session_publishes_deleted() {
        let ledger = ledger();
        let session = SessionId::new();
        ledger.create(&session, &MessageId::new(), "bash").unwrap();
        ledger.create(&session, &MessageId::new(), "read").unwrap();

        let mut rx = ledger.subscribe();
        assert_eq!(ledger.delete_session(&session).unwrap(), 2);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Deleted));
        assert!(ledger.list_by_session(&session).unwrap().is_empty());
    }

    #[test]
    fn failed_write_publishes_nothing() {
        let db = Database::in_memory().unwrap();
        let ledger = ToolCallLedger::new(db.clone());
        let call = ledger.create(&SessionId::new(), &MessageId::new(), "bash").unwrap();
        db.with_conn(|conn| {
            conn.execute("DROP TABLE tool_calls", [])?;
            Ok(())
        })
        .unwrap();

        let mut rx = ledger.subscribe();
        assert!(matches!(
            ledger.update_input(&call.id, "{}"),
            Err(LedgerError::Store(_))
        ));
        assert!(drain(&mut rx).is_empty());
    }
}
