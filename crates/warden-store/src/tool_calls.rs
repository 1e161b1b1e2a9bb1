use tracing::instrument;

use warden_core::ids::{MessageId, SessionId, ToolCallId};
use warden_core::tool_call::{ToolCall, ToolCallStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const COLUMNS: &str = "id, session_id, message_id, name, input, status, result, is_error,
                       error_message, created_at, updated_at, started_at, finished_at";

/// Only these rows accept writes; terminal rows are never touched.
const OPEN_STATUSES: &str = "('pending', 'running')";

/// Row-level access to `tool_calls`. Mutations return the affected row count
/// so callers can tell a guarded no-op from a write.
pub struct ToolCallRepo {
    db: Database,
}

impl ToolCallRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, call), fields(tool_call_id = %call.id, session_id = %call.session_id))]
    pub fn insert(&self, call: &ToolCall) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_calls (id, session_id, message_id, name, input, status, result,
                                         is_error, error_message, created_at, updated_at,
                                         started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    call.id.as_str(),
                    call.session_id.as_str(),
                    call.message_id.as_str(),
                    call.name,
                    call.input,
                    call.status.as_str(),
                    call.result,
                    call.is_error,
                    call.error_message,
                    call.created_at,
                    call.updated_at,
                    call.started_at,
                    call.finished_at,
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(tool_call_id = %id))]
    pub fn get(&self, id: &ToolCallId) -> Result<ToolCall, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM tool_calls WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_tool_call(row),
                None => Err(StoreError::NotFound(format!("tool call {id}"))),
            }
        })
    }

    /// All calls of a session, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_by_session(&self, session_id: &SessionId) -> Result<Vec<ToolCall>, StoreError> {
        self.query_list(
            &format!("SELECT {COLUMNS} FROM tool_calls WHERE session_id = ?1 ORDER BY created_at, rowid"),
            session_id.as_str(),
        )
    }

    #[instrument(skip(self), fields(message_id = %message_id))]
    pub fn list_by_message(&self, message_id: &MessageId) -> Result<Vec<ToolCall>, StoreError> {
        self.query_list(
            &format!("SELECT {COLUMNS} FROM tool_calls WHERE message_id = ?1 ORDER BY created_at, rowid"),
            message_id.as_str(),
        )
    }

    /// Pending and running calls of a session.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_open(&self, session_id: &SessionId) -> Result<Vec<ToolCall>, StoreError> {
        self.query_list(
            &format!(
                "SELECT {COLUMNS} FROM tool_calls
                 WHERE session_id = ?1 AND status IN {OPEN_STATUSES}
                 ORDER BY created_at, rowid"
            ),
            session_id.as_str(),
        )
    }

    /// Record tool input and move the call to running.
    #[instrument(skip(self, input), fields(tool_call_id = %id))]
    pub fn update_input(&self, id: &ToolCallId, input: &str, now: i64) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                &format!(
                    "UPDATE tool_calls
                     SET input = ?2, status = 'running', started_at = COALESCE(started_at, ?3), updated_at = ?3
                     WHERE id = ?1 AND status IN {OPEN_STATUSES}"
                ),
                rusqlite::params![id.as_str(), input, now],
            )?;
            Ok(n)
        })
    }

    /// Move a pending call to running. Terminal states are reached only
    /// through `complete` and `cancel`.
    #[instrument(skip(self), fields(tool_call_id = %id))]
    pub fn mark_running(&self, id: &ToolCallId, now: i64) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                &format!(
                    "UPDATE tool_calls
                     SET status = 'running', started_at = COALESCE(started_at, ?2), updated_at = ?2
                     WHERE id = ?1 AND status IN {OPEN_STATUSES}"
                ),
                rusqlite::params![id.as_str(), now],
            )?;
            Ok(n)
        })
    }

    /// Finish a running call. Pending calls are left alone.
    #[instrument(skip(self, result, error_message), fields(tool_call_id = %id, is_error))]
    pub fn complete(
        &self,
        id: &ToolCallId,
        result: &str,
        is_error: bool,
        error_message: Option<&str>,
        now: i64,
    ) -> Result<usize, StoreError> {
        let status = if is_error {
            ToolCallStatus::Error
        } else {
            ToolCallStatus::Completed
        };
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE tool_calls
                 SET status = ?2, result = ?3, is_error = ?4, error_message = ?5,
                     finished_at = ?6, updated_at = ?6
                 WHERE id = ?1 AND status = 'running'",
                rusqlite::params![id.as_str(), status.as_str(), result, is_error, error_message, now],
            )?;
            Ok(n)
        })
    }

    #[instrument(skip(self), fields(tool_call_id = %id))]
    pub fn cancel(&self, id: &ToolCallId, now: i64) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                &format!(
                    "UPDATE tool_calls SET status = 'cancelled', finished_at = ?2, updated_at = ?2
                     WHERE id = ?1 AND status IN {OPEN_STATUSES}"
                ),
                rusqlite::params![id.as_str(), now],
            )?;
            Ok(n)
        })
    }

    /// Bulk-cancel every open call of a session.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn cancel_session(&self, session_id: &SessionId, now: i64) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                &format!(
                    "UPDATE tool_calls SET status = 'cancelled', finished_at = ?2, updated_at = ?2
                     WHERE session_id = ?1 AND status IN {OPEN_STATUSES}"
                ),
                rusqlite::params![session_id.as_str(), now],
            )?;
            Ok(n)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn delete_session(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM tool_calls WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            Ok(n)
        })
    }

    fn query_list(&self, sql: &str, key: &str) -> Result<Vec<ToolCall>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query([key])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_tool_call(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_tool_call(row: &rusqlite::Row<'_>) -> Result<ToolCall, StoreError> {
    const T: &str = "tool_calls";
    let status: String = row_helpers::get(row, 5, T, "status")?;
    Ok(ToolCall {
        id: ToolCallId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, T, "session_id")?),
        message_id: MessageId::from_raw(row_helpers::get::<String>(row, 2, T, "message_id")?),
        name: row_helpers::get(row, 3, T, "name")?,
        input: row_helpers::get(row, 4, T, "input")?,
        status: row_helpers::parse_enum(&status, T, "status")?,
        result: row_helpers::get(row, 6, T, "result")?,
        is_error: row_helpers::get(row, 7, T, "is_error")?,
        error_message: row_helpers::get(row, 8, T, "error_message")?,
        created_at: row_helpers::get(row, 9, T, "created_at")?,
        updated_at: row_helpers::get(row, 10, T, "updated_at")?,
        started_at: row_helpers::get(row, 11, T, "started_at")?,
        finished_at: row_helpers::get(row, 12, T, "finished_at")?,
    })
}
