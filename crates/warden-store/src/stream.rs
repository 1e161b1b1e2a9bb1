//! Durable per-session frame log backing replay on reconnect.
//!
//! `stream_heads` holds the last sequence number handed out for a session and
//! only resets on [`StreamRepo::clear`]; trimming or expiring entries never
//! rewinds it, so a client's last-seen sequence stays meaningful.

use rusqlite::OptionalExtension;
use tracing::instrument;

use warden_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    pub session_id: SessionId,
    pub seq: u64,
    pub frame_type: String,
    pub payload: String,
    pub created_at: i64,
}

pub struct StreamRepo {
    db: Database,
}

impl StreamRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a frame and return its sequence number. Entries beyond
    /// `max_len` for the session are evicted oldest-first.
    #[instrument(skip(self, payload), fields(session_id = %session_id, frame_type))]
    pub fn append(
        &self,
        session_id: &SessionId,
        frame_type: &str,
        payload: &str,
        now: i64,
        max_len: usize,
    ) -> Result<u64, StoreError> {
        self.db.with_tx(|tx| {
            let seq: i64 = tx.query_row(
                "INSERT INTO stream_heads (session_id, head) VALUES (?1, 1)
                 ON CONFLICT(session_id) DO UPDATE SET head = head + 1
                 RETURNING head",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO stream_entries (session_id, seq, frame_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![session_id.as_str(), seq, frame_type, payload, now],
            )?;
            let keep = i64::try_from(max_len).unwrap_or(i64::MAX);
            tx.execute(
                "DELETE FROM stream_entries WHERE session_id = ?1 AND seq <= ?2",
                rusqlite::params![session_id.as_str(), seq.saturating_sub(keep)],
            )?;
            Ok(seq as u64)
        })
    }

    /// Entries with `seq > after` created at or after `not_before`, in sequence order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn read_after(
        &self,
        session_id: &SessionId,
        after: u64,
        not_before: i64,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, seq, frame_type, payload, created_at FROM stream_entries
                 WHERE session_id = ?1 AND seq > ?2 AND created_at >= ?3
                 ORDER BY seq",
            )?;
            let after = i64::try_from(after).unwrap_or(i64::MAX);
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), after, not_before])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_entry(row)?);
            }
            Ok(results)
        })
    }

    /// Last sequence number assigned for the session, 0 if none.
    pub fn head(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let head: Option<i64> = conn
                .query_row(
                    "SELECT head FROM stream_heads WHERE session_id = ?1",
                    [session_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(head.unwrap_or(0) as u64)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn clear(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        self.db.with_tx(|tx| {
            let n = tx.execute(
                "DELETE FROM stream_entries WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM stream_heads WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            Ok(n)
        })
    }

    /// Drop entries created before `before`. Heads are kept.
    pub fn prune_before(&self, before: i64) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM stream_entries WHERE created_at < ?1", [before])?;
            Ok(n)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<StreamEntry, StoreError> {
    const T: &str = "stream_entries";
    let seq: i64 = row_helpers::get(row, 1, T, "seq")?;
    Ok(StreamEntry {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, T, "session_id")?),
        seq: seq as u64,
        frame_type: row_helpers::get(row, 2, T, "frame_type")?,
        payload: row_helpers::get(row, 3, T, "payload")?,
        created_at: row_helpers::get(row, 4, T, "created_at")?,
    })
}
