//! Outbound message queue, the core's only outbound contract.
//!
//! The core writes rows with `status = completed`; the external chat
//! component polls them, renders to the user, and transitions each row to
//! `sent` exactly once (or `failed` with a reason).

use chrono::Utc;
use rusqlite::params;
use std::str::FromStr;

use super::{parse_ts, ts, OptionalExt, SqliteStore};
use crate::types::{OutboundId, OutboundKind, OutboundMessage, OutboundStatus, StoreError};

const OUTBOUND_COLUMNS: &str =
    "id, kind, user_external_id, payload_text, status, result_text, created_at, updated_at";

impl SqliteStore {
    /// Enqueue a deliverable for the external chat component.
    pub async fn enqueue_outbound(
        &self,
        kind: OutboundKind,
        user_external_id: &str,
        payload_text: &str,
    ) -> Result<OutboundId, StoreError> {
        let conn = self.conn.lock().await;
        insert_outbound_conn(&conn, kind, user_external_id, payload_text)
    }

    /// Rows ready for delivery: `status = completed ∧ id > last_seen`,
    /// ascending by id.
    pub async fn poll_completed_outbound(
        &self,
        last_seen: OutboundId,
    ) -> Result<Vec<OutboundMessage>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTBOUND_COLUMNS} FROM outbound_message
             WHERE status = 'completed' AND id > ?1
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![last_seen], row_to_outbound)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row??);
        }
        Ok(messages)
    }

    pub async fn get_outbound(
        &self,
        id: OutboundId,
    ) -> Result<Option<OutboundMessage>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {OUTBOUND_COLUMNS} FROM outbound_message WHERE id = ?1"),
                params![id],
                row_to_outbound,
            )
            .optional()?;
        row.transpose()
    }

    /// completed → sent, exactly once. Returns false when the row was not
    /// in `completed`, making duplicate acknowledgments harmless.
    pub async fn mark_outbound_sent(&self, id: OutboundId) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE outbound_message SET status = 'sent', updated_at = ?1
             WHERE id = ?2 AND status = 'completed'",
            params![ts(Utc::now()), id],
        )?;
        Ok(rows > 0)
    }

    pub async fn mark_outbound_failed(
        &self,
        id: OutboundId,
        error: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE outbound_message
             SET status = 'failed', result_text = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'completed'",
            params![error, ts(Utc::now()), id],
        )?;
        Ok(rows > 0)
    }
}

/// Insert inside an open transaction (used by `complete_cycle` so the
/// notification lands atomically with the status flip).
pub(super) fn insert_outbound(
    tx: &rusqlite::Transaction<'_>,
    kind: OutboundKind,
    user_external_id: &str,
    payload_text: &str,
) -> Result<OutboundId, StoreError> {
    insert_outbound_conn(tx, kind, user_external_id, payload_text)
}

fn insert_outbound_conn(
    conn: &rusqlite::Connection,
    kind: OutboundKind,
    user_external_id: &str,
    payload_text: &str,
) -> Result<OutboundId, StoreError> {
    let now = ts(Utc::now());
    conn.execute(
        "INSERT INTO outbound_message
             (kind, user_external_id, payload_text, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'completed', ?4, ?4)",
        params![kind.as_str(), user_external_id, payload_text, now],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_outbound(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<OutboundMessage, StoreError>> {
    let id: i64 = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let user_external_id: String = row.get(2)?;
    let payload_text: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let result_text: Option<String> = row.get(5)?;
    let created_str: String = row.get(6)?;
    let updated_str: String = row.get(7)?;

    Ok((|| -> Result<OutboundMessage, StoreError> {
        Ok(OutboundMessage {
            id,
            kind: OutboundKind::from_str(&kind_str).map_err(StoreError::Serialization)?,
            user_external_id,
            payload_text,
            status: OutboundStatus::from_str(&status_str).map_err(StoreError::Serialization)?,
            result_text,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
        })
    })())
}
