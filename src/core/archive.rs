//! Raw fetched payloads keyed by ID. Every write takes a fresh archive
//! sequence number so the projector can catch up from a watermark.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::models::{MessageId, MessagePayload, ReferencePayload, ThreadId};
use crate::error::StoreResult;

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS archive_messages (
    id INTEGER PRIMARY KEY,
    thread_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    archive_seq INTEGER NOT NULL,
    fetched_utc TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_archive_messages_thread
    ON archive_messages(thread_id, id);
CREATE INDEX IF NOT EXISTS idx_archive_messages_seq
    ON archive_messages(archive_seq);

CREATE TABLE IF NOT EXISTS archive_references (
    kind TEXT NOT NULL,
    id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    archive_seq INTEGER NOT NULL,
    fetched_utc TEXT NOT NULL,
    PRIMARY KEY (kind, id)
);

CREATE INDEX IF NOT EXISTS idx_archive_references_seq
    ON archive_references(archive_seq);

CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

INSERT OR IGNORE INTO counters (name, value) VALUES ('archive_seq', 0);
INSERT OR IGNORE INTO counters (name, value) VALUES ('projected_seq', 0);
INSERT OR IGNORE INTO counters (name, value) VALUES ('change_number', 0);

CREATE TABLE IF NOT EXISTS properties (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const LAST_FETCHED_KEY: &str = "last_fetched_utc";

pub(crate) fn bump_counter(conn: &Connection, name: &str) -> StoreResult<i64> {
    let value = conn.query_row(
        "UPDATE counters SET value = value + 1 WHERE name = ?1 RETURNING value",
        [name],
        |row| row.get(0),
    )?;
    Ok(value)
}

pub(crate) fn read_counter(conn: &Connection, name: &str) -> StoreResult<i64> {
    let value = conn.query_row(
        "SELECT value FROM counters WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(value)
}

pub(crate) fn write_counter(conn: &Connection, name: &str, value: i64) -> StoreResult<()> {
    conn.execute(
        "UPDATE counters SET value = ?2 WHERE name = ?1",
        params![name, value],
    )?;
    Ok(())
}

pub(crate) fn put_message(conn: &Connection, message: &MessagePayload, now: DateTime<Utc>) -> StoreResult<()> {
    let seq = bump_counter(conn, "archive_seq")?;
    conn.execute(
        "INSERT OR REPLACE INTO archive_messages (id, thread_id, payload, archive_seq, fetched_utc)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message.id,
            message.thread_id,
            serde_json::to_string(message)?,
            seq,
            now,
        ],
    )?;
    Ok(())
}

pub(crate) fn put_reference(conn: &Connection, reference: &ReferencePayload, now: DateTime<Utc>) -> StoreResult<()> {
    let seq = bump_counter(conn, "archive_seq")?;
    conn.execute(
        "INSERT OR REPLACE INTO archive_references (kind, id, payload, archive_seq, fetched_utc)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            reference.kind,
            reference.id,
            serde_json::to_string(reference)?,
            seq,
            now,
        ],
    )?;
    Ok(())
}

pub(crate) fn set_last_fetched(conn: &Connection, now: DateTime<Utc>) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO properties (key, value) VALUES (?1, ?2)",
        params![LAST_FETCHED_KEY, now.to_rfc3339()],
    )?;
    Ok(())
}

pub(crate) fn last_fetched(conn: &Connection) -> StoreResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM properties WHERE key = ?1",
            [LAST_FETCHED_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc)))
}

/// Highest archived message ID per thread; threads with nothing archived are
/// absent from the map.
pub(crate) fn highest_message_ids(
    conn: &Connection,
    thread_ids: &[ThreadId],
) -> StoreResult<HashMap<ThreadId, MessageId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT MAX(id) FROM archive_messages WHERE thread_id = ?1",
    )?;
    let mut out = HashMap::new();
    for &thread_id in thread_ids {
        let highest: Option<MessageId> = stmt.query_row([thread_id], |row| row.get(0))?;
        if let Some(id) = highest {
            out.insert(thread_id, id);
        }
    }
    Ok(out)
}

/// (archive_seq, kind, payload) for references written after `seq`.
pub(crate) fn references_since(conn: &Connection, seq: i64) -> StoreResult<Vec<(i64, String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT archive_seq, kind, payload FROM archive_references
         WHERE archive_seq > ?1 ORDER BY archive_seq",
    )?;
    let rows = stmt
        .query_map([seq], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// (archive_seq, payload) for messages written after `seq`.
pub(crate) fn messages_since(conn: &Connection, seq: i64) -> StoreResult<Vec<(i64, String)>> {
    let mut stmt = conn.prepare(
        "SELECT archive_seq, payload FROM archive_messages
         WHERE archive_seq > ?1 ORDER BY archive_seq",
    )?;
    let rows = stmt
        .query_map([seq], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn delete_thread_messages(conn: &Connection, thread_id: ThreadId) -> StoreResult<usize> {
    let n = conn.execute("DELETE FROM archive_messages WHERE thread_id = ?1", [thread_id])?;
    Ok(n)
}

pub(crate) fn message_count(conn: &Connection) -> StoreResult<i64> {
    let n = conn.query_row("SELECT COUNT(*) FROM archive_messages", [], |row| row.get(0))?;
    Ok(n)
}
