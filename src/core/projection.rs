//! Deterministic projection of archived payloads into queryable rows.
//!
//! The projector consumes archive rows above its watermark. References are
//! projected before messages because a message writes users as a side effect
//! and must never clobber a complete user record with partial like/notify
//! information.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;

use crate::core::archive;
use crate::core::models::{GroupId, MessageId, ThreadId, UserId};
use crate::core::rows::{
    ConversationRow, GroupPrivacy, GroupRow, GroupStateRow, MessageKind, MessageRow,
    MessageStateRow, ProjectionDelta, ThreadRow, ThreadStateRow, UserRow,
};
use crate::error::{StoreError, StoreResult};

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    full_name TEXT,
    job_title TEXT,
    mugshot_url TEXT,
    is_partial INTEGER NOT NULL DEFAULT 0,
    change_number INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS groups (
    id INTEGER PRIMARY KEY,
    full_name TEXT NOT NULL,
    privacy TEXT NOT NULL,
    change_number INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS group_states (
    group_id INTEGER PRIMARY KEY,
    show_in_sidebar INTEGER NOT NULL DEFAULT 1,
    last_viewed_utc TEXT,
    change_number INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS threads (
    id INTEGER PRIMARY KEY,
    group_id INTEGER,
    reported_message_count INTEGER,
    change_number INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS thread_states (
    thread_id INTEGER PRIMARY KEY,
    followed INTEGER NOT NULL DEFAULT 0,
    last_seen_message_id INTEGER,
    change_number INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    thread_id INTEGER PRIMARY KEY,
    participant_ids TEXT NOT NULL,
    change_number INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    thread_id INTEGER NOT NULL,
    group_id INTEGER,
    sender_id INTEGER NOT NULL,
    replied_to_id INTEGER,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL,
    kind TEXT NOT NULL,
    likes_count INTEGER NOT NULL DEFAULT 0,
    liked_by TEXT NOT NULL,
    notified_ids TEXT NOT NULL,
    change_number INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, id);

CREATE TABLE IF NOT EXISTS message_states (
    message_id INTEGER PRIMARY KEY,
    read INTEGER NOT NULL DEFAULT 0,
    starred INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    change_number INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS removed_messages (
    message_id INTEGER PRIMARY KEY,
    change_number INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_cn ON users(change_number);
CREATE INDEX IF NOT EXISTS idx_groups_cn ON groups(change_number);
CREATE INDEX IF NOT EXISTS idx_group_states_cn ON group_states(change_number);
CREATE INDEX IF NOT EXISTS idx_threads_cn ON threads(change_number);
CREATE INDEX IF NOT EXISTS idx_thread_states_cn ON thread_states(change_number);
CREATE INDEX IF NOT EXISTS idx_conversations_cn ON conversations(change_number);
CREATE INDEX IF NOT EXISTS idx_messages_cn ON messages(change_number);
CREATE INDEX IF NOT EXISTS idx_message_states_cn ON message_states(change_number);
CREATE INDEX IF NOT EXISTS idx_removed_messages_cn ON removed_messages(change_number);
";

/// Outcome of one projector pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionReport {
    pub projected: usize,
    /// Records skipped because they carry values this build does not
    /// understand. They are not retried.
    pub protocol_errors: Vec<String>,
}

// -- typed views of archived payloads ----------------------------------------

#[derive(Debug, Deserialize)]
struct UserRecord {
    id: UserId,
    full_name: Option<String>,
    job_title: Option<String>,
    mugshot_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GroupRecord {
    id: GroupId,
    full_name: String,
    privacy: GroupPrivacy,
}

#[derive(Debug, Default, Deserialize)]
struct ThreadStats {
    messages_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ThreadRecord {
    id: ThreadId,
    group_id: Option<GroupId>,
    #[serde(default)]
    stats: ThreadStats,
}

#[derive(Debug, Deserialize)]
struct ConversationRecord {
    id: ThreadId,
    #[serde(default)]
    participant_ids: Vec<UserId>,
}

#[derive(Debug, Default, Deserialize)]
struct Body {
    #[serde(default)]
    plain: String,
}

#[derive(Debug, Deserialize)]
struct LikedByName {
    user_id: UserId,
    full_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LikedBy {
    #[serde(default)]
    count: i64,
    #[serde(default)]
    names: Vec<LikedByName>,
}

#[derive(Debug, Deserialize)]
struct MessageRecord {
    id: MessageId,
    thread_id: ThreadId,
    group_id: Option<GroupId>,
    sender_id: UserId,
    replied_to_id: Option<MessageId>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    body: Body,
    #[serde(default)]
    message_type: MessageKind,
    #[serde(default)]
    liked_by: LikedBy,
    #[serde(default)]
    notified_user_ids: Vec<UserId>,
}

fn parse<'a, T: Deserialize<'a>>(what: &str, payload: &'a str) -> StoreResult<T> {
    serde_json::from_str(payload).map_err(|e| StoreError::Protocol(format!("{what}: {e}")))
}

fn next_change(conn: &Connection) -> StoreResult<i64> {
    archive::bump_counter(conn, "change_number")
}

// -- projection of single records ---------------------------------------------

fn project_user(conn: &Connection, payload: &str) -> StoreResult<()> {
    let user: UserRecord = parse("user", payload)?;
    let cn = next_change(conn)?;
    conn.execute(
        "INSERT OR REPLACE INTO users (id, full_name, job_title, mugshot_url, is_partial, change_number)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![user.id, user.full_name, user.job_title, user.mugshot_url, cn],
    )?;
    Ok(())
}

/// Best-effort user from a like or notification; never replaces a row.
fn ensure_partial_user(conn: &Connection, id: UserId, full_name: Option<&str>) -> StoreResult<()> {
    let exists = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |_| Ok(()))
        .optional()?
        .is_some();
    if exists {
        return Ok(());
    }
    let cn = next_change(conn)?;
    conn.execute(
        "INSERT INTO users (id, full_name, is_partial, change_number) VALUES (?1, ?2, 1, ?3)",
        params![id, full_name, cn],
    )?;
    Ok(())
}

fn project_group(conn: &Connection, payload: &str) -> StoreResult<()> {
    let group: GroupRecord = parse("group", payload)?;
    let cn = next_change(conn)?;
    conn.execute(
        "INSERT OR REPLACE INTO groups (id, full_name, privacy, change_number) VALUES (?1, ?2, ?3, ?4)",
        params![group.id, group.full_name, group.privacy.as_str(), cn],
    )?;
    Ok(())
}

fn project_thread(conn: &Connection, payload: &str) -> StoreResult<()> {
    let thread: ThreadRecord = parse("thread", payload)?;
    let cn = next_change(conn)?;
    conn.execute(
        "INSERT OR REPLACE INTO threads (id, group_id, reported_message_count, change_number)
         VALUES (?1, ?2, ?3, ?4)",
        params![thread.id, thread.group_id, thread.stats.messages_count, cn],
    )?;
    Ok(())
}

fn project_conversation(conn: &Connection, payload: &str) -> StoreResult<()> {
    let conversation: ConversationRecord = parse("conversation", payload)?;
    let cn = next_change(conn)?;
    conn.execute(
        "INSERT OR REPLACE INTO conversations (thread_id, participant_ids, change_number)
         VALUES (?1, ?2, ?3)",
        params![
            conversation.id,
            serde_json::to_string(&conversation.participant_ids)?,
            cn
        ],
    )?;
    Ok(())
}

fn project_reference(conn: &Connection, kind: &str, payload: &str) -> StoreResult<bool> {
    match kind {
        "user" => project_user(conn, payload)?,
        "group" => project_group(conn, payload)?,
        "thread" => project_thread(conn, payload)?,
        "conversation" => project_conversation(conn, payload)?,
        other => {
            log::debug!("Skipping reference of kind {other:?}");
            return Ok(false);
        }
    }
    Ok(true)
}

fn project_message(conn: &Connection, payload: &str) -> StoreResult<()> {
    let message: MessageRecord = parse("message", payload)?;

    ensure_partial_user(conn, message.sender_id, None)?;
    for like in &message.liked_by.names {
        ensure_partial_user(conn, like.user_id, like.full_name.as_deref())?;
    }
    for &user_id in &message.notified_user_ids {
        ensure_partial_user(conn, user_id, None)?;
    }

    let liked_by: Vec<UserId> = message.liked_by.names.iter().map(|n| n.user_id).collect();
    let likes_count = message.liked_by.count.max(liked_by.len() as i64);
    let cn = next_change(conn)?;
    conn.execute(
        "INSERT OR REPLACE INTO messages
            (id, thread_id, group_id, sender_id, replied_to_id, created_at, body, kind,
             likes_count, liked_by, notified_ids, change_number)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            message.id,
            message.thread_id,
            message.group_id,
            message.sender_id,
            message.replied_to_id,
            message.created_at,
            message.body.plain,
            message.message_type.as_str(),
            likes_count,
            serde_json::to_string(&liked_by)?,
            serde_json::to_string(&message.notified_user_ids)?,
            cn,
        ],
    )?;
    conn.execute("DELETE FROM removed_messages WHERE message_id = ?1", [message.id])?;

    let has_state = conn
        .query_row(
            "SELECT 1 FROM thread_states WHERE thread_id = ?1",
            [message.thread_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !has_state {
        let cn = next_change(conn)?;
        conn.execute(
            "INSERT INTO thread_states (thread_id, followed, change_number) VALUES (?1, 0, ?2)",
            params![message.thread_id, cn],
        )?;
    }
    Ok(())
}

/// Project every archive row above the watermark and advance it.
pub(crate) fn catch_up(conn: &Connection) -> StoreResult<ProjectionReport> {
    let watermark = archive::read_counter(conn, "projected_seq")?;
    let mut report = ProjectionReport::default();
    let mut high = watermark;

    for (seq, kind, payload) in archive::references_since(conn, watermark)? {
        high = high.max(seq);
        match project_reference(conn, &kind, &payload) {
            Ok(true) => report.projected += 1,
            Ok(false) => {}
            Err(StoreError::Protocol(msg)) => {
                log::error!("Skipping unprojectable {kind} reference: {msg}");
                report.protocol_errors.push(msg);
            }
            Err(e) => return Err(e),
        }
    }
    for (seq, payload) in archive::messages_since(conn, watermark)? {
        high = high.max(seq);
        match project_message(conn, &payload) {
            Ok(()) => report.projected += 1,
            Err(StoreError::Protocol(msg)) => {
                log::error!("Skipping unprojectable message: {msg}");
                report.protocol_errors.push(msg);
            }
            Err(e) => return Err(e),
        }
    }

    if high > watermark {
        archive::write_counter(conn, "projected_seq", high)?;
    }
    Ok(report)
}

fn touch_all(conn: &Connection, table: &str, key: &str) -> StoreResult<()> {
    let ids: Vec<i64> = conn
        .prepare(&format!("SELECT {key} FROM {table} ORDER BY {key}"))?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    for id in ids {
        let cn = next_change(conn)?;
        conn.execute(
            &format!("UPDATE {table} SET change_number = ?1 WHERE {key} = ?2"),
            params![cn, id],
        )?;
    }
    Ok(())
}

/// Recreate every projected entity from the archive, leaf first. Local state
/// rows survive and are re-stamped in dependency order.
pub(crate) fn rebuild(conn: &Connection) -> StoreResult<ProjectionReport> {
    conn.execute_batch(
        "DELETE FROM users; DELETE FROM groups; DELETE FROM threads;
         DELETE FROM conversations; DELETE FROM messages; DELETE FROM removed_messages;",
    )?;

    let references = archive::references_since(conn, 0)?;
    let messages = archive::messages_since(conn, 0)?;
    let mut report = ProjectionReport::default();
    let mut record = |result: StoreResult<bool>| -> StoreResult<()> {
        match result {
            Ok(true) => report.projected += 1,
            Ok(false) => {}
            Err(StoreError::Protocol(msg)) => report.protocol_errors.push(msg),
            Err(e) => return Err(e),
        }
        Ok(())
    };

    let of_kind = |wanted: &'static str| {
        references
            .iter()
            .filter(move |(_, kind, _)| kind == wanted)
            .map(|(_, kind, payload)| (kind.as_str(), payload.as_str()))
    };

    for (kind, payload) in of_kind("user") {
        record(project_reference(conn, kind, payload))?;
    }
    for (kind, payload) in of_kind("group") {
        record(project_reference(conn, kind, payload))?;
    }
    touch_all(conn, "group_states", "group_id")?;
    for (kind, payload) in of_kind("thread") {
        record(project_reference(conn, kind, payload))?;
    }
    for (_, payload) in &messages {
        record(project_message(conn, payload).map(|_| true))?;
    }
    touch_all(conn, "message_states", "message_id")?;
    touch_all(conn, "thread_states", "thread_id")?;
    for (kind, payload) in of_kind("conversation") {
        record(project_reference(conn, kind, payload))?;
    }

    let high = archive::read_counter(conn, "archive_seq")?;
    archive::write_counter(conn, "projected_seq", high)?;
    log::info!(
        "Projection rebuilt: {} records, {} skipped",
        report.projected,
        report.protocol_errors.len()
    );
    Ok(report)
}

// -- local user state -----------------------------------------------------------

pub(crate) fn set_message_state(
    conn: &Connection,
    message_id: MessageId,
    read: bool,
    starred: bool,
    deleted: bool,
) -> StoreResult<()> {
    let cn = next_change(conn)?;
    conn.execute(
        "INSERT OR REPLACE INTO message_states (message_id, read, starred, deleted, change_number)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![message_id, read, starred, deleted, cn],
    )?;
    Ok(())
}

pub(crate) fn set_thread_state(
    conn: &Connection,
    thread_id: ThreadId,
    followed: bool,
    last_seen_message_id: Option<MessageId>,
) -> StoreResult<()> {
    let cn = next_change(conn)?;
    conn.execute(
        "INSERT OR REPLACE INTO thread_states (thread_id, followed, last_seen_message_id, change_number)
         VALUES (?1, ?2, ?3, ?4)",
        params![thread_id, followed, last_seen_message_id, cn],
    )?;
    Ok(())
}

pub(crate) fn set_group_state(
    conn: &Connection,
    group_id: GroupId,
    show_in_sidebar: bool,
    last_viewed_utc: Option<DateTime<Utc>>,
) -> StoreResult<()> {
    let cn = next_change(conn)?;
    conn.execute(
        "INSERT OR REPLACE INTO group_states (group_id, show_in_sidebar, last_viewed_utc, change_number)
         VALUES (?1, ?2, ?3, ?4)",
        params![group_id, show_in_sidebar, last_viewed_utc, cn],
    )?;
    Ok(())
}

/// Remove a thread's projected messages, leaving tombstones for the cache.
pub(crate) fn remove_thread_messages(conn: &Connection, thread_id: ThreadId) -> StoreResult<Vec<MessageId>> {
    let ids: Vec<MessageId> = conn
        .prepare("SELECT id FROM messages WHERE thread_id = ?1 ORDER BY id")?
        .query_map([thread_id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    for &id in &ids {
        let cn = next_change(conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO removed_messages (message_id, change_number) VALUES (?1, ?2)",
            params![id, cn],
        )?;
    }
    conn.execute("DELETE FROM messages WHERE thread_id = ?1", [thread_id])?;
    Ok(ids)
}

// -- change notification ----------------------------------------------------------

fn json_ids(raw: String) -> rusqlite::Result<Vec<i64>> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn text_enum<T: std::str::FromStr<Err = String>>(raw: String) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

fn query_rows<T>(
    conn: &Connection,
    sql: &str,
    since: i64,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> StoreResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([since], map)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every projected row changed after `since`. `changes_since(conn, 0)` is the
/// full projection used for a bulk reload.
pub(crate) fn changes_since(conn: &Connection, since: i64) -> StoreResult<ProjectionDelta> {
    let users = query_rows(
        conn,
        "SELECT id, full_name, job_title, mugshot_url, is_partial, change_number
         FROM users WHERE change_number > ?1 ORDER BY change_number",
        since,
        |row| {
            Ok(UserRow {
                id: row.get(0)?,
                full_name: row.get(1)?,
                job_title: row.get(2)?,
                mugshot_url: row.get(3)?,
                is_partial: row.get(4)?,
                change_number: row.get(5)?,
            })
        },
    )?;
    let groups = query_rows(
        conn,
        "SELECT id, full_name, privacy, change_number
         FROM groups WHERE change_number > ?1 ORDER BY change_number",
        since,
        |row| {
            Ok(GroupRow {
                id: row.get(0)?,
                full_name: row.get(1)?,
                privacy: text_enum(row.get(2)?)?,
                change_number: row.get(3)?,
            })
        },
    )?;
    let group_states = query_rows(
        conn,
        "SELECT group_id, show_in_sidebar, last_viewed_utc, change_number
         FROM group_states WHERE change_number > ?1 ORDER BY change_number",
        since,
        |row| {
            Ok(GroupStateRow {
                group_id: row.get(0)?,
                show_in_sidebar: row.get(1)?,
                last_viewed_utc: row.get(2)?,
                change_number: row.get(3)?,
            })
        },
    )?;
    let threads = query_rows(
        conn,
        "SELECT id, group_id, reported_message_count, change_number
         FROM threads WHERE change_number > ?1 ORDER BY change_number",
        since,
        |row| {
            Ok(ThreadRow {
                id: row.get(0)?,
                group_id: row.get(1)?,
                reported_message_count: row.get(2)?,
                change_number: row.get(3)?,
            })
        },
    )?;
    let messages = query_rows(
        conn,
        "SELECT id, thread_id, group_id, sender_id, replied_to_id, created_at, body, kind,
                likes_count, liked_by, notified_ids, change_number
         FROM messages WHERE change_number > ?1 ORDER BY change_number",
        since,
        |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                thread_id: row.get(1)?,
                group_id: row.get(2)?,
                sender_id: row.get(3)?,
                replied_to_id: row.get(4)?,
                created_at: row.get(5)?,
                body: row.get(6)?,
                kind: text_enum(row.get(7)?)?,
                likes_count: row.get(8)?,
                liked_by: json_ids(row.get(9)?)?,
                notified_ids: json_ids(row.get(10)?)?,
                change_number: row.get(11)?,
            })
        },
    )?;
    let message_states = query_rows(
        conn,
        "SELECT message_id, read, starred, deleted, change_number
         FROM message_states WHERE change_number > ?1 ORDER BY change_number",
        since,
        |row| {
            Ok(MessageStateRow {
                message_id: row.get(0)?,
                read: row.get(1)?,
                starred: row.get(2)?,
                deleted: row.get(3)?,
                change_number: row.get(4)?,
            })
        },
    )?;
    let thread_states = query_rows(
        conn,
        "SELECT thread_id, followed, last_seen_message_id, change_number
         FROM thread_states WHERE change_number > ?1 ORDER BY change_number",
        since,
        |row| {
            Ok(ThreadStateRow {
                thread_id: row.get(0)?,
                followed: row.get(1)?,
                last_seen_message_id: row.get(2)?,
                change_number: row.get(3)?,
            })
        },
    )?;
    let conversations = query_rows(
        conn,
        "SELECT thread_id, participant_ids, change_number
         FROM conversations WHERE change_number > ?1 ORDER BY change_number",
        since,
        |row| {
            Ok(ConversationRow {
                thread_id: row.get(0)?,
                participant_ids: json_ids(row.get(1)?)?,
                change_number: row.get(2)?,
            })
        },
    )?;
    let removed_messages = query_rows(
        conn,
        "SELECT message_id FROM removed_messages WHERE change_number > ?1 ORDER BY change_number",
        since,
        |row| row.get(0),
    )?;

    let high_water = archive::read_counter(conn, "change_number")?.max(since);
    Ok(ProjectionDelta {
        users,
        groups,
        group_states,
        threads,
        messages,
        message_states,
        thread_states,
        conversations,
        removed_messages,
        high_water,
    })
}
