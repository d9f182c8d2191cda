//! Persisted sync progress: one record per feed (a sorted span list) and one
//! record per thread that has an open gap.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::core::models::{FeedId, MessageId, ThreadId};
use crate::error::{StoreError, StoreResult};

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS syncing_feeds (
    feed_id TEXT PRIMARY KEY,
    spans TEXT NOT NULL,
    reached_empty_result INTEGER NOT NULL DEFAULT 0,
    span_cycles_since_check_new INTEGER NOT NULL DEFAULT 0,
    last_update_utc TEXT,
    last_check_new_utc TEXT
);

CREATE TABLE IF NOT EXISTS syncing_threads (
    thread_id INTEGER PRIMARY KEY,
    feed_id TEXT NOT NULL,
    last_pulled_message_id INTEGER,
    stop_message_id INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);
";

/// A closed interval of message IDs known to be fully downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start_message_id: MessageId,
    pub end_message_id: MessageId,
    /// Timestamp of the earliest message in the span.
    pub start_time_utc: DateTime<Utc>,
}

impl Span {
    pub fn new(start_message_id: MessageId, end_message_id: MessageId, start_time_utc: DateTime<Utc>) -> Self {
        debug_assert!(start_message_id <= end_message_id);
        Span {
            start_message_id,
            end_message_id,
            start_time_utc,
        }
    }

    /// Overlapping or adjacent (tolerance of one ID).
    pub fn touches(&self, other: &Span) -> bool {
        self.start_message_id <= other.end_message_id.saturating_add(1)
            && other.start_message_id <= self.end_message_id.saturating_add(1)
    }

    fn merged_with(&self, other: &Span) -> Span {
        let start_time_utc = match self.start_message_id.cmp(&other.start_message_id) {
            std::cmp::Ordering::Less => self.start_time_utc,
            std::cmp::Ordering::Greater => other.start_time_utc,
            std::cmp::Ordering::Equal => self.start_time_utc.min(other.start_time_utc),
        };
        Span {
            start_message_id: self.start_message_id.min(other.start_message_id),
            end_message_id: self.end_message_id.max(other.end_message_id),
            start_time_utc,
        }
    }
}

/// Progress record for one feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncingFeed {
    pub feed_id: FeedId,
    /// Sorted ascending by ID, non-overlapping, non-adjacent.
    pub spans: Vec<Span>,
    pub reached_empty_result: bool,
    pub span_cycles_since_check_new: u32,
    pub last_update_utc: Option<DateTime<Utc>>,
    pub last_check_new_utc: Option<DateTime<Utc>>,
}

impl SyncingFeed {
    pub fn new(feed_id: FeedId) -> Self {
        SyncingFeed {
            feed_id,
            spans: Vec::new(),
            reached_empty_result: false,
            span_cycles_since_check_new: 0,
            last_update_utc: None,
            last_check_new_utc: None,
        }
    }

    pub fn has_span_gaps(&self) -> bool {
        self.spans.len() > 1
    }

    pub fn never_synced(&self) -> bool {
        self.spans.is_empty() && !self.reached_empty_result
    }

    /// The newest span; backfill continues below its start.
    pub fn newest_span(&self) -> Option<&Span> {
        self.spans.last()
    }

    /// `None` stands for +infinity (no spans yet).
    pub fn next_older_than(&self) -> Option<DateTime<Utc>> {
        self.newest_span().map(|s| s.start_time_utc)
    }

    pub fn needs_backfill(&self) -> bool {
        self.has_span_gaps() || !self.reached_empty_result
    }

    /// Insert a span, absorbing every span it touches.
    pub fn insert_span(&mut self, span: Span) {
        let mut merged = span;
        let mut kept = Vec::with_capacity(self.spans.len() + 1);
        for existing in self.spans.drain(..) {
            if existing.touches(&merged) {
                merged = merged.merged_with(&existing);
            } else {
                kept.push(existing);
            }
        }
        kept.push(merged);
        kept.sort_by_key(|s| s.start_message_id);
        debug_assert!(kept.windows(2).all(|w| !w[0].touches(&w[1])));
        self.spans = kept;
    }
}

/// One open gap inside a thread: contiguous at or below `stop_message_id`,
/// and above `last_pulled_message_id` once that is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncingThread {
    pub thread_id: ThreadId,
    pub feed_id: FeedId,
    /// `None` means the next fetch starts from the newest message.
    pub last_pulled_message_id: Option<MessageId>,
    pub stop_message_id: MessageId,
    pub retry_count: u32,
}

impl SyncingThread {
    pub fn new(thread_id: ThreadId, feed_id: FeedId, stop_message_id: MessageId) -> Self {
        SyncingThread {
            thread_id,
            feed_id,
            last_pulled_message_id: None,
            stop_message_id,
            retry_count: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.last_pulled_message_id
            .is_some_and(|pulled| pulled <= self.stop_message_id)
    }
}

/// Everything persisted by the tracker, as loaded on startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub feeds: Vec<SyncingFeed>,
    pub threads: Vec<SyncingThread>,
}

// -- persistence (runs on the store thread) ----------------------------------

pub(crate) fn load(conn: &Connection) -> StoreResult<SyncSnapshot> {
    let mut stmt = conn.prepare(
        "SELECT feed_id, spans, reached_empty_result, span_cycles_since_check_new,
                last_update_utc, last_check_new_utc
         FROM syncing_feeds ORDER BY feed_id",
    )?;
    let raw = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, Option<DateTime<Utc>>>(4)?,
                row.get::<_, Option<DateTime<Utc>>>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut feeds = Vec::with_capacity(raw.len());
    for (feed_id, spans, reached, cycles, last_update, last_check) in raw {
        let feed_id = feed_id.parse::<FeedId>().map_err(StoreError::Corrupt)?;
        feeds.push(SyncingFeed {
            feed_id,
            spans: serde_json::from_str(&spans)?,
            reached_empty_result: reached,
            span_cycles_since_check_new: cycles,
            last_update_utc: last_update,
            last_check_new_utc: last_check,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT thread_id, feed_id, last_pulled_message_id, stop_message_id, retry_count
         FROM syncing_threads ORDER BY thread_id",
    )?;
    let raw = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, ThreadId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<MessageId>>(2)?,
                row.get::<_, MessageId>(3)?,
                row.get::<_, u32>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut threads = Vec::with_capacity(raw.len());
    for (thread_id, feed_id, last_pulled, stop, retry_count) in raw {
        threads.push(SyncingThread {
            thread_id,
            feed_id: feed_id.parse().map_err(StoreError::Corrupt)?,
            last_pulled_message_id: last_pulled,
            stop_message_id: stop,
            retry_count,
        });
    }

    Ok(SyncSnapshot { feeds, threads })
}

pub(crate) fn save_feed(conn: &Connection, feed: &SyncingFeed) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO syncing_feeds
            (feed_id, spans, reached_empty_result, span_cycles_since_check_new,
             last_update_utc, last_check_new_utc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            feed.feed_id.to_string(),
            serde_json::to_string(&feed.spans)?,
            feed.reached_empty_result,
            feed.span_cycles_since_check_new,
            feed.last_update_utc,
            feed.last_check_new_utc,
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_feed(conn: &Connection, feed_id: FeedId) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM syncing_feeds WHERE feed_id = ?1",
        [feed_id.to_string()],
    )?;
    Ok(())
}

pub(crate) fn save_thread(conn: &Connection, thread: &SyncingThread) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO syncing_threads
            (thread_id, feed_id, last_pulled_message_id, stop_message_id, retry_count)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            thread.thread_id,
            thread.feed_id.to_string(),
            thread.last_pulled_message_id,
            thread.stop_message_id,
            thread.retry_count,
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_thread(conn: &Connection, thread_id: ThreadId) -> StoreResult<()> {
    conn.execute("DELETE FROM syncing_threads WHERE thread_id = ?1", [thread_id])?;
    Ok(())
}

pub(crate) fn load_thread(conn: &Connection, thread_id: ThreadId) -> StoreResult<Option<SyncingThread>> {
    let raw = conn
        .query_row(
            "SELECT feed_id, last_pulled_message_id, stop_message_id, retry_count
             FROM syncing_threads WHERE thread_id = ?1",
            [thread_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<MessageId>>(1)?,
                    row.get::<_, MessageId>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            },
        )
        .optional()?;
    match raw {
        Some((feed_id, last_pulled, stop, retry_count)) => Ok(Some(SyncingThread {
            thread_id,
            feed_id: feed_id.parse().map_err(StoreError::Corrupt)?,
            last_pulled_message_id: last_pulled,
            stop_message_id: stop,
            retry_count,
        })),
        None => Ok(None),
    }
}

pub(crate) fn clear(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch("DELETE FROM syncing_feeds; DELETE FROM syncing_threads;")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn span(start: MessageId, end: MessageId) -> Span {
        Span::new(start, end, t(start))
    }

    fn ranges(feed: &SyncingFeed) -> Vec<(MessageId, MessageId)> {
        feed.spans
            .iter()
            .map(|s| (s.start_message_id, s.end_message_id))
            .collect()
    }

    #[test]
    fn adjacent_spans_merge_in_either_order() {
        let mut a = SyncingFeed::new(FeedId::Inbox);
        a.insert_span(span(10, 20));
        a.insert_span(span(21, 30));

        let mut b = SyncingFeed::new(FeedId::Inbox);
        b.insert_span(span(21, 30));
        b.insert_span(span(10, 20));

        assert_eq!(ranges(&a), vec![(10, 30)]);
        assert_eq!(a, b);
        assert_eq!(a.spans[0].start_time_utc, t(10));
    }

    #[test]
    fn real_gap_keeps_spans_apart() {
        let mut feed = SyncingFeed::new(FeedId::AllCompany);
        feed.insert_span(span(25, 30));
        feed.insert_span(span(10, 20));
        assert_eq!(ranges(&feed), vec![(10, 20), (25, 30)]);
        assert!(feed.has_span_gaps());
        assert_eq!(feed.next_older_than(), Some(t(25)));
    }

    #[test]
    fn inserting_twice_is_idempotent() {
        let mut feed = SyncingFeed::new(FeedId::Group(3));
        feed.insert_span(span(10, 20));
        feed.insert_span(span(40, 50));
        let once = feed.clone();
        feed.insert_span(span(40, 50));
        feed.insert_span(span(10, 20));
        assert_eq!(feed, once);
    }

    #[test]
    fn bridging_span_absorbs_both_neighbours() {
        let mut feed = SyncingFeed::new(FeedId::Group(3));
        feed.insert_span(span(1, 5));
        feed.insert_span(span(10, 15));
        feed.insert_span(span(30, 40));
        feed.insert_span(span(6, 9));
        assert_eq!(ranges(&feed), vec![(1, 15), (30, 40)]);
        assert_eq!(feed.spans[0].start_time_utc, t(1));
    }

    #[test]
    fn derived_properties() {
        let mut feed = SyncingFeed::new(FeedId::Inbox);
        assert!(feed.never_synced());
        assert!(feed.needs_backfill());
        assert_eq!(feed.next_older_than(), None);

        feed.reached_empty_result = true;
        assert!(!feed.never_synced());
        assert!(!feed.needs_backfill());

        feed.insert_span(span(1, 2));
        feed.insert_span(span(8, 9));
        assert!(feed.needs_backfill());
    }

    #[test]
    fn gap_closes_at_stop_boundary() {
        let mut gap = SyncingThread::new(7, FeedId::Inbox, 100);
        assert!(!gap.is_closed());
        gap.last_pulled_message_id = Some(101);
        assert!(!gap.is_closed());
        gap.last_pulled_message_id = Some(100);
        assert!(gap.is_closed());
    }

    #[test]
    fn persisted_state_round_trips() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        let mut feed = SyncingFeed::new(FeedId::Group(12));
        feed.insert_span(span(10, 20));
        feed.insert_span(span(40, 45));
        feed.reached_empty_result = true;
        feed.span_cycles_since_check_new = 2;
        feed.last_update_utc = Some(t(500));
        feed.last_check_new_utc = Some(t(400));
        save_feed(&conn, &feed).unwrap();
        save_feed(&conn, &SyncingFeed::new(FeedId::Inbox)).unwrap();

        let mut gap = SyncingThread::new(40, FeedId::Group(12), 41);
        gap.last_pulled_message_id = Some(90);
        gap.retry_count = 2;
        save_thread(&conn, &gap).unwrap();
        save_thread(&conn, &SyncingThread::new(44, FeedId::Inbox, 44)).unwrap();

        let snapshot = load(&conn).unwrap();
        assert_eq!(snapshot.feeds.len(), 2);
        assert!(snapshot.feeds.contains(&feed));
        assert_eq!(snapshot.threads[0], gap);
        assert_eq!(snapshot.threads[1].last_pulled_message_id, None);
        assert_eq!(load_thread(&conn, 40).unwrap(), Some(gap));

        delete_thread(&conn, 40).unwrap();
        delete_feed(&conn, FeedId::Inbox).unwrap();
        let snapshot = load(&conn).unwrap();
        assert_eq!(snapshot.feeds, vec![feed]);
        assert_eq!(snapshot.threads.len(), 1);

        clear(&conn).unwrap();
        assert_eq!(load(&conn).unwrap(), SyncSnapshot::default());
    }
}
