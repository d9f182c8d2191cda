use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

use crate::core::archive;
use crate::core::models::{FeedId, GroupId, MessageId, MessagePayload, ReferencePayload, ThreadId};
use crate::core::projection::{self, ProjectionReport};
use crate::core::rows::ProjectionDelta;
use crate::core::sync_state::{self, SyncSnapshot, SyncingFeed, SyncingThread};
use crate::error::{StoreError, StoreResult};

/// Every durable write produced by one successful fetch. Applied in a single
/// transaction so the archive and the sync bookkeeping advance together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchCommit {
    pub messages: Vec<MessagePayload>,
    pub references: Vec<ReferencePayload>,
    pub save_feed: Option<SyncingFeed>,
    pub delete_feed: Option<FeedId>,
    pub save_threads: Vec<SyncingThread>,
    pub delete_threads: Vec<ThreadId>,
    /// Thread confirmed deleted upstream; its archived messages go too.
    pub purge_thread: Option<ThreadId>,
}

/// Archive statistics for status displays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub archived_messages: i64,
    pub last_fetched_utc: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Commands sent from async world → background thread
// ---------------------------------------------------------------------------

enum StoreCmd {
    LoadSyncState {
        reply: oneshot::Sender<StoreResult<SyncSnapshot>>,
    },
    HighestArchived {
        thread_ids: Vec<ThreadId>,
        reply: oneshot::Sender<StoreResult<HashMap<ThreadId, MessageId>>>,
    },
    CommitFetch {
        commit: Box<FetchCommit>,
        now: DateTime<Utc>,
        reply: oneshot::Sender<StoreResult<ProjectionReport>>,
    },
    SaveThread {
        thread: SyncingThread,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    ClearSyncState {
        reply: oneshot::Sender<StoreResult<()>>,
    },
    CatchUp {
        reply: oneshot::Sender<StoreResult<ProjectionReport>>,
    },
    RebuildProjection {
        reply: oneshot::Sender<StoreResult<ProjectionReport>>,
    },
    ChangesSince {
        change_number: i64,
        reply: oneshot::Sender<StoreResult<ProjectionDelta>>,
    },
    SetMessageState {
        message_id: MessageId,
        read: bool,
        starred: bool,
        deleted: bool,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    SetThreadState {
        thread_id: ThreadId,
        followed: bool,
        last_seen_message_id: Option<MessageId>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    SetGroupState {
        group_id: GroupId,
        show_in_sidebar: bool,
        last_viewed_utc: Option<DateTime<Utc>>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Stats {
        reply: oneshot::Sender<StoreResult<StoreStats>>,
    },
}

// ---------------------------------------------------------------------------
// StoreHandle: Clone + Send + Sync async facade
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCmd>,
}

impl StoreHandle {
    /// Open (or create) the database file and spawn the background thread.
    pub fn open(db_file: PathBuf) -> StoreResult<Self> {
        if let Some(parent) = db_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Corrupt(format!("create store dir {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(&db_file)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        log::info!("Store opened at {}", db_file.display());
        Self::start(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::start(Connection::open_in_memory()?)
    }

    fn start(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(archive::SCHEMA)?;
        conn.execute_batch(sync_state::SCHEMA)?;
        conn.execute_batch(projection::SCHEMA)?;

        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("feedkeeper-store".into())
            .spawn(move || Self::run_loop(conn, rx))
            .map_err(|e| StoreError::Corrupt(format!("spawn store thread: {e}")))?;

        Ok(StoreHandle { tx })
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> StoreCmd,
    ) -> StoreResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| StoreError::Unavailable)?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    // -- async methods -------------------------------------------------------

    pub async fn load_sync_state(&self) -> StoreResult<SyncSnapshot> {
        self.call(|reply| StoreCmd::LoadSyncState { reply }).await
    }

    pub async fn highest_archived(
        &self,
        thread_ids: Vec<ThreadId>,
    ) -> StoreResult<HashMap<ThreadId, MessageId>> {
        self.call(|reply| StoreCmd::HighestArchived { thread_ids, reply })
            .await
    }

    /// Write one fetch cycle atomically, then project what it archived.
    pub async fn commit_fetch(
        &self,
        commit: FetchCommit,
        now: DateTime<Utc>,
    ) -> StoreResult<ProjectionReport> {
        self.call(|reply| StoreCmd::CommitFetch {
            commit: Box::new(commit),
            now,
            reply,
        })
        .await
    }

    pub async fn save_thread(&self, thread: SyncingThread) -> StoreResult<()> {
        self.call(|reply| StoreCmd::SaveThread { thread, reply }).await
    }

    /// Forget all sync progress. Archived data is untouched.
    pub async fn clear_sync_state(&self) -> StoreResult<()> {
        self.call(|reply| StoreCmd::ClearSyncState { reply }).await
    }

    /// Project any archive rows the projector has not seen yet.
    pub async fn catch_up(&self) -> StoreResult<ProjectionReport> {
        self.call(|reply| StoreCmd::CatchUp { reply }).await
    }

    pub async fn rebuild_projection(&self) -> StoreResult<ProjectionReport> {
        self.call(|reply| StoreCmd::RebuildProjection { reply }).await
    }

    pub async fn changes_since(&self, change_number: i64) -> StoreResult<ProjectionDelta> {
        self.call(|reply| StoreCmd::ChangesSince {
            change_number,
            reply,
        })
        .await
    }

    /// The whole projection, for a bulk cache reload.
    pub async fn load_all(&self) -> StoreResult<ProjectionDelta> {
        self.changes_since(0).await
    }

    pub async fn set_message_state(
        &self,
        message_id: MessageId,
        read: bool,
        starred: bool,
        deleted: bool,
    ) -> StoreResult<()> {
        self.call(|reply| StoreCmd::SetMessageState {
            message_id,
            read,
            starred,
            deleted,
            reply,
        })
        .await
    }

    pub async fn set_thread_state(
        &self,
        thread_id: ThreadId,
        followed: bool,
        last_seen_message_id: Option<MessageId>,
    ) -> StoreResult<()> {
        self.call(|reply| StoreCmd::SetThreadState {
            thread_id,
            followed,
            last_seen_message_id,
            reply,
        })
        .await
    }

    pub async fn set_group_state(
        &self,
        group_id: GroupId,
        show_in_sidebar: bool,
        last_viewed_utc: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.call(|reply| StoreCmd::SetGroupState {
            group_id,
            show_in_sidebar,
            last_viewed_utc,
            reply,
        })
        .await
    }

    pub async fn stats(&self) -> StoreResult<StoreStats> {
        self.call(|reply| StoreCmd::Stats { reply }).await
    }

    // -- background thread ---------------------------------------------------

    fn run_loop(conn: Connection, mut rx: mpsc::UnboundedReceiver<StoreCmd>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                StoreCmd::LoadSyncState { reply } => {
                    let _ = reply.send(sync_state::load(&conn));
                }
                StoreCmd::HighestArchived { thread_ids, reply } => {
                    let _ = reply.send(archive::highest_message_ids(&conn, &thread_ids));
                }
                StoreCmd::CommitFetch { commit, now, reply } => {
                    let _ = reply.send(Self::do_commit_fetch(&conn, &commit, now));
                }
                StoreCmd::SaveThread { thread, reply } => {
                    let _ = reply.send(sync_state::save_thread(&conn, &thread));
                }
                StoreCmd::ClearSyncState { reply } => {
                    let _ = reply.send(sync_state::clear(&conn));
                }
                StoreCmd::CatchUp { reply } => {
                    let _ = reply.send(Self::in_transaction(&conn, projection::catch_up));
                }
                StoreCmd::RebuildProjection { reply } => {
                    let _ = reply.send(Self::in_transaction(&conn, projection::rebuild));
                }
                StoreCmd::ChangesSince {
                    change_number,
                    reply,
                } => {
                    let _ = reply.send(projection::changes_since(&conn, change_number));
                }
                StoreCmd::SetMessageState {
                    message_id,
                    read,
                    starred,
                    deleted,
                    reply,
                } => {
                    let _ = reply.send(projection::set_message_state(
                        &conn, message_id, read, starred, deleted,
                    ));
                }
                StoreCmd::SetThreadState {
                    thread_id,
                    followed,
                    last_seen_message_id,
                    reply,
                } => {
                    let _ = reply.send(projection::set_thread_state(
                        &conn,
                        thread_id,
                        followed,
                        last_seen_message_id,
                    ));
                }
                StoreCmd::SetGroupState {
                    group_id,
                    show_in_sidebar,
                    last_viewed_utc,
                    reply,
                } => {
                    let _ = reply.send(projection::set_group_state(
                        &conn,
                        group_id,
                        show_in_sidebar,
                        last_viewed_utc,
                    ));
                }
                StoreCmd::Stats { reply } => {
                    let _ = reply.send(Self::do_stats(&conn));
                }
            }
        }
        log::debug!("Store thread exiting");
    }

    // -- synchronous DB operations -------------------------------------------

    fn in_transaction<T>(
        conn: &Connection,
        f: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let tx = conn.unchecked_transaction()?;
        let out = f(&*tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn do_commit_fetch(
        conn: &Connection,
        commit: &FetchCommit,
        now: DateTime<Utc>,
    ) -> StoreResult<ProjectionReport> {
        Self::in_transaction(conn, |tx| {
            for reference in &commit.references {
                archive::put_reference(tx, reference, now)?;
            }
            for message in &commit.messages {
                archive::put_message(tx, message, now)?;
            }
            if let Some(thread_id) = commit.purge_thread {
                let n = archive::delete_thread_messages(tx, thread_id)?;
                log::info!("Purged {n} archived messages of deleted thread {thread_id}");
            }
            archive::set_last_fetched(tx, now)?;

            if let Some(feed) = &commit.save_feed {
                sync_state::save_feed(tx, feed)?;
            }
            if let Some(feed_id) = commit.delete_feed {
                sync_state::delete_feed(tx, feed_id)?;
            }
            for thread in &commit.save_threads {
                sync_state::save_thread(tx, thread)?;
            }
            for &thread_id in &commit.delete_threads {
                sync_state::delete_thread(tx, thread_id)?;
            }
            Ok(())
        })?;

        // The projector runs from the archive watermark, so a crash between
        // the two transactions is repaired by the next catch-up.
        Self::in_transaction(conn, |tx| {
            if let Some(thread_id) = commit.purge_thread {
                projection::remove_thread_messages(tx, thread_id)?;
            }
            projection::catch_up(tx)
        })
    }

    fn do_stats(conn: &Connection) -> StoreResult<StoreStats> {
        Ok(StoreStats {
            archived_messages: archive::message_count(conn)?,
            last_fetched_utc: archive::last_fetched(conn)?,
        })
    }
}
