//! Nodes of the in-memory object graph. Cross references are IDs into the
//! cache's maps; a referenced node always exists, possibly as a stub.

use crate::core::models::{GroupId, MessageId, ThreadId, UserId};
use crate::core::rows::{
    ConversationRow, GroupRow, GroupStateRow, MessageRow, MessageStateRow, ThreadRow,
    ThreadStateRow, UserRow,
};

/// Whether a node has seen its first real projected row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loaded<T> {
    NotLoaded,
    Loaded(T),
}

impl<T> Loaded<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Loaded::Loaded(_))
    }

    pub fn row(&self) -> Option<&T> {
        match self {
            Loaded::Loaded(row) => Some(row),
            Loaded::NotLoaded => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub row: Loaded<UserRow>,
}

impl User {
    pub(crate) fn stub(id: UserId) -> Self {
        User {
            id,
            row: Loaded::NotLoaded,
        }
    }

    pub fn display_name(&self) -> String {
        self.row
            .row()
            .and_then(|r| r.full_name.clone())
            .unwrap_or_else(|| format!("user {}", self.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub row: Loaded<GroupRow>,
    pub state: Option<GroupStateRow>,
    /// Threads with at least one live message, sorted by ID.
    pub threads: Vec<ThreadId>,
    /// Threads whose every message is deleted, sorted by ID.
    pub deleted_threads: Vec<ThreadId>,
    pub read_thread_count: usize,
}

impl Group {
    pub(crate) fn stub(id: GroupId) -> Self {
        Group {
            id,
            row: Loaded::NotLoaded,
            state: None,
            threads: Vec::new(),
            deleted_threads: Vec::new(),
            read_thread_count: 0,
        }
    }

    pub fn unread_thread_count(&self) -> usize {
        self.threads.len() - self.read_thread_count
    }
}

/// Where a thread currently sits inside its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    Outside,
    Active,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub id: ThreadId,
    pub row: Loaded<ThreadRow>,
    /// Taken from the first message that names a group.
    pub group_id: Option<GroupId>,
    /// Set once the thread receives its first message.
    pub started: bool,
    pub state: Option<ThreadStateRow>,
    pub conversation: Option<ConversationRow>,
    /// Live messages, sorted by ID.
    pub messages: Vec<MessageId>,
    /// Deleted messages, sorted by ID.
    pub deleted_messages: Vec<MessageId>,
    pub read_message_count: usize,
    pub total_likes_count: i64,
}

impl Thread {
    pub(crate) fn stub(id: ThreadId) -> Self {
        Thread {
            id,
            row: Loaded::NotLoaded,
            group_id: None,
            started: false,
            state: None,
            conversation: None,
            messages: Vec::new(),
            deleted_messages: Vec::new(),
            read_message_count: 0,
            total_likes_count: 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.started || self.row.is_loaded()
    }

    pub fn is_deleted(&self) -> bool {
        self.messages.is_empty() && !self.deleted_messages.is_empty()
    }

    pub fn is_fully_read(&self) -> bool {
        !self.messages.is_empty() && self.read_message_count == self.messages.len()
    }

    pub fn unread_count(&self) -> usize {
        self.messages.len() - self.read_message_count
    }

    pub(crate) fn membership(&self) -> Membership {
        if !self.messages.is_empty() {
            Membership::Active
        } else if !self.deleted_messages.is_empty() {
            Membership::Deleted
        } else {
            Membership::Outside
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyLink {
    None,
    /// Target not loaded yet; a listener is registered for it.
    Pending(MessageId),
    Resolved(MessageId),
}

impl ReplyLink {
    pub fn target(&self) -> Option<MessageId> {
        match self {
            ReplyLink::None => None,
            ReplyLink::Pending(id) | ReplyLink::Resolved(id) => Some(*id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub row: Loaded<MessageRow>,
    pub state: MessageStateRow,
    pub reply_to: ReplyLink,
    /// Loaded messages replying to this one, sorted by ID.
    pub replies: Vec<MessageId>,
}

impl Message {
    pub(crate) fn stub(id: MessageId) -> Self {
        Message {
            id,
            row: Loaded::NotLoaded,
            state: MessageStateRow {
                message_id: id,
                ..Default::default()
            },
            reply_to: ReplyLink::None,
            replies: Vec::new(),
        }
    }

    pub fn is_read(&self) -> bool {
        self.state.read
    }

    pub fn is_deleted(&self) -> bool {
        self.state.deleted
    }

    pub fn likes_count(&self) -> i64 {
        self.row.row().map_or(0, |r| r.likes_count)
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.row.row().map(|r| r.thread_id)
    }
}

pub(crate) fn insert_sorted(ids: &mut Vec<i64>, id: i64) -> bool {
    match ids.binary_search(&id) {
        Ok(_) => false,
        Err(pos) => {
            ids.insert(pos, id);
            true
        }
    }
}

pub(crate) fn remove_sorted(ids: &mut Vec<i64>, id: i64) -> bool {
    match ids.binary_search(&id) {
        Ok(pos) => {
            ids.remove(pos);
            true
        }
        Err(_) => false,
    }
}
