//! Rows of the core projection. Every row carries the change number the store
//! assigned on its last insert or update.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::models::{GroupId, MessageId, ThreadId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPrivacy {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Update,
    Announcement,
    System,
    Chat,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} {:?}", stringify!($ty), other)),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(GroupPrivacy { Public => "public", Private => "private" });
string_enum!(MessageKind {
    Update => "update",
    Announcement => "announcement",
    System => "system",
    Chat => "chat",
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub id: UserId,
    pub full_name: Option<String>,
    pub job_title: Option<String>,
    pub mugshot_url: Option<String>,
    /// Inserted from a like or notification rather than a real user record.
    pub is_partial: bool,
    pub change_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRow {
    pub id: GroupId,
    pub full_name: String,
    pub privacy: GroupPrivacy,
    pub change_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStateRow {
    pub group_id: GroupId,
    pub show_in_sidebar: bool,
    pub last_viewed_utc: Option<DateTime<Utc>>,
    pub change_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRow {
    pub id: ThreadId,
    pub group_id: Option<GroupId>,
    pub reported_message_count: Option<i64>,
    pub change_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStateRow {
    pub thread_id: ThreadId,
    pub followed: bool,
    pub last_seen_message_id: Option<MessageId>,
    pub change_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRow {
    pub thread_id: ThreadId,
    pub participant_ids: Vec<UserId>,
    pub change_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub group_id: Option<GroupId>,
    pub sender_id: UserId,
    pub replied_to_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub body: String,
    pub kind: MessageKind,
    pub likes_count: i64,
    /// Ordered as the service listed them.
    pub liked_by: Vec<UserId>,
    pub notified_ids: Vec<UserId>,
    pub change_number: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageStateRow {
    pub message_id: MessageId,
    pub read: bool,
    pub starred: bool,
    pub deleted: bool,
    pub change_number: i64,
}

/// Projection rows changed after some change number, in dependency order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionDelta {
    pub users: Vec<UserRow>,
    pub groups: Vec<GroupRow>,
    pub group_states: Vec<GroupStateRow>,
    pub threads: Vec<ThreadRow>,
    pub messages: Vec<MessageRow>,
    pub message_states: Vec<MessageStateRow>,
    pub thread_states: Vec<ThreadStateRow>,
    pub conversations: Vec<ConversationRow>,
    pub removed_messages: Vec<MessageId>,
    /// Highest change number included.
    pub high_water: i64,
}

impl ProjectionDelta {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.groups.is_empty()
            && self.group_states.is_empty()
            && self.threads.is_empty()
            && self.messages.is_empty()
            && self.message_states.is_empty()
            && self.thread_states.is_empty()
            && self.conversations.is_empty()
            && self.removed_messages.is_empty()
    }
}
