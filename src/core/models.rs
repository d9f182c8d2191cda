use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type MessageId = i64;
pub type ThreadId = i64;
pub type UserId = i64;
pub type GroupId = i64;

/// A syncable unit: a real group or one of the synthetic feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FeedId {
    Group(GroupId),
    AllCompany,
    PrivateConversations,
    Inbox,
}

impl FeedId {
    /// The inbox legitimately returns messages newer than the requested
    /// boundary, so it is exempt from that consistency check.
    pub fn is_inbox(&self) -> bool {
        matches!(self, FeedId::Inbox)
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedId::Group(id) => write!(f, "group:{id}"),
            FeedId::AllCompany => f.write_str("all_company"),
            FeedId::PrivateConversations => f.write_str("private"),
            FeedId::Inbox => f.write_str("inbox"),
        }
    }
}

impl FromStr for FeedId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all_company" => Ok(FeedId::AllCompany),
            "private" => Ok(FeedId::PrivateConversations),
            "inbox" => Ok(FeedId::Inbox),
            other => {
                let id = other
                    .strip_prefix("group:")
                    .ok_or_else(|| format!("unknown feed id {other:?}"))?;
                id.parse()
                    .map(FeedId::Group)
                    .map_err(|e| format!("bad group feed id {other:?}: {e}"))
            }
        }
    }
}

/// A raw message as returned by the service. Only the fields the puller
/// needs are typed; everything else rides along untouched in `rest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// A raw reference object (user, group, thread, conversation, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencePayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: i64,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl ReferencePayload {
    /// Total message count the service reports for a thread reference.
    pub fn thread_message_count(&self) -> Option<u64> {
        if self.kind != "thread" {
            return None;
        }
        self.rest
            .get("stats")
            .and_then(|s| s.get("messages_count"))
            .and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub current_user_id: UserId,
}

/// One page returned by a feed or thread request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
    #[serde(default)]
    pub threaded_extended: HashMap<ThreadId, Vec<MessagePayload>>,
    #[serde(default)]
    pub references: Vec<ReferencePayload>,
    #[serde(default)]
    pub meta: Meta,
}

impl Envelope {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Every message in the page, thread starters first.
    pub fn all_messages(&self) -> impl Iterator<Item = &MessagePayload> {
        self.messages
            .iter()
            .chain(self.threaded_extended.values().flatten())
    }

    pub fn thread_reference(&self, thread_id: ThreadId) -> Option<&ReferencePayload> {
        self.references
            .iter()
            .find(|r| r.kind == "thread" && r.id == thread_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_id_string_form_round_trips() {
        for feed in [
            FeedId::Group(42),
            FeedId::AllCompany,
            FeedId::PrivateConversations,
            FeedId::Inbox,
        ] {
            assert_eq!(feed.to_string().parse::<FeedId>(), Ok(feed));
        }
        assert!("group:abc".parse::<FeedId>().is_err());
        assert!("elsewhere".parse::<FeedId>().is_err());
    }

    #[test]
    fn envelope_parses_with_extended_and_unknown_fields() {
        let json = r#"{
            "messages": [{"id": 5, "thread_id": 5, "created_at": "2024-01-02T03:04:05Z",
                          "sender_id": 1, "message_type": "update"}],
            "threaded_extended": {"5": [{"id": 9, "thread_id": 5,
                                         "created_at": "2024-01-02T04:00:00Z"}]},
            "references": [{"type": "thread", "id": 5, "stats": {"messages_count": 2}},
                           {"type": "topic", "id": 77}],
            "meta": {"current_user_id": 1}
        }"#;
        let envelope: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.messages[0].rest["message_type"], "update");
        assert_eq!(envelope.threaded_extended[&5][0].id, 9);
        assert_eq!(envelope.all_messages().count(), 2);
        assert_eq!(envelope.thread_reference(5).and_then(|r| r.thread_message_count()), Some(2));
        assert_eq!(envelope.references[1].thread_message_count(), None);
    }
}
