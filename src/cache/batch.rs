//! Change notifications collected during one logical cache operation and
//! released together once the graph is consistent again.

use indexmap::map::Entry;
use indexmap::IndexMap;

use crate::core::models::{GroupId, MessageId, ThreadId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    User(UserId),
    Group(GroupId),
    Thread(ThreadId),
    Message(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    PropertyChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheChange {
    pub entity: EntityKey,
    pub kind: ChangeKind,
}

#[derive(Debug, Default)]
pub struct ChangeBatch {
    changes: IndexMap<EntityKey, ChangeKind>,
    suppressed: bool,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch that swallows everything; used for bulk reloads.
    pub fn suppressed() -> Self {
        ChangeBatch {
            changes: IndexMap::new(),
            suppressed: true,
        }
    }

    /// One entry per entity; `Added` wins over `PropertyChanged`.
    pub fn record(&mut self, entity: EntityKey, kind: ChangeKind) {
        if self.suppressed {
            return;
        }
        match self.changes.entry(entity) {
            Entry::Occupied(mut slot) => {
                if kind == ChangeKind::Added {
                    slot.insert(ChangeKind::Added);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(kind);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn flush(self) -> Vec<CacheChange> {
        self.changes
            .into_iter()
            .map(|(entity, kind)| CacheChange { entity, kind })
            .collect()
    }
}
