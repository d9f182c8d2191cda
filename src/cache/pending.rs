//! Deferred work waiting for an entity to appear in the cache.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::core::models::{MessageId, ThreadId};
use crate::core::rows::{ConversationRow, MessageStateRow, ThreadStateRow};

/// What the deferred work is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingTarget {
    /// A message's first real row.
    Message(MessageId),
    /// A thread's first message.
    ThreadStarted(ThreadId),
}

/// Who registered the work. At most one action is pending per listener per
/// target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listener {
    /// A message whose reply-to points at the target.
    Message(MessageId),
    MessageState,
    ThreadState,
    Conversation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    LinkReply,
    ApplyMessageState(MessageStateRow),
    ApplyThreadState(ThreadStateRow),
    ApplyConversation(ConversationRow),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingActions {
    table: HashMap<PendingTarget, IndexMap<Listener, PendingAction>>,
}

impl PendingActions {
    /// Register `action`, replacing whatever the same listener had pending
    /// for the same target.
    pub fn register(
        &mut self,
        target: PendingTarget,
        listener: Listener,
        action: PendingAction,
    ) -> Option<PendingAction> {
        self.table
            .entry(target)
            .or_default()
            .insert(listener, action)
    }

    pub fn cancel(&mut self, target: PendingTarget, listener: Listener) -> Option<PendingAction> {
        let entry = self.table.get_mut(&target)?;
        let removed = entry.shift_remove(&listener);
        if entry.is_empty() {
            self.table.remove(&target);
        }
        removed
    }

    /// Drain everything waiting on `target`, in registration order.
    pub fn take(&mut self, target: PendingTarget) -> Vec<(Listener, PendingAction)> {
        self.table
            .remove(&target)
            .map(|entry| entry.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, target: PendingTarget, listener: Listener) -> Option<&PendingAction> {
        self.table.get(&target)?.get(&listener)
    }

    pub fn len(&self) -> usize {
        self.table.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PendingTarget, Listener, &PendingAction)> {
        self.table
            .iter()
            .flat_map(|(target, entry)| entry.iter().map(move |(l, a)| (*target, *l, a)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reregistering_replaces_the_pending_action() {
        let mut pending = PendingActions::default();
        let target = PendingTarget::ThreadStarted(5);
        let first = ThreadStateRow {
            thread_id: 5,
            followed: false,
            last_seen_message_id: None,
            change_number: 1,
        };
        let second = ThreadStateRow {
            followed: true,
            change_number: 2,
            ..first.clone()
        };

        assert!(pending
            .register(target, Listener::ThreadState, PendingAction::ApplyThreadState(first.clone()))
            .is_none());
        let replaced = pending.register(
            target,
            Listener::ThreadState,
            PendingAction::ApplyThreadState(second.clone()),
        );
        assert_eq!(replaced, Some(PendingAction::ApplyThreadState(first)));
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending.take(target),
            vec![(Listener::ThreadState, PendingAction::ApplyThreadState(second))]
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn take_preserves_registration_order_and_fires_once() {
        let mut pending = PendingActions::default();
        let target = PendingTarget::Message(10);
        pending.register(target, Listener::Message(12), PendingAction::LinkReply);
        pending.register(target, Listener::Message(11), PendingAction::LinkReply);
        pending.register(target, Listener::Message(12), PendingAction::LinkReply);

        let fired: Vec<_> = pending.take(target).into_iter().map(|(l, _)| l).collect();
        assert_eq!(fired, vec![Listener::Message(12), Listener::Message(11)]);
        assert!(pending.take(target).is_empty());
    }

    #[test]
    fn cancel_drops_empty_targets() {
        let mut pending = PendingActions::default();
        let target = PendingTarget::Message(3);
        pending.register(target, Listener::Message(4), PendingAction::LinkReply);
        assert_eq!(pending.cancel(target, Listener::Message(9)), None);
        assert_eq!(pending.cancel(target, Listener::Message(4)), Some(PendingAction::LinkReply));
        assert!(pending.is_empty());
    }
}
