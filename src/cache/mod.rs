//! In-memory object graph over the core projection.
//!
//! Nodes live in ID-keyed maps and refer to each other by ID. Rows may
//! arrive in any order: anything that needs an entity not loaded yet is
//! parked in [`PendingActions`] and fires when the entity shows up, so the
//! final graph does not depend on arrival order. Aggregates (thread and
//! group membership, read counts, likes) are maintained incrementally and
//! can be cross-checked with [`Cache::check_invariants`].

pub mod batch;
pub mod objects;
pub mod pending;

use std::collections::HashMap;

use log::{debug, warn};

use crate::core::models::{GroupId, MessageId, ThreadId, UserId};
use crate::core::rows::{
    ConversationRow, GroupRow, GroupStateRow, MessageRow, MessageStateRow, ProjectionDelta,
    ThreadRow, ThreadStateRow, UserRow,
};

pub use batch::{CacheChange, ChangeBatch, ChangeKind, EntityKey};
use objects::{insert_sorted, remove_sorted, Membership};
pub use objects::{Group, Loaded, Message, ReplyLink, Thread, User};
pub use pending::{Listener, PendingAction, PendingActions, PendingTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ThreadStatus {
    group_id: Option<GroupId>,
    membership: Membership,
    fully_read: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Cache {
    users: HashMap<UserId, User>,
    groups: HashMap<GroupId, Group>,
    threads: HashMap<ThreadId, Thread>,
    messages: HashMap<MessageId, Message>,
    pending: PendingActions,
    high_water: i64,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(&id)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    pub fn pending(&self) -> &PendingActions {
        &self.pending
    }

    /// Highest change number folded into the graph.
    pub fn high_water(&self) -> i64 {
        self.high_water
    }

    pub fn fetch_user(&mut self, id: UserId) -> &User {
        self.users.entry(id).or_insert_with(|| User::stub(id))
    }

    pub fn fetch_group(&mut self, id: GroupId) -> &Group {
        self.groups.entry(id).or_insert_with(|| Group::stub(id))
    }

    pub fn fetch_thread(&mut self, id: ThreadId) -> &Thread {
        self.threads.entry(id).or_insert_with(|| Thread::stub(id))
    }

    pub fn fetch_message(&mut self, id: MessageId) -> &Message {
        self.messages.entry(id).or_insert_with(|| Message::stub(id))
    }

    /// Live messages of a thread, oldest first.
    pub fn thread_messages(&self, thread_id: ThreadId) -> Vec<&Message> {
        self.threads
            .get(&thread_id)
            .map(|t| t.messages.iter().filter_map(|id| self.messages.get(id)).collect())
            .unwrap_or_default()
    }

    /// Threads with live messages in a group, oldest first.
    pub fn group_threads(&self, group_id: GroupId) -> Vec<&Thread> {
        self.groups
            .get(&group_id)
            .map(|g| g.threads.iter().filter_map(|id| self.threads.get(id)).collect())
            .unwrap_or_default()
    }

    /// Drop everything and load `delta` without emitting notifications.
    pub fn reload(&mut self, delta: &ProjectionDelta) {
        *self = Cache::new();
        let mut batch = ChangeBatch::suppressed();
        self.apply_delta(delta, &mut batch);
        debug!(
            "cache reloaded: {} users, {} groups, {} threads, {} messages",
            self.users.len(),
            self.groups.len(),
            self.threads.len(),
            self.messages.len()
        );
    }

    /// Fold a projection delta into the graph. Rows are applied leaf first,
    /// removals last.
    pub fn apply_delta(&mut self, delta: &ProjectionDelta, batch: &mut ChangeBatch) {
        for row in &delta.users {
            self.apply_user(row.clone(), batch);
        }
        for row in &delta.groups {
            self.apply_group(row.clone(), batch);
        }
        for row in &delta.group_states {
            self.apply_group_state(row.clone(), batch);
        }
        for row in &delta.threads {
            self.apply_thread(row.clone(), batch);
        }
        for row in &delta.messages {
            self.apply_message(row.clone(), batch);
        }
        for row in &delta.message_states {
            self.apply_message_state(row.clone(), batch);
        }
        for row in &delta.thread_states {
            self.apply_thread_state(row.clone(), batch);
        }
        for row in &delta.conversations {
            self.apply_conversation(row.clone(), batch);
        }
        for id in &delta.removed_messages {
            self.remove_message(*id, batch);
        }
        self.high_water = self.high_water.max(delta.high_water);
        debug_assert_eq!(self.check_invariants(), Ok(()));
    }

    pub fn apply_user(&mut self, row: UserRow, batch: &mut ChangeBatch) {
        let id = row.id;
        let user = self.users.entry(id).or_insert_with(|| User::stub(id));
        let kind = if user.row.is_loaded() {
            ChangeKind::PropertyChanged
        } else {
            ChangeKind::Added
        };
        user.row = Loaded::Loaded(row);
        batch.record(EntityKey::User(id), kind);
    }

    pub fn apply_group(&mut self, row: GroupRow, batch: &mut ChangeBatch) {
        let id = row.id;
        let group = self.groups.entry(id).or_insert_with(|| Group::stub(id));
        let kind = if group.row.is_loaded() {
            ChangeKind::PropertyChanged
        } else {
            ChangeKind::Added
        };
        group.row = Loaded::Loaded(row);
        batch.record(EntityKey::Group(id), kind);
    }

    pub fn apply_group_state(&mut self, row: GroupStateRow, batch: &mut ChangeBatch) {
        let id = row.group_id;
        let group = self.groups.entry(id).or_insert_with(|| Group::stub(id));
        group.state = Some(row);
        batch.record(EntityKey::Group(id), ChangeKind::PropertyChanged);
    }

    pub fn apply_thread(&mut self, row: ThreadRow, batch: &mut ChangeBatch) {
        let id = row.id;
        if let Some(group_id) = row.group_id {
            self.ensure_group(group_id);
        }
        let before = self.thread_status(id);
        let thread = self.threads.entry(id).or_insert_with(|| Thread::stub(id));
        let kind = if thread.is_loaded() {
            ChangeKind::PropertyChanged
        } else {
            ChangeKind::Added
        };
        if thread.group_id.is_none() {
            thread.group_id = row.group_id;
        }
        thread.row = Loaded::Loaded(row);
        batch.record(EntityKey::Thread(id), kind);
        self.reconcile_group(id, before, batch);
    }

    pub fn apply_message(&mut self, row: MessageRow, batch: &mut ChangeBatch) {
        let id = row.id;
        let reply_target = row.replied_to_id;
        self.ensure_user(row.sender_id);
        for user_id in row.liked_by.iter().chain(&row.notified_ids) {
            self.ensure_user(*user_id);
        }
        if let Some(group_id) = row.group_id {
            self.ensure_group(group_id);
        }

        if self.messages.get(&id).is_some_and(|m| m.row.is_loaded()) {
            self.detach_message(id, batch);
            self.unlink_reply(id);
            if let Some(message) = self.messages.get_mut(&id) {
                message.row = Loaded::Loaded(row);
            }
            self.attach_message(id, batch);
            if let Some(target) = reply_target {
                self.link_reply(id, target, batch);
            }
            batch.record(EntityKey::Message(id), ChangeKind::PropertyChanged);
            return;
        }

        let message = self.messages.entry(id).or_insert_with(|| Message::stub(id));
        message.row = Loaded::Loaded(row);
        batch.record(EntityKey::Message(id), ChangeKind::Added);

        let mut repliers = Vec::new();
        for (listener, action) in self.pending.take(PendingTarget::Message(id)) {
            match (listener, action) {
                (_, PendingAction::ApplyMessageState(state)) => {
                    if let Some(message) = self.messages.get_mut(&id) {
                        message.state = state;
                    }
                }
                (Listener::Message(reply_id), PendingAction::LinkReply) => repliers.push(reply_id),
                (listener, action) => {
                    warn!("dropping {action:?} from {listener:?} pending on message {id}")
                }
            }
        }

        self.attach_message(id, batch);
        if let Some(target) = reply_target {
            self.link_reply(id, target, batch);
        }
        for reply_id in repliers {
            self.resolve_reply(reply_id, id, batch);
        }
    }

    pub fn apply_message_state(&mut self, row: MessageStateRow, batch: &mut ChangeBatch) {
        let id = row.message_id;
        if !self.messages.get(&id).is_some_and(|m| m.row.is_loaded()) {
            self.pending.register(
                PendingTarget::Message(id),
                Listener::MessageState,
                PendingAction::ApplyMessageState(row),
            );
            return;
        }
        self.detach_message(id, batch);
        if let Some(message) = self.messages.get_mut(&id) {
            message.state = row;
        }
        self.attach_message(id, batch);
        batch.record(EntityKey::Message(id), ChangeKind::PropertyChanged);
    }

    pub fn apply_thread_state(&mut self, row: ThreadStateRow, batch: &mut ChangeBatch) {
        let id = row.thread_id;
        let thread = self.threads.entry(id).or_insert_with(|| Thread::stub(id));
        if thread.started {
            thread.state = Some(row);
            batch.record(EntityKey::Thread(id), ChangeKind::PropertyChanged);
        } else {
            self.pending.register(
                PendingTarget::ThreadStarted(id),
                Listener::ThreadState,
                PendingAction::ApplyThreadState(row),
            );
        }
    }

    pub fn apply_conversation(&mut self, row: ConversationRow, batch: &mut ChangeBatch) {
        for user_id in &row.participant_ids {
            self.ensure_user(*user_id);
        }
        let id = row.thread_id;
        let thread = self.threads.entry(id).or_insert_with(|| Thread::stub(id));
        if thread.started {
            thread.conversation = Some(row);
            batch.record(EntityKey::Thread(id), ChangeKind::PropertyChanged);
        } else {
            self.pending.register(
                PendingTarget::ThreadStarted(id),
                Listener::Conversation,
                PendingAction::ApplyConversation(row),
            );
        }
    }

    /// Take a message out of the graph. Replies to it go back to pending and
    /// its local state is parked until the message returns.
    pub fn remove_message(&mut self, id: MessageId, batch: &mut ChangeBatch) {
        if !self.messages.get(&id).is_some_and(|m| m.row.is_loaded()) {
            return;
        }
        self.detach_message(id, batch);
        self.unlink_reply(id);
        let Some(message) = self.messages.remove(&id) else {
            return;
        };
        for reply_id in &message.replies {
            if let Some(reply) = self.messages.get_mut(reply_id) {
                reply.reply_to = ReplyLink::Pending(id);
                batch.record(EntityKey::Message(*reply_id), ChangeKind::PropertyChanged);
            }
            self.pending.register(
                PendingTarget::Message(id),
                Listener::Message(*reply_id),
                PendingAction::LinkReply,
            );
        }
        let state = message.state;
        if state.read || state.starred || state.deleted {
            self.pending.register(
                PendingTarget::Message(id),
                Listener::MessageState,
                PendingAction::ApplyMessageState(state),
            );
        }
    }

    fn ensure_user(&mut self, id: UserId) {
        self.users.entry(id).or_insert_with(|| User::stub(id));
    }

    fn ensure_group(&mut self, id: GroupId) {
        self.groups.entry(id).or_insert_with(|| Group::stub(id));
    }

    fn thread_status(&self, thread_id: ThreadId) -> ThreadStatus {
        match self.threads.get(&thread_id) {
            Some(thread) => ThreadStatus {
                group_id: thread.group_id,
                membership: thread.membership(),
                fully_read: thread.is_fully_read(),
            },
            None => ThreadStatus {
                group_id: None,
                membership: Membership::Outside,
                fully_read: false,
            },
        }
    }

    /// Move a thread between its group's collections after its status moved
    /// away from `before`.
    fn reconcile_group(&mut self, thread_id: ThreadId, before: ThreadStatus, batch: &mut ChangeBatch) {
        let after = self.thread_status(thread_id);
        if before == after {
            return;
        }
        if let Some(group_id) = before.group_id {
            if let Some(group) = self.groups.get_mut(&group_id) {
                match before.membership {
                    Membership::Active => {
                        remove_sorted(&mut group.threads, thread_id);
                        if before.fully_read {
                            group.read_thread_count -= 1;
                        }
                    }
                    Membership::Deleted => {
                        remove_sorted(&mut group.deleted_threads, thread_id);
                    }
                    Membership::Outside => {}
                }
                batch.record(EntityKey::Group(group_id), ChangeKind::PropertyChanged);
            }
        }
        if let Some(group_id) = after.group_id {
            let group = self
                .groups
                .entry(group_id)
                .or_insert_with(|| Group::stub(group_id));
            match after.membership {
                Membership::Active => {
                    insert_sorted(&mut group.threads, thread_id);
                    if after.fully_read {
                        group.read_thread_count += 1;
                    }
                }
                Membership::Deleted => {
                    insert_sorted(&mut group.deleted_threads, thread_id);
                }
                Membership::Outside => {}
            }
            batch.record(EntityKey::Group(group_id), ChangeKind::PropertyChanged);
        }
    }

    /// Count a loaded message into its thread using its current state.
    fn attach_message(&mut self, id: MessageId, batch: &mut ChangeBatch) {
        let Some((thread_id, group_id, state, likes)) = self.messages.get(&id).and_then(|m| {
            m.row
                .row()
                .map(|r| (r.thread_id, r.group_id, m.state.clone(), r.likes_count))
        }) else {
            return;
        };
        let before = self.thread_status(thread_id);
        let thread = self
            .threads
            .entry(thread_id)
            .or_insert_with(|| Thread::stub(thread_id));
        let was_loaded = thread.is_loaded();
        if thread.group_id.is_none() {
            thread.group_id = group_id;
        }
        if state.deleted {
            insert_sorted(&mut thread.deleted_messages, id);
        } else if insert_sorted(&mut thread.messages, id) {
            if state.read {
                thread.read_message_count += 1;
            }
            thread.total_likes_count += likes;
        }
        let newly_started = !thread.started;
        thread.started = true;
        let kind = if was_loaded {
            ChangeKind::PropertyChanged
        } else {
            ChangeKind::Added
        };
        batch.record(EntityKey::Thread(thread_id), kind);
        self.reconcile_group(thread_id, before, batch);
        if newly_started {
            self.fire_thread_started(thread_id);
        }
    }

    /// Inverse of `attach_message`; must run before the message's row or
    /// state changes.
    fn detach_message(&mut self, id: MessageId, batch: &mut ChangeBatch) {
        let Some((thread_id, state, likes)) = self
            .messages
            .get(&id)
            .and_then(|m| m.row.row().map(|r| (r.thread_id, m.state.clone(), r.likes_count)))
        else {
            return;
        };
        let before = self.thread_status(thread_id);
        let Some(thread) = self.threads.get_mut(&thread_id) else {
            return;
        };
        if state.deleted {
            remove_sorted(&mut thread.deleted_messages, id);
        } else if remove_sorted(&mut thread.messages, id) {
            if state.read {
                thread.read_message_count -= 1;
            }
            thread.total_likes_count -= likes;
        }
        batch.record(EntityKey::Thread(thread_id), ChangeKind::PropertyChanged);
        self.reconcile_group(thread_id, before, batch);
    }

    fn fire_thread_started(&mut self, thread_id: ThreadId) {
        let waiting = self.pending.take(PendingTarget::ThreadStarted(thread_id));
        let Some(thread) = self.threads.get_mut(&thread_id) else {
            return;
        };
        for (listener, action) in waiting {
            match action {
                PendingAction::ApplyThreadState(row) => thread.state = Some(row),
                PendingAction::ApplyConversation(row) => thread.conversation = Some(row),
                other => warn!("dropping {other:?} from {listener:?} pending on thread {thread_id}"),
            }
        }
    }

    fn link_reply(&mut self, id: MessageId, target: MessageId, batch: &mut ChangeBatch) {
        if self.messages.get(&target).is_some_and(|m| m.row.is_loaded()) {
            self.resolve_reply(id, target, batch);
        } else {
            if let Some(message) = self.messages.get_mut(&id) {
                message.reply_to = ReplyLink::Pending(target);
            }
            self.pending.register(
                PendingTarget::Message(target),
                Listener::Message(id),
                PendingAction::LinkReply,
            );
        }
    }

    fn resolve_reply(&mut self, id: MessageId, target: MessageId, batch: &mut ChangeBatch) {
        if let Some(message) = self.messages.get_mut(&id) {
            message.reply_to = ReplyLink::Resolved(target);
            batch.record(EntityKey::Message(id), ChangeKind::PropertyChanged);
        }
        if let Some(target_message) = self.messages.get_mut(&target) {
            insert_sorted(&mut target_message.replies, id);
            batch.record(EntityKey::Message(target), ChangeKind::PropertyChanged);
        }
    }

    fn unlink_reply(&mut self, id: MessageId) {
        let Some(link) = self.messages.get_mut(&id).map(|m| {
            let link = m.reply_to;
            m.reply_to = ReplyLink::None;
            link
        }) else {
            return;
        };
        match link {
            ReplyLink::None => {}
            ReplyLink::Pending(target) => {
                self.pending
                    .cancel(PendingTarget::Message(target), Listener::Message(id));
            }
            ReplyLink::Resolved(target) => {
                if let Some(target_message) = self.messages.get_mut(&target) {
                    remove_sorted(&mut target_message.replies, id);
                }
            }
        }
    }

    /// Recompute every aggregate from scratch and compare against the
    /// incrementally maintained values.
    pub fn check_invariants(&self) -> Result<(), String> {
        for thread in self.threads.values() {
            let mut live = Vec::new();
            let mut deleted = Vec::new();
            let mut read = 0;
            let mut likes = 0;
            for message in self.messages.values() {
                let Some(row) = message.row.row() else { continue };
                if row.thread_id != thread.id {
                    continue;
                }
                if message.state.deleted {
                    deleted.push(message.id);
                } else {
                    live.push(message.id);
                    if message.state.read {
                        read += 1;
                    }
                    likes += row.likes_count;
                }
            }
            live.sort_unstable();
            deleted.sort_unstable();
            if live != thread.messages {
                return Err(format!("thread {} live messages {:?} != {:?}", thread.id, thread.messages, live));
            }
            if deleted != thread.deleted_messages {
                return Err(format!("thread {} deleted messages out of sync", thread.id));
            }
            if read != thread.read_message_count {
                return Err(format!("thread {} read count {} != {}", thread.id, thread.read_message_count, read));
            }
            if likes != thread.total_likes_count {
                return Err(format!("thread {} likes {} != {}", thread.id, thread.total_likes_count, likes));
            }
            if thread.started
                && self
                    .pending
                    .get(PendingTarget::ThreadStarted(thread.id), Listener::ThreadState)
                    .is_some()
            {
                return Err(format!("thread {} started but state still pending", thread.id));
            }
        }

        for group in self.groups.values() {
            let mut active = Vec::new();
            let mut deleted = Vec::new();
            let mut read = 0;
            for thread in self.threads.values().filter(|t| t.group_id == Some(group.id)) {
                match thread.membership() {
                    Membership::Active => {
                        active.push(thread.id);
                        if thread.is_fully_read() {
                            read += 1;
                        }
                    }
                    Membership::Deleted => deleted.push(thread.id),
                    Membership::Outside => {}
                }
            }
            active.sort_unstable();
            deleted.sort_unstable();
            if active != group.threads || deleted != group.deleted_threads {
                return Err(format!("group {} thread collections out of sync", group.id));
            }
            if read != group.read_thread_count {
                return Err(format!("group {} read threads {} != {}", group.id, group.read_thread_count, read));
            }
        }

        for message in self.messages.values() {
            match message.reply_to {
                ReplyLink::None => {}
                ReplyLink::Resolved(target) => {
                    let linked = self
                        .messages
                        .get(&target)
                        .is_some_and(|t| t.row.is_loaded() && t.replies.binary_search(&message.id).is_ok());
                    if !linked {
                        return Err(format!("message {} resolved to {target} without back link", message.id));
                    }
                }
                ReplyLink::Pending(target) => {
                    if self.messages.get(&target).is_some_and(|t| t.row.is_loaded()) {
                        return Err(format!("message {} pending on loaded message {target}", message.id));
                    }
                    if self
                        .pending
                        .get(PendingTarget::Message(target), Listener::Message(message.id))
                        .is_none()
                    {
                        return Err(format!("message {} pending on {target} without listener", message.id));
                    }
                }
            }
            if let Some(row) = message.row.row() {
                if !self.users.contains_key(&row.sender_id) {
                    return Err(format!("message {} sender {} missing", message.id, row.sender_id));
                }
                if !self.threads.contains_key(&row.thread_id) {
                    return Err(format!("message {} thread {} missing", message.id, row.thread_id));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    use crate::core::rows::MessageKind;

    fn message(id: MessageId, thread_id: ThreadId, group_id: Option<GroupId>) -> MessageRow {
        MessageRow {
            id,
            thread_id,
            group_id,
            sender_id: 100 + id % 3,
            replied_to_id: None,
            created_at: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
            body: format!("message {id}"),
            kind: MessageKind::Update,
            likes_count: 0,
            liked_by: Vec::new(),
            notified_ids: Vec::new(),
            change_number: id,
        }
    }

    fn reply(id: MessageId, thread_id: ThreadId, to: MessageId) -> MessageRow {
        MessageRow {
            replied_to_id: Some(to),
            ..message(id, thread_id, Some(1))
        }
    }

    fn state(id: MessageId, read: bool, deleted: bool) -> MessageStateRow {
        MessageStateRow {
            message_id: id,
            read,
            starred: false,
            deleted,
            change_number: 1000 + id,
        }
    }

    fn thread_state(id: ThreadId, followed: bool) -> ThreadStateRow {
        ThreadStateRow {
            thread_id: id,
            followed,
            last_seen_message_id: None,
            change_number: 2000 + id,
        }
    }

    #[test]
    fn reply_links_resolve_regardless_of_arrival_order() {
        let mut target_first = Cache::new();
        let mut batch = ChangeBatch::new();
        target_first.apply_message(message(10, 10, Some(1)), &mut batch);
        target_first.apply_message(reply(11, 10, 10), &mut batch);

        let mut reply_first = Cache::new();
        reply_first.apply_message(reply(11, 10, 10), &mut batch);
        assert_eq!(reply_first.message(11).unwrap().reply_to, ReplyLink::Pending(10));
        assert_eq!(reply_first.pending().len(), 1);
        reply_first.apply_message(message(10, 10, Some(1)), &mut batch);

        assert_eq!(target_first, reply_first);
        assert_eq!(reply_first.message(11).unwrap().reply_to, ReplyLink::Resolved(10));
        assert_eq!(reply_first.message(10).unwrap().replies, vec![11]);
        assert!(reply_first.pending().is_empty());
        assert_eq!(reply_first.check_invariants(), Ok(()));
    }

    #[test]
    fn thread_state_waits_for_first_message() {
        let mut cache = Cache::new();
        let mut batch = ChangeBatch::new();
        cache.apply_thread_state(thread_state(7, false), &mut batch);
        cache.apply_thread_state(thread_state(7, true), &mut batch);
        assert!(cache.thread(7).unwrap().state.is_none());
        assert_eq!(cache.pending().len(), 1);

        cache.apply_message(message(7, 7, Some(1)), &mut batch);
        let thread = cache.thread(7).unwrap();
        assert!(thread.started);
        assert!(thread.state.as_ref().unwrap().followed);
        assert!(cache.pending().is_empty());
    }

    #[test]
    fn aggregates_follow_read_and_delete_transitions() {
        let mut cache = Cache::new();
        let mut batch = ChangeBatch::new();
        cache.apply_message(message(1, 1, Some(9)), &mut batch);
        cache.apply_message(reply(2, 1, 1), &mut batch);
        cache.apply_message(message(3, 3, Some(9)), &mut batch);

        let group = cache.group(9).unwrap();
        assert_eq!(group.threads, vec![1, 3]);
        assert_eq!(group.unread_thread_count(), 2);

        cache.apply_message_state(state(1, true, false), &mut batch);
        assert_eq!(cache.thread(1).unwrap().unread_count(), 1);
        cache.apply_message_state(state(2, true, false), &mut batch);
        assert!(cache.thread(1).unwrap().is_fully_read());
        assert_eq!(cache.group(9).unwrap().read_thread_count, 1);

        cache.apply_message_state(state(3, false, true), &mut batch);
        let group = cache.group(9).unwrap();
        assert!(cache.thread(3).unwrap().is_deleted());
        assert_eq!(group.threads, vec![1]);
        assert_eq!(group.deleted_threads, vec![3]);
        assert_eq!(group.unread_thread_count(), 0);

        cache.apply_message_state(state(3, false, false), &mut batch);
        assert_eq!(cache.group(9).unwrap().threads, vec![1, 3]);
        assert_eq!(cache.check_invariants(), Ok(()));
    }

    #[test]
    fn likes_are_summed_per_thread() {
        let mut cache = Cache::new();
        let mut batch = ChangeBatch::new();
        cache.apply_message(MessageRow { likes_count: 3, ..message(1, 1, None) }, &mut batch);
        cache.apply_message(MessageRow { likes_count: 2, ..reply(2, 1, 1) }, &mut batch);
        assert_eq!(cache.thread(1).unwrap().total_likes_count, 5);

        cache.apply_message(MessageRow { likes_count: 4, ..reply(2, 1, 1) }, &mut batch);
        assert_eq!(cache.thread(1).unwrap().total_likes_count, 7);
        assert_eq!(cache.check_invariants(), Ok(()));
    }

    #[test]
    fn removed_messages_send_replies_back_to_pending() {
        let mut cache = Cache::new();
        let mut batch = ChangeBatch::new();
        cache.apply_message(message(1, 1, Some(1)), &mut batch);
        cache.apply_message(reply(2, 1, 1), &mut batch);
        cache.apply_message_state(state(1, true, false), &mut batch);

        cache.remove_message(1, &mut batch);
        assert!(cache.message(1).is_none());
        assert_eq!(cache.message(2).unwrap().reply_to, ReplyLink::Pending(1));
        assert_eq!(cache.thread(1).unwrap().messages, vec![2]);
        assert_eq!(cache.check_invariants(), Ok(()));

        cache.apply_message(message(1, 1, Some(1)), &mut batch);
        assert_eq!(cache.message(2).unwrap().reply_to, ReplyLink::Resolved(1));
        assert!(cache.message(1).unwrap().is_read());
        assert_eq!(cache.check_invariants(), Ok(()));
    }

    #[test]
    fn referenced_entities_always_exist_as_stubs() {
        let mut cache = Cache::new();
        let mut batch = ChangeBatch::new();
        let mut row = message(5, 5, Some(42));
        row.liked_by = vec![300];
        cache.apply_message(row, &mut batch);

        assert!(!cache.user(102).unwrap().row.is_loaded());
        assert!(!cache.user(300).unwrap().row.is_loaded());
        assert!(!cache.group(42).unwrap().row.is_loaded());

        cache.apply_group(
            GroupRow {
                id: 42,
                full_name: "Engineering".into(),
                privacy: crate::core::rows::GroupPrivacy::Public,
                change_number: 1,
            },
            &mut batch,
        );
        assert!(cache.group(42).unwrap().row.is_loaded());
        assert_eq!(cache.group(42).unwrap().threads, vec![5]);
        assert!(!cache.fetch_user(999).row.is_loaded());
    }

    #[test]
    fn notifications_are_batched_and_reload_is_silent() {
        let mut delta = ProjectionDelta {
            messages: vec![message(1, 1, Some(1)), reply(2, 1, 1)],
            message_states: vec![state(2, true, false)],
            high_water: 3,
            ..Default::default()
        };

        let mut cache = Cache::new();
        let mut batch = ChangeBatch::new();
        cache.apply_delta(&delta, &mut batch);
        let changes = batch.flush();
        assert!(changes.contains(&CacheChange {
            entity: EntityKey::Message(2),
            kind: ChangeKind::Added
        }));
        assert!(changes.contains(&CacheChange {
            entity: EntityKey::Thread(1),
            kind: ChangeKind::Added
        }));
        assert_eq!(cache.high_water(), 3);

        delta.high_water = 9;
        cache.reload(&delta);
        assert_eq!(cache.high_water(), 9);
        assert_eq!(cache.thread(1).unwrap().read_message_count, 1);
    }

    #[derive(Debug, Clone)]
    enum Row {
        Message(MessageRow),
        State(MessageStateRow),
        ThreadState(ThreadStateRow),
        Removed(MessageId),
    }

    fn apply(cache: &mut Cache, row: &Row) {
        let mut batch = ChangeBatch::new();
        match row {
            Row::Message(r) => cache.apply_message(r.clone(), &mut batch),
            Row::State(r) => cache.apply_message_state(r.clone(), &mut batch),
            Row::ThreadState(r) => cache.apply_thread_state(r.clone(), &mut batch),
            Row::Removed(id) => cache.remove_message(*id, &mut batch),
        }
    }

    fn random_rows(rng: &mut StdRng) -> Vec<Row> {
        let mut rows = Vec::new();
        let mut next_id = 1;
        for thread_index in 0..8 {
            let group = Some(1 + thread_index % 3);
            let thread_id = next_id;
            let mut in_thread = Vec::new();
            for _ in 0..rng.gen_range(1..6) {
                let id = next_id;
                next_id += 1;
                let mut row = message(id, thread_id, group);
                row.likes_count = rng.gen_range(0..4);
                if let Some(&target) = in_thread.choose(rng) {
                    row.replied_to_id = Some(target);
                } else if id != thread_id {
                    row.replied_to_id = Some(thread_id);
                }
                if rng.gen_bool(0.1) {
                    // reply to something never archived
                    row.replied_to_id = Some(10_000 + id);
                }
                in_thread.push(id);
                rows.push(Row::Message(row));
                if rng.gen_bool(0.6) {
                    rows.push(Row::State(state(id, rng.gen_bool(0.5), rng.gen_bool(0.2))));
                }
            }
            if rng.gen_bool(0.5) {
                rows.push(Row::ThreadState(thread_state(thread_id, rng.gen_bool(0.5))));
            }
        }
        rows
    }

    #[test]
    fn random_arrival_orders_build_the_same_graph() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let rows = random_rows(&mut rng);
            let mut expected = Cache::new();
            for row in &rows {
                apply(&mut expected, row);
            }
            assert_eq!(expected.check_invariants(), Ok(()));

            let mut shuffled = rows.clone();
            shuffled.shuffle(&mut rng);
            let mut actual = Cache::new();
            for row in &shuffled {
                apply(&mut actual, row);
                assert_eq!(actual.check_invariants(), Ok(()));
            }
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn random_removals_keep_aggregates_consistent() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..30 {
            let mut rows = random_rows(&mut rng);
            let ids: Vec<MessageId> = rows
                .iter()
                .filter_map(|r| match r {
                    Row::Message(m) => Some(m.id),
                    _ => None,
                })
                .collect();
            for id in ids.choose_multiple(&mut rng, 4) {
                rows.push(Row::Removed(*id));
            }
            let mut cache = Cache::new();
            for row in &rows {
                apply(&mut cache, row);
                assert_eq!(cache.check_invariants(), Ok(()));
            }
        }
    }
}
