//! Target selection and sync bookkeeping.
//!
//! The puller is pure: it never touches the network or the store. It picks
//! the next fetch from the in-memory sync state, and turns a response into a
//! [`FetchCommit`] describing exactly what must be written. The engine
//! applies the commit to memory only after the store accepted it, so the
//! in-memory state never runs ahead of what is durable.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::models::{Envelope, FeedId, MessageId, MessagePayload, ReferencePayload, ThreadId};
use crate::core::store::FetchCommit;
use crate::core::sync_state::{Span, SyncSnapshot, SyncingFeed, SyncingThread};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAlgorithm {
    /// Periodically interrupt backfill to look for new content.
    #[default]
    OptimizeReading,
    /// Backfill without freshness interrupts.
    OptimizeHistory,
}

impl fmt::Display for SyncAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncAlgorithm::OptimizeReading => "optimize_reading",
            SyncAlgorithm::OptimizeHistory => "optimize_history",
        })
    }
}

impl FromStr for SyncAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "optimize_reading" => Ok(SyncAlgorithm::OptimizeReading),
            "optimize_history" => Ok(SyncAlgorithm::OptimizeHistory),
            other => Err(format!("unknown sync algorithm {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullerSettings {
    pub algorithm: SyncAlgorithm,
    /// 0 disables the limit.
    pub history_limit_days: u32,
    /// Accept "extended + 1 == reported count" as proof a thread has no gap.
    pub trust_reported_message_counts: bool,
    pub check_new_interval: Duration,
    pub interrupt_interval: Duration,
    pub interrupt_span_cycles: u32,
    pub max_empty_retries: u32,
}

impl Default for PullerSettings {
    fn default() -> Self {
        PullerSettings {
            algorithm: SyncAlgorithm::default(),
            history_limit_days: 0,
            trust_reported_message_counts: false,
            check_new_interval: Duration::minutes(3),
            interrupt_interval: Duration::minutes(7),
            interrupt_span_cycles: 2,
            max_empty_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshenRequest {
    pub id: Uuid,
    pub thread_id: ThreadId,
    pub feed_id: FeedId,
    /// Its gap has been opened in the sync state.
    pub activated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectReason {
    Freshen,
    ThreadGap,
    FreshnessInterrupt,
    Backfill,
    CheckNew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTarget {
    Feed {
        feed_id: FeedId,
        older_than: Option<MessageId>,
        check_new: bool,
    },
    Thread {
        thread_id: ThreadId,
        feed_id: FeedId,
        older_than: Option<MessageId>,
        freshen: Option<Uuid>,
    },
}

impl FetchTarget {
    pub fn feed_id(&self) -> FeedId {
        match self {
            FetchTarget::Feed { feed_id, .. } | FetchTarget::Thread { feed_id, .. } => *feed_id,
        }
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        match self {
            FetchTarget::Feed { .. } => None,
            FetchTarget::Thread { thread_id, .. } => Some(*thread_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    pub target: FetchTarget,
    pub reason: SelectReason,
    pub increased_priority: bool,
}

/// What a thread-gap fetch did to its gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadOutcome {
    Progress { last_pulled: MessageId },
    Closed,
    EmptyRetry { attempts: u32 },
    GaveUp { attempts: u32 },
    /// The gap changed or vanished while the call was in flight; only the
    /// archive is updated.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryProgress {
    /// Some active feed has not fetched anything yet.
    NotStarted,
    /// Every active feed is complete back to at least this instant.
    Reached(DateTime<Utc>),
    Complete,
}

#[derive(Debug, Clone)]
pub struct Puller {
    settings: PullerSettings,
    active_feeds: Vec<FeedId>,
    feeds: BTreeMap<FeedId, SyncingFeed>,
    threads: BTreeMap<ThreadId, SyncingThread>,
    freshen: VecDeque<FreshenRequest>,
}

impl Puller {
    pub fn new(settings: PullerSettings, active_feeds: Vec<FeedId>) -> Self {
        Puller {
            settings,
            active_feeds,
            feeds: BTreeMap::new(),
            threads: BTreeMap::new(),
            freshen: VecDeque::new(),
        }
    }

    pub fn load(&mut self, snapshot: SyncSnapshot) {
        self.feeds = snapshot.feeds.into_iter().map(|f| (f.feed_id, f)).collect();
        self.threads = snapshot
            .threads
            .into_iter()
            .map(|t| (t.thread_id, t))
            .collect();
        info!(
            "sync state loaded: {} feeds, {} open thread gaps",
            self.feeds.len(),
            self.threads.len()
        );
    }

    /// Forget all progress. Freshen requests are left to the caller.
    pub fn reset(&mut self) {
        self.feeds.clear();
        self.threads.clear();
    }

    pub fn settings(&self) -> &PullerSettings {
        &self.settings
    }

    pub fn set_history_limit_days(&mut self, days: u32) {
        self.settings.history_limit_days = days;
    }

    pub fn active_feeds(&self) -> &[FeedId] {
        &self.active_feeds
    }

    pub fn feed(&self, feed_id: FeedId) -> Option<&SyncingFeed> {
        self.feeds.get(&feed_id)
    }

    /// The stored record, or a fresh one for a feed never attempted.
    pub fn feed_record(&self, feed_id: FeedId) -> SyncingFeed {
        self.feeds
            .get(&feed_id)
            .cloned()
            .unwrap_or_else(|| SyncingFeed::new(feed_id))
    }

    pub fn thread(&self, thread_id: ThreadId) -> Option<&SyncingThread> {
        self.threads.get(&thread_id)
    }

    pub fn feeds(&self) -> impl Iterator<Item = &SyncingFeed> {
        self.feeds.values()
    }

    pub fn threads(&self) -> impl Iterator<Item = &SyncingThread> {
        self.threads.values()
    }

    // -- freshen queue -------------------------------------------------------

    pub fn enqueue_freshen(&mut self, request: FreshenRequest) {
        debug!("freshen {} queued for thread {}", request.id, request.thread_id);
        self.freshen.push_back(request);
    }

    pub fn pending_freshen(&self) -> usize {
        self.freshen.len()
    }

    pub fn freshen_request(&self, id: Uuid) -> Option<&FreshenRequest> {
        self.freshen.iter().find(|r| r.id == id)
    }

    /// The head request, if its gap still has to be opened.
    pub fn freshen_needing_gap(&self) -> Option<&FreshenRequest> {
        self.freshen.front().filter(|r| !r.activated)
    }

    /// The gap a freshen request (re)opens: an existing gap restarts from
    /// the newest message, otherwise the gap runs down to what is archived,
    /// or to the thread starter (whose ID is the thread ID) when nothing is.
    pub fn freshen_gap(&self, request: &FreshenRequest, highest_archived: Option<MessageId>) -> SyncingThread {
        match self.threads.get(&request.thread_id) {
            Some(existing) => SyncingThread {
                last_pulled_message_id: None,
                retry_count: 0,
                ..existing.clone()
            },
            None => SyncingThread::new(
                request.thread_id,
                request.feed_id,
                highest_archived.unwrap_or(request.thread_id),
            ),
        }
    }

    pub fn activate_freshen(&mut self, id: Uuid, gap: SyncingThread) {
        if let Some(request) = self.freshen.iter_mut().find(|r| r.id == id) {
            request.activated = true;
        }
        info!("freshen {id} opened gap in thread {} (stop {})", gap.thread_id, gap.stop_message_id);
        self.threads.insert(gap.thread_id, gap);
    }

    pub fn take_freshen(&mut self, id: Uuid) -> Option<FreshenRequest> {
        let index = self.freshen.iter().position(|r| r.id == id)?;
        self.freshen.remove(index)
    }

    /// Remove every activated request for a thread whose gap is gone.
    pub fn take_freshen_for_thread(&mut self, thread_id: ThreadId) -> Vec<FreshenRequest> {
        let (done, keep): (VecDeque<_>, VecDeque<_>) = self
            .freshen
            .drain(..)
            .partition(|r| r.activated && r.thread_id == thread_id);
        self.freshen = keep;
        done.into_iter().collect()
    }

    pub fn cancel_all_freshen(&mut self) -> Vec<FreshenRequest> {
        self.freshen.drain(..).collect()
    }

    /// Pop the head request if it was activated but its gap is already gone.
    pub fn take_orphaned_freshen(&mut self) -> Option<FreshenRequest> {
        let front = self.freshen.front()?;
        if front.activated && !self.threads.contains_key(&front.thread_id) {
            self.freshen.pop_front()
        } else {
            None
        }
    }

    // -- selection -----------------------------------------------------------

    /// Pick the single fetch for this tick, or `None` when up to date.
    pub fn select(&self, now: DateTime<Utc>) -> Option<FetchPlan> {
        if let Some(request) = self.freshen.front().filter(|r| r.activated) {
            if let Some(gap) = self.threads.get(&request.thread_id) {
                return Some(FetchPlan {
                    target: FetchTarget::Thread {
                        thread_id: gap.thread_id,
                        feed_id: gap.feed_id,
                        older_than: gap.last_pulled_message_id,
                        freshen: Some(request.id),
                    },
                    reason: SelectReason::Freshen,
                    increased_priority: true,
                });
            }
        }

        if let Some(gap) = self.threads.values().next() {
            return Some(FetchPlan {
                target: FetchTarget::Thread {
                    thread_id: gap.thread_id,
                    feed_id: gap.feed_id,
                    older_than: gap.last_pulled_message_id,
                    freshen: None,
                },
                reason: SelectReason::ThreadGap,
                increased_priority: false,
            });
        }

        let feeds: Vec<SyncingFeed> = self
            .active_feeds
            .iter()
            .map(|id| self.feed_record(*id))
            .collect();

        if self.settings.algorithm == SyncAlgorithm::OptimizeReading {
            let interrupt = feeds
                .iter()
                .filter(|f| f.span_cycles_since_check_new >= self.settings.interrupt_span_cycles)
                .filter(|f| check_due(f, now, self.settings.interrupt_interval))
                .min_by_key(|f| f.last_check_new_utc);
            if let Some(feed) = interrupt {
                return Some(check_new_plan(feed.feed_id, SelectReason::FreshnessInterrupt));
            }
        }

        let horizon = self.history_horizon(now);
        let backfill = feeds
            .iter()
            .filter(|f| f.needs_backfill())
            .filter(|f| match (horizon, f.next_older_than()) {
                (Some(limit), Some(next)) => next >= limit,
                _ => true,
            })
            // no spans yet sorts as +infinity
            .max_by_key(|f| (f.next_older_than().is_none(), f.next_older_than()));
        if let Some(feed) = backfill {
            return Some(match feed.newest_span() {
                Some(span) => FetchPlan {
                    target: FetchTarget::Feed {
                        feed_id: feed.feed_id,
                        older_than: Some(span.start_message_id),
                        check_new: false,
                    },
                    reason: SelectReason::Backfill,
                    increased_priority: false,
                },
                None => check_new_plan(feed.feed_id, SelectReason::Backfill),
            });
        }

        feeds
            .iter()
            .filter(|f| check_due(f, now, self.settings.check_new_interval))
            .min_by_key(|f| f.last_check_new_utc)
            .map(|feed| check_new_plan(feed.feed_id, SelectReason::CheckNew))
    }

    fn history_horizon(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.settings.history_limit_days > 0)
            .then(|| now - Duration::days(i64::from(self.settings.history_limit_days)))
    }

    pub fn history_progress(&self) -> HistoryProgress {
        let mut reached: Option<DateTime<Utc>> = None;
        for feed_id in &self.active_feeds {
            let feed = self.feed_record(*feed_id);
            if !feed.needs_backfill() {
                continue;
            }
            match feed.next_older_than() {
                None => return HistoryProgress::NotStarted,
                Some(next) => reached = Some(reached.map_or(next, |r| r.max(next))),
            }
        }
        reached.map_or(HistoryProgress::Complete, HistoryProgress::Reached)
    }

    // -- applying responses --------------------------------------------------

    /// Bookkeeping for one feed page. `highest_archived` holds, per thread in
    /// the page, the highest message ID archived before this page.
    pub fn feed_page_commit(
        &self,
        feed_id: FeedId,
        older_than: Option<MessageId>,
        check_new: bool,
        envelope: &Envelope,
        highest_archived: &HashMap<ThreadId, MessageId>,
        now: DateTime<Utc>,
    ) -> FetchCommit {
        let mut feed = self.feed_record(feed_id);
        let mut commit = FetchCommit {
            messages: envelope.all_messages().cloned().collect(),
            references: envelope.references.clone(),
            ..Default::default()
        };

        let starters: Vec<&MessagePayload> = match older_than {
            Some(bound) if !feed_id.is_inbox() => {
                let (older, newer): (Vec<_>, Vec<_>) =
                    envelope.messages.iter().partition(|m| m.id < bound);
                if !newer.is_empty() {
                    warn!(
                        "{feed_id}: {} messages not older than requested {bound}, ignored for spans",
                        newer.len()
                    );
                }
                older
            }
            _ => envelope.messages.iter().collect(),
        };

        match starters.iter().min_by_key(|m| m.id) {
            Some(oldest) => {
                let newest = starters.iter().map(|m| m.id).max().unwrap_or(oldest.id);
                let top = older_than.unwrap_or(newest).max(oldest.id);
                feed.insert_span(Span::new(oldest.id, top, oldest.created_at));
                debug!("{feed_id}: span [{}, {top}] merged, {} spans", oldest.id, feed.spans.len());
            }
            None if envelope.messages.is_empty() => {
                if older_than.is_some() {
                    // Nothing below the newest span: whatever sat between
                    // older spans is gone upstream.
                    if let (Some(first), Some(last)) = (feed.spans.first(), feed.spans.last()) {
                        let collapsed = Span::new(
                            first.start_message_id,
                            last.end_message_id,
                            first.start_time_utc,
                        );
                        feed.spans = vec![collapsed];
                    }
                    feed.reached_empty_result = true;
                    info!("{feed_id}: reached the bottom of history");
                } else if feed.spans.is_empty() {
                    feed.reached_empty_result = true;
                    info!("{feed_id}: feed is empty");
                }
            }
            None => debug!("{feed_id}: page held nothing usable for spans"),
        }

        if check_new {
            feed.span_cycles_since_check_new = 0;
            feed.last_check_new_utc = Some(now);
        } else {
            feed.span_cycles_since_check_new += 1;
        }
        feed.last_update_utc = Some(now);

        let mut seen = HashSet::new();
        for starter in &envelope.messages {
            let thread_id = starter.thread_id;
            if !seen.insert(thread_id) {
                continue;
            }
            let extended = envelope
                .threaded_extended
                .get(&thread_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let existing = self.threads.get(&thread_id);
            let archived = highest_archived.get(&thread_id).copied();
            let floor = existing.map(|g| g.stop_message_id).or(archived);
            let gapped = self.thread_is_gapped(extended, envelope.thread_reference(thread_id), floor);

            match (gapped, existing) {
                (false, Some(_)) => {
                    info!("thread {thread_id}: page closes the open gap");
                    commit.delete_threads.push(thread_id);
                }
                (false, None) => {}
                (true, Some(gap)) => {
                    commit.save_threads.push(SyncingThread {
                        last_pulled_message_id: None,
                        retry_count: 0,
                        ..gap.clone()
                    });
                }
                (true, None) => {
                    let stop = archived.map_or(starter.id, |h| h.max(starter.id));
                    info!("thread {thread_id}: gap opened (stop {stop})");
                    commit
                        .save_threads
                        .push(SyncingThread::new(thread_id, feed_id, stop));
                }
            }
        }

        commit.save_feed = Some(feed);
        commit
    }

    /// Whether a thread starter's page and `floor` (the highest ID known to
    /// be contiguous from the start of the thread) leave a hole.
    fn thread_is_gapped(
        &self,
        extended: &[MessagePayload],
        reference: Option<&ReferencePayload>,
        floor: Option<MessageId>,
    ) -> bool {
        let reported = if self.settings.trust_reported_message_counts {
            reference.and_then(ReferencePayload::thread_message_count)
        } else {
            None
        };
        let Some(lowest) = extended.iter().map(|m| m.id).min() else {
            // Starter alone. Only a trusted count can say otherwise.
            return reported.is_some_and(|count| count > 1);
        };
        if reported == Some(extended.len() as u64 + 1) {
            return false;
        }
        !floor.is_some_and(|floor| lowest <= floor)
    }

    /// Bookkeeping for one thread-gap page fetched with `older_than`.
    pub fn thread_page_commit(
        &self,
        thread_id: ThreadId,
        older_than: Option<MessageId>,
        envelope: &Envelope,
    ) -> (FetchCommit, ThreadOutcome) {
        let mut commit = FetchCommit {
            messages: envelope.all_messages().cloned().collect(),
            references: envelope.references.clone(),
            ..Default::default()
        };
        let Some(gap) = self
            .threads
            .get(&thread_id)
            .filter(|g| g.last_pulled_message_id == older_than)
        else {
            debug!("thread {thread_id}: gap changed while fetching, archiving only");
            return (commit, ThreadOutcome::Stale);
        };
        let mut gap = gap.clone();

        // No downward progress counts as an empty page.
        let lowest = envelope
            .all_messages()
            .filter(|m| m.thread_id == thread_id)
            .map(|m| m.id)
            .filter(|id| older_than.map_or(true, |bound| *id < bound))
            .min();

        let outcome = match lowest {
            Some(lowest) => {
                gap.last_pulled_message_id = Some(lowest);
                gap.retry_count = 0;
                if gap.is_closed() {
                    info!("thread {thread_id}: gap closed at {lowest}");
                    commit.delete_threads.push(thread_id);
                    ThreadOutcome::Closed
                } else {
                    debug!("thread {thread_id}: pulled down to {lowest} (stop {})", gap.stop_message_id);
                    commit.save_threads.push(gap);
                    ThreadOutcome::Progress { last_pulled: lowest }
                }
            }
            None if gap.retry_count >= self.settings.max_empty_retries => {
                let attempts = gap.retry_count + 1;
                warn!("thread {thread_id}: empty after {attempts} attempts, assuming deleted");
                commit.delete_threads.push(thread_id);
                ThreadOutcome::GaveUp { attempts }
            }
            None => {
                gap.retry_count += 1;
                let attempts = gap.retry_count;
                debug!("thread {thread_id}: empty page (attempt {attempts})");
                commit.save_threads.push(gap);
                ThreadOutcome::EmptyRetry { attempts }
            }
        };
        (commit, outcome)
    }

    /// The target was deleted upstream.
    pub fn not_found_commit(&self, target: &FetchTarget) -> FetchCommit {
        match *target {
            FetchTarget::Feed { feed_id, .. } => FetchCommit {
                delete_feed: Some(feed_id),
                ..Default::default()
            },
            FetchTarget::Thread { thread_id, .. } => FetchCommit {
                delete_threads: vec![thread_id],
                purge_thread: Some(thread_id),
                ..Default::default()
            },
        }
    }

    /// Mirror a durable commit into memory.
    pub fn apply_commit(&mut self, commit: &FetchCommit) {
        if let Some(feed) = &commit.save_feed {
            self.feeds.insert(feed.feed_id, feed.clone());
        }
        if let Some(feed_id) = commit.delete_feed {
            self.feeds.remove(&feed_id);
            self.active_feeds.retain(|f| *f != feed_id);
            warn!("{feed_id}: dropped from this session");
        }
        for gap in &commit.save_threads {
            self.threads.insert(gap.thread_id, gap.clone());
        }
        for thread_id in &commit.delete_threads {
            self.threads.remove(thread_id);
        }
    }
}

fn check_due(feed: &SyncingFeed, now: DateTime<Utc>, interval: Duration) -> bool {
    feed.last_check_new_utc
        .map_or(true, |last| now - last > interval)
}

fn check_new_plan(feed_id: FeedId, reason: SelectReason) -> FetchPlan {
    FetchPlan {
        target: FetchTarget::Feed {
            feed_id,
            older_than: None,
            check_new: true,
        },
        reason,
        increased_priority: false,
    }
}
