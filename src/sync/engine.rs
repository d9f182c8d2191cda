//! The sync engine actor.
//!
//! One tokio task owns the puller, the cache and the store handle, and is the
//! only place any of them is mutated. Commands arrive on an mpsc queue. A
//! network call is spawned as its own task and its result comes back on a
//! second queue consumed by the same actor, so the actor keeps answering
//! commands while a call is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::puller::{
    FetchPlan, FetchTarget, FreshenRequest, HistoryProgress, Puller, PullerSettings, ThreadOutcome,
};
use super::service::{FeedService, RateGate};
use crate::cache::{Cache, CacheChange, ChangeBatch};
use crate::core::models::{Envelope, FeedId, GroupId, MessageId, ThreadId};
use crate::core::store::{FetchCommit, StoreHandle};
use crate::core::sync_state::{SyncingFeed, SyncingThread};
use crate::error::{SyncError, TransportError};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    UpdatedDatabase,
    CallingService {
        feed_id: FeedId,
        thread_id: Option<ThreadId>,
    },
    Error(SyncError),
    EnabledChanged(bool),
}

/// Result of one `process()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A previous tick is still waiting on the network.
    Busy,
    Disabled,
    UpToDate,
    /// The rate gate refused the call.
    RateGated,
    Fetched(FetchTarget),
    Failed(SyncError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub enabled: bool,
    pub up_to_date: bool,
    pub busy: bool,
    pub history_limit_days: u32,
    pub history_progress: HistoryProgress,
    pub active_feeds: Vec<FeedId>,
    pub feeds: Vec<SyncingFeed>,
    pub open_gaps: Vec<SyncingThread>,
    pub pending_freshen: usize,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub settings: PullerSettings,
    pub feeds: Vec<FeedId>,
    pub enabled: bool,
}

type CacheReader = Box<dyn FnOnce(&Cache) + Send>;
type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum EngineCmd {
    Process {
        reply: oneshot::Sender<TickOutcome>,
    },
    Freshen {
        id: Uuid,
        thread_id: ThreadId,
        done: Reply<()>,
    },
    CancelFreshen {
        id: Uuid,
    },
    FullResync {
        reply: Reply<()>,
    },
    SetEnabled(bool),
    SetHistoryLimit(u32),
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    ReadCache(CacheReader),
    RefreshCache {
        reply: Reply<()>,
    },
    SetMessageState {
        message_id: MessageId,
        read: bool,
        starred: bool,
        deleted: bool,
        reply: Reply<()>,
    },
    SetThreadState {
        thread_id: ThreadId,
        followed: bool,
        last_seen_message_id: Option<MessageId>,
        reply: Reply<()>,
    },
    SetGroupState {
        group_id: GroupId,
        show_in_sidebar: bool,
        last_viewed_utc: Option<DateTime<Utc>>,
        reply: Reply<()>,
    },
}

struct FetchDone {
    token: u64,
    result: Result<Envelope, TransportError>,
}

struct InFlight {
    token: u64,
    plan: FetchPlan,
    /// Resync generation the plan was made in.
    generation: u64,
    reply: oneshot::Sender<TickOutcome>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCmd>,
    events: broadcast::Sender<EngineEvent>,
    cache_events: broadcast::Sender<Vec<CacheChange>>,
}

impl EngineHandle {
    /// Load sync state, catch the projection up, fill the cache and spawn
    /// the actor. Must be called inside a tokio runtime.
    pub async fn start(
        store: StoreHandle,
        service: Arc<dyn FeedService>,
        gate: Arc<dyn RateGate>,
        options: EngineOptions,
    ) -> Result<Self, SyncError> {
        let snapshot = store.load_sync_state().await?;
        let report = store.catch_up().await?;
        for problem in &report.protocol_errors {
            warn!("skipped on startup: {problem}");
        }
        let delta = store.load_all().await?;
        let mut cache = Cache::new();
        cache.reload(&delta);

        let mut puller = Puller::new(options.settings, options.feeds);
        puller.load(snapshot);

        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (cache_events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = Actor {
            store,
            service,
            gate,
            puller,
            cache,
            enabled: options.enabled,
            up_to_date: false,
            generation: 0,
            next_token: 0,
            in_flight: None,
            freshen_waiters: HashMap::new(),
            done_tx,
            events: events.clone(),
            cache_events: cache_events.clone(),
        };
        tokio::spawn(actor.run(cmd_rx, done_rx));
        info!("sync engine started");

        Ok(EngineHandle {
            tx,
            events,
            cache_events,
        })
    }

    fn send(&self, cmd: EngineCmd) -> Result<(), SyncError> {
        self.tx.send(cmd).map_err(|_| SyncError::EngineStopped)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCmd) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Advance one tick. Resolves once the tick's network call (if any) has
    /// been applied.
    pub async fn process(&self) -> Result<TickOutcome, SyncError> {
        self.call(|reply| EngineCmd::Process { reply }).await
    }

    /// Queue an out-of-band refresh of one thread.
    pub fn freshen_thread(&self, thread_id: ThreadId) -> Result<FreshenHandle, SyncError> {
        let id = Uuid::new_v4();
        let (done, rx) = oneshot::channel();
        self.send(EngineCmd::Freshen {
            id,
            thread_id,
            done,
        })?;
        Ok(FreshenHandle {
            id,
            thread_id,
            done: rx,
            tx: self.tx.clone(),
        })
    }

    /// Clear every feed and thread record. Archived data stays.
    pub async fn request_full_resync(&self) -> Result<(), SyncError> {
        self.call(|reply| EngineCmd::FullResync { reply }).await?
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), SyncError> {
        self.send(EngineCmd::SetEnabled(enabled))
    }

    /// 0 disables the limit.
    pub fn set_history_limit_days(&self, days: u32) -> Result<(), SyncError> {
        self.send(EngineCmd::SetHistoryLimit(days))
    }

    pub async fn status(&self) -> Result<EngineStatus, SyncError> {
        self.call(|reply| EngineCmd::Status { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Batched cache notifications, one message per logical update.
    pub fn subscribe_cache(&self) -> broadcast::Receiver<Vec<CacheChange>> {
        self.cache_events.subscribe()
    }

    /// Run `f` against the cache on the engine task.
    pub async fn read_cache<R, F>(&self, f: F) -> Result<R, SyncError>
    where
        F: FnOnce(&Cache) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let reader: CacheReader = Box::new(move |cache| {
            let _ = reply.send(f(cache));
        });
        self.send(EngineCmd::ReadCache(reader))?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Pull projection changes made outside the engine into the cache.
    pub async fn refresh_cache(&self) -> Result<(), SyncError> {
        self.call(|reply| EngineCmd::RefreshCache { reply }).await?
    }

    pub async fn set_message_state(
        &self,
        message_id: MessageId,
        read: bool,
        starred: bool,
        deleted: bool,
    ) -> Result<(), SyncError> {
        self.call(|reply| EngineCmd::SetMessageState {
            message_id,
            read,
            starred,
            deleted,
            reply,
        })
        .await?
    }

    pub async fn set_thread_state(
        &self,
        thread_id: ThreadId,
        followed: bool,
        last_seen_message_id: Option<MessageId>,
    ) -> Result<(), SyncError> {
        self.call(|reply| EngineCmd::SetThreadState {
            thread_id,
            followed,
            last_seen_message_id,
            reply,
        })
        .await?
    }

    pub async fn set_group_state(
        &self,
        group_id: GroupId,
        show_in_sidebar: bool,
        last_viewed_utc: Option<DateTime<Utc>>,
    ) -> Result<(), SyncError> {
        self.call(|reply| EngineCmd::SetGroupState {
            group_id,
            show_in_sidebar,
            last_viewed_utc,
            reply,
        })
        .await?
    }

    /// Call `process()` every `interval` until the engine stops. The poller
    /// keeps the engine alive; abort the returned task to stop it.
    pub fn spawn_poller(&self, interval: Duration) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match handle.process().await {
                    Ok(outcome) => debug!("poll: {outcome:?}"),
                    Err(_) => break,
                }
            }
        })
    }
}

/// Completion handle for a freshen request.
pub struct FreshenHandle {
    id: Uuid,
    thread_id: ThreadId,
    done: oneshot::Receiver<Result<(), SyncError>>,
    tx: mpsc::UnboundedSender<EngineCmd>,
}

impl FreshenHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Mark the request failed. A call already in flight still completes
    /// and its data is kept.
    pub fn cancel(&self) {
        let _ = self.tx.send(EngineCmd::CancelFreshen { id: self.id });
    }

    pub async fn wait(self) -> Result<(), SyncError> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(SyncError::EngineStopped),
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor {
    store: StoreHandle,
    service: Arc<dyn FeedService>,
    gate: Arc<dyn RateGate>,
    puller: Puller,
    cache: Cache,
    enabled: bool,
    up_to_date: bool,
    generation: u64,
    next_token: u64,
    in_flight: Option<InFlight>,
    freshen_waiters: HashMap<Uuid, Reply<()>>,
    done_tx: mpsc::UnboundedSender<FetchDone>,
    events: broadcast::Sender<EngineEvent>,
    cache_events: broadcast::Sender<Vec<CacheChange>>,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<EngineCmd>,
        mut done_rx: mpsc::UnboundedReceiver<FetchDone>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                Some(done) = done_rx.recv() => self.finish_tick(done).await,
            }
        }
        for (_, waiter) in self.freshen_waiters.drain() {
            let _ = waiter.send(Err(SyncError::EngineStopped));
        }
        info!("sync engine stopped");
    }

    async fn handle(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::Process { reply } => self.start_tick(reply).await,
            EngineCmd::Freshen {
                id,
                thread_id,
                done,
            } => {
                let feed_id = self.feed_for_thread(thread_id);
                self.freshen_waiters.insert(id, done);
                self.puller.enqueue_freshen(FreshenRequest {
                    id,
                    thread_id,
                    feed_id,
                    activated: false,
                });
            }
            EngineCmd::CancelFreshen { id } => {
                if self.puller.take_freshen(id).is_some() {
                    info!("freshen {id} cancelled");
                    self.complete_freshen(id, Err(SyncError::FreshenInterrupted));
                }
            }
            EngineCmd::FullResync { reply } => {
                let result = self.full_resync().await;
                let _ = reply.send(result);
            }
            EngineCmd::SetEnabled(enabled) => {
                if self.enabled != enabled {
                    self.enabled = enabled;
                    info!("sync {}", if enabled { "enabled" } else { "disabled" });
                    self.emit(EngineEvent::EnabledChanged(enabled));
                }
            }
            EngineCmd::SetHistoryLimit(days) => {
                self.puller.set_history_limit_days(days);
                self.up_to_date = false;
            }
            EngineCmd::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineCmd::ReadCache(reader) => reader(&self.cache),
            EngineCmd::RefreshCache { reply } => {
                let result = self.refresh_cache().await;
                let _ = reply.send(result);
            }
            EngineCmd::SetMessageState {
                message_id,
                read,
                starred,
                deleted,
                reply,
            } => {
                let result = match self
                    .store
                    .set_message_state(message_id, read, starred, deleted)
                    .await
                {
                    Ok(()) => self.refresh_cache().await,
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            EngineCmd::SetThreadState {
                thread_id,
                followed,
                last_seen_message_id,
                reply,
            } => {
                let result = match self
                    .store
                    .set_thread_state(thread_id, followed, last_seen_message_id)
                    .await
                {
                    Ok(()) => self.refresh_cache().await,
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            EngineCmd::SetGroupState {
                group_id,
                show_in_sidebar,
                last_viewed_utc,
                reply,
            } => {
                let result = match self
                    .store
                    .set_group_state(group_id, show_in_sidebar, last_viewed_utc)
                    .await
                {
                    Ok(()) => self.refresh_cache().await,
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
        }
    }

    // -- ticks ---------------------------------------------------------------

    async fn start_tick(&mut self, reply: oneshot::Sender<TickOutcome>) {
        if self.in_flight.is_some() {
            let _ = reply.send(TickOutcome::Busy);
            return;
        }
        if !self.enabled {
            let _ = reply.send(TickOutcome::Disabled);
            return;
        }
        if let Err(e) = self.prepare_freshen().await {
            self.surface(&e);
            let _ = reply.send(TickOutcome::Failed(e));
            return;
        }

        let Some(plan) = self.puller.select(Utc::now()) else {
            if !self.up_to_date {
                info!("up to date");
            }
            self.up_to_date = true;
            let _ = reply.send(TickOutcome::UpToDate);
            return;
        };
        self.up_to_date = false;

        if !self.gate.is_safe_to_request(plan.increased_priority) {
            debug!("rate gate refused {:?}", plan.target);
            let _ = reply.send(TickOutcome::RateGated);
            return;
        }

        debug!("tick ({:?}): {:?}", plan.reason, plan.target);
        self.emit(EngineEvent::CallingService {
            feed_id: plan.target.feed_id(),
            thread_id: plan.target.thread_id(),
        });
        let call = match plan.target {
            FetchTarget::Feed {
                feed_id, older_than, ..
            } => self.service.get_messages_in_feed(feed_id, older_than),
            FetchTarget::Thread {
                thread_id,
                older_than,
                ..
            } => self.service.get_messages_in_thread(thread_id, older_than),
        };
        self.next_token += 1;
        let token = self.next_token;
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let result = call.await;
            let _ = done.send(FetchDone { token, result });
        });
        self.in_flight = Some(InFlight {
            token,
            plan,
            generation: self.generation,
            reply,
        });
    }

    /// Open the gap for the head freshen request, and retire a head request
    /// whose gap closed some other way.
    async fn prepare_freshen(&mut self) -> Result<(), SyncError> {
        while let Some(request) = self.puller.take_orphaned_freshen() {
            self.complete_freshen(request.id, Ok(()));
        }
        let Some(request) = self.puller.freshen_needing_gap().cloned() else {
            return Ok(());
        };
        let highest = if self.puller.thread(request.thread_id).is_some() {
            None
        } else {
            self.store
                .highest_archived(vec![request.thread_id])
                .await?
                .get(&request.thread_id)
                .copied()
        };
        let gap = self.puller.freshen_gap(&request, highest);
        self.store.save_thread(gap.clone()).await?;
        self.puller.activate_freshen(request.id, gap);
        Ok(())
    }

    async fn finish_tick(&mut self, done: FetchDone) {
        if !self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.token == done.token)
        {
            warn!("dropping result of unknown call {}", done.token);
            return;
        }
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        let outcome = match self.apply_result(&in_flight, done.result).await {
            Ok(()) => TickOutcome::Fetched(in_flight.plan.target),
            Err(e) => {
                self.surface(&e);
                TickOutcome::Failed(e)
            }
        };
        let _ = in_flight.reply.send(outcome);
    }

    async fn apply_result(
        &mut self,
        in_flight: &InFlight,
        result: Result<Envelope, TransportError>,
    ) -> Result<(), SyncError> {
        let target = in_flight.plan.target;
        let current = in_flight.generation == self.generation;
        let envelope = match result {
            Ok(envelope) => envelope,
            Err(TransportError::RateLimited) => {
                self.gate.notify_rate_limit_exceeded();
                return Err(SyncError::RateLimitExceeded);
            }
            Err(TransportError::Other(msg)) => {
                self.gate.back_off();
                return Err(SyncError::TransportOther(msg));
            }
            Err(TransportError::NotFound) => return self.handle_not_found(target, current).await,
        };
        let now = Utc::now();

        if !current {
            debug!("sync state reset during the call, archiving only");
            let commit = FetchCommit {
                messages: envelope.all_messages().cloned().collect(),
                references: envelope.references.clone(),
                ..Default::default()
            };
            return self.commit(commit, now, None).await;
        }

        match target {
            FetchTarget::Feed {
                feed_id,
                older_than,
                check_new,
            } => {
                let mut thread_ids: Vec<ThreadId> =
                    envelope.messages.iter().map(|m| m.thread_id).collect();
                thread_ids.sort_unstable();
                thread_ids.dedup();
                let highest = self.store.highest_archived(thread_ids).await?;
                let commit = self.puller.feed_page_commit(
                    feed_id, older_than, check_new, &envelope, &highest, now,
                );
                info!(
                    "{feed_id}: {} starters, {} messages archived",
                    envelope.messages.len(),
                    commit.messages.len()
                );
                self.commit(commit, now, None).await
            }
            FetchTarget::Thread {
                thread_id,
                older_than,
                freshen,
                ..
            } => {
                self.check_freshen_target(freshen, thread_id);
                let (commit, outcome) = self.puller.thread_page_commit(thread_id, older_than, &envelope);
                match outcome {
                    ThreadOutcome::GaveUp { attempts } => {
                        let err = SyncError::EmptyResultAnomaly {
                            thread_id,
                            attempts,
                        };
                        self.commit(commit, now, Some((thread_id, err.clone())))
                            .await?;
                        Err(err)
                    }
                    ThreadOutcome::EmptyRetry { attempts } => {
                        warn!("thread {thread_id}: empty page, attempt {attempts}");
                        self.commit(commit, now, None).await
                    }
                    _ => self.commit(commit, now, None).await,
                }
            }
        }
    }

    async fn handle_not_found(&mut self, target: FetchTarget, current: bool) -> Result<(), SyncError> {
        let err = match target {
            FetchTarget::Feed { feed_id, .. } => SyncError::TransportNotFound {
                feed: Some(feed_id),
                thread: None,
            },
            FetchTarget::Thread { thread_id, .. } => SyncError::TransportNotFound {
                feed: None,
                thread: Some(thread_id),
            },
        };
        if current {
            let commit = self.puller.not_found_commit(&target);
            let failure = target.thread_id().map(|t| (t, err.clone()));
            self.commit(commit, Utc::now(), failure).await?;
        }
        Err(err)
    }

    /// A freshen-driven fetch must be for the request's own thread.
    fn check_freshen_target(&mut self, freshen: Option<Uuid>, thread_id: ThreadId) {
        let Some(id) = freshen else { return };
        let Some(expected) = self.puller.freshen_request(id).map(|r| r.thread_id) else {
            return;
        };
        if expected != thread_id {
            let err = SyncError::StateMachine(format!(
                "freshen {id} is for thread {expected} but thread {thread_id} was fetched"
            ));
            self.puller.take_freshen(id);
            self.surface(&err);
            self.complete_freshen(id, Err(err));
        }
    }

    /// Make `commit` durable, then mirror it into the puller and the cache.
    /// Freshen requests whose gap the commit removes are completed, failing
    /// with `failure` for its thread.
    async fn commit(
        &mut self,
        commit: FetchCommit,
        now: DateTime<Utc>,
        failure: Option<(ThreadId, SyncError)>,
    ) -> Result<(), SyncError> {
        let report = self.store.commit_fetch(commit.clone(), now).await?;
        self.puller.apply_commit(&commit);

        for thread_id in &commit.delete_threads {
            let result = match &failure {
                Some((failed, err)) if failed == thread_id => Err(err.clone()),
                _ => Ok(()),
            };
            for request in self.puller.take_freshen_for_thread(*thread_id) {
                self.complete_freshen(request.id, result.clone());
            }
        }

        for problem in report.protocol_errors {
            self.surface(&SyncError::Protocol(problem));
        }
        self.emit(EngineEvent::UpdatedDatabase);
        if let Err(e) = self.refresh_cache().await {
            self.surface(&e);
        }
        Ok(())
    }

    async fn full_resync(&mut self) -> Result<(), SyncError> {
        self.store.clear_sync_state().await?;
        self.puller.reset();
        self.generation += 1;
        self.up_to_date = false;
        for request in self.puller.cancel_all_freshen() {
            self.complete_freshen(request.id, Err(SyncError::FreshenInterrupted));
        }
        info!("full resync: sync state cleared");
        Ok(())
    }

    async fn refresh_cache(&mut self) -> Result<(), SyncError> {
        let delta = self.store.changes_since(self.cache.high_water()).await?;
        if delta.is_empty() {
            return Ok(());
        }
        let mut batch = ChangeBatch::new();
        self.cache.apply_delta(&delta, &mut batch);
        let changes = batch.flush();
        debug!("cache updated: {} changes up to {}", changes.len(), delta.high_water);
        if !changes.is_empty() {
            let _ = self.cache_events.send(changes);
        }
        Ok(())
    }

    // -- helpers -------------------------------------------------------------

    fn feed_for_thread(&self, thread_id: ThreadId) -> FeedId {
        if let Some(gap) = self.puller.thread(thread_id) {
            return gap.feed_id;
        }
        match self.cache.thread(thread_id) {
            Some(thread) if thread.conversation.is_some() => FeedId::PrivateConversations,
            Some(thread) => thread.group_id.map_or(FeedId::AllCompany, FeedId::Group),
            None => FeedId::AllCompany,
        }
    }

    fn complete_freshen(&mut self, id: Uuid, result: Result<(), SyncError>) {
        if let Some(waiter) = self.freshen_waiters.remove(&id) {
            let _ = waiter.send(result);
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            enabled: self.enabled,
            up_to_date: self.up_to_date,
            busy: self.in_flight.is_some(),
            history_limit_days: self.puller.settings().history_limit_days,
            history_progress: self.puller.history_progress(),
            active_feeds: self.puller.active_feeds().to_vec(),
            feeds: self.puller.feeds().cloned().collect(),
            open_gaps: self.puller.threads().cloned().collect(),
            pending_freshen: self.puller.pending_freshen(),
        }
    }

    fn surface(&self, err: &SyncError) {
        if err.is_recoverable() {
            warn!("{err}");
        } else {
            error!("{err}");
        }
        self.emit(EngineEvent::Error(err.clone()));
    }

    fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
