//! End-to-end engine runs against a scripted feed service and a temporary
//! database.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::oneshot;

use feedkeeper::cache::{EntityKey, ChangeKind};
use feedkeeper::core::models::{Envelope, FeedId, MessageId, MessagePayload, ReferencePayload, ThreadId};
use feedkeeper::core::store::StoreHandle;
use feedkeeper::error::{SyncError, TransportError};
use feedkeeper::sync::{
    EngineEvent, EngineHandle, EngineOptions, FeedService, FetchTarget, HistoryProgress,
    PullerSettings, RateGate, TickOutcome,
};

const GROUP: i64 = 3;
const G: FeedId = FeedId::Group(GROUP);

// -- fakes ------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Call {
    Feed(FeedId, Option<MessageId>),
    Thread(ThreadId, Option<MessageId>),
}

#[derive(Default)]
struct Script {
    responses: HashMap<Call, VecDeque<Result<Envelope, TransportError>>>,
    calls: Vec<Call>,
    hold: Option<oneshot::Receiver<()>>,
}

/// Answers scripted calls in order; anything unscripted gets an empty page.
#[derive(Clone, Default)]
struct FakeService {
    script: Arc<Mutex<Script>>,
}

impl FakeService {
    fn respond(&self, call: Call, result: Result<Envelope, TransportError>) {
        let mut script = self.script.lock().unwrap();
        script.responses.entry(call).or_default().push_back(result);
    }

    fn calls(&self) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }

    /// The next call blocks until the returned sender fires.
    fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.script.lock().unwrap().hold = Some(rx);
        tx
    }

    fn answer(&self, call: Call) -> BoxFuture<'static, Result<Envelope, TransportError>> {
        let (result, hold) = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(call);
            let result = script
                .responses
                .get_mut(&call)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(Envelope::default()));
            (result, script.hold.take())
        };
        async move {
            if let Some(hold) = hold {
                let _ = hold.await;
            }
            result
        }
        .boxed()
    }
}

impl FeedService for FakeService {
    fn get_messages_in_feed(
        &self,
        feed: FeedId,
        older_than: Option<MessageId>,
    ) -> BoxFuture<'static, Result<Envelope, TransportError>> {
        self.answer(Call::Feed(feed, older_than))
    }

    fn get_messages_in_thread(
        &self,
        thread: ThreadId,
        older_than: Option<MessageId>,
    ) -> BoxFuture<'static, Result<Envelope, TransportError>> {
        self.answer(Call::Thread(thread, older_than))
    }
}

#[derive(Default)]
struct OpenGate {
    closed: AtomicBool,
    rate_limited: AtomicUsize,
    back_offs: AtomicUsize,
}

impl RateGate for OpenGate {
    fn is_safe_to_request(&self, _increased_priority: bool) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn notify_rate_limit_exceeded(&self) {
        self.rate_limited.fetch_add(1, Ordering::SeqCst);
    }

    fn back_off(&self) {
        self.back_offs.fetch_add(1, Ordering::SeqCst);
    }
}

// -- payload builders -------------------------------------------------------

fn message(id: MessageId, thread_id: ThreadId) -> MessagePayload {
    let created_at = Utc.timestamp_opt(1_700_000_000 + id * 60, 0).unwrap();
    serde_json::from_value(json!({
        "id": id,
        "thread_id": thread_id,
        "group_id": GROUP,
        "sender_id": 7,
        "created_at": created_at.to_rfc3339(),
        "body": { "plain": format!("message {id}") },
        "message_type": "update"
    }))
    .unwrap()
}

fn thread_ref(id: ThreadId, count: u64) -> ReferencePayload {
    serde_json::from_value(json!({
        "type": "thread",
        "id": id,
        "group_id": GROUP,
        "stats": { "messages_count": count }
    }))
    .unwrap()
}

fn group_ref() -> ReferencePayload {
    serde_json::from_value(json!({
        "type": "group", "id": GROUP, "full_name": "Engineering", "privacy": "public"
    }))
    .unwrap()
}

/// A feed page: each entry is a thread starter (thread ID = starter ID) with
/// its extended replies.
fn feed_page(threads: &[(MessageId, &[MessageId])]) -> Envelope {
    let mut envelope = Envelope {
        references: vec![group_ref()],
        ..Envelope::default()
    };
    for (starter, extended) in threads {
        envelope.messages.push(message(*starter, *starter));
        if !extended.is_empty() {
            envelope.threaded_extended.insert(
                *starter,
                extended.iter().map(|id| message(*id, *starter)).collect(),
            );
        }
    }
    envelope
}

fn thread_page(thread_id: ThreadId, ids: &[MessageId]) -> Envelope {
    Envelope {
        messages: ids.iter().map(|id| message(*id, thread_id)).collect(),
        ..Envelope::default()
    }
}

// -- harness ----------------------------------------------------------------

struct Harness {
    _dir: TempDir,
    db: std::path::PathBuf,
    engine: EngineHandle,
    service: FakeService,
    gate: Arc<OpenGate>,
}

async fn start(dir: TempDir, feeds: Vec<FeedId>, settings: PullerSettings, enabled: bool) -> Harness {
    let db = dir.path().join("feedkeeper.db");
    let service = FakeService::default();
    let gate = Arc::new(OpenGate::default());
    let store = StoreHandle::open(db.clone()).unwrap();
    let engine = EngineHandle::start(
        store,
        Arc::new(service.clone()),
        gate.clone(),
        EngineOptions {
            settings,
            feeds,
            enabled,
        },
    )
    .await
    .unwrap();
    Harness {
        _dir: dir,
        db,
        engine,
        service,
        gate,
    }
}

async fn harness(feeds: Vec<FeedId>) -> Harness {
    start(TempDir::new().unwrap(), feeds, PullerSettings::default(), true).await
}

fn check_new(feed_id: FeedId) -> TickOutcome {
    TickOutcome::Fetched(FetchTarget::Feed {
        feed_id,
        older_than: None,
        check_new: true,
    })
}

async fn thread_ids(engine: &EngineHandle, thread_id: ThreadId) -> Vec<MessageId> {
    engine
        .read_cache(move |cache| {
            cache
                .thread_messages(thread_id)
                .iter()
                .map(|m| m.id)
                .collect()
        })
        .await
        .unwrap()
}

// -- scenarios --------------------------------------------------------------

#[tokio::test]
async fn feed_page_gap_is_closed_then_history_completes() {
    let settings = PullerSettings {
        trust_reported_message_counts: true,
        ..PullerSettings::default()
    };
    let h = start(TempDir::new().unwrap(), vec![G], settings, true).await;
    let mut page = feed_page(&[(30, &[35, 36]), (20, &[21])]);
    page.references.push(thread_ref(30, 5));
    page.references.push(thread_ref(20, 2));
    h.service.respond(Call::Feed(G, None), Ok(page));
    h.service
        .respond(Call::Thread(30, None), Ok(thread_page(30, &[36, 35, 34])));
    h.service
        .respond(Call::Thread(30, Some(34)), Ok(thread_page(30, &[33, 30])));

    assert_eq!(h.engine.process().await.unwrap(), check_new(G));
    let status = h.engine.status().await.unwrap();
    assert_eq!(status.open_gaps.len(), 1);
    assert_eq!(status.open_gaps[0].thread_id, 30);
    assert_eq!(status.open_gaps[0].stop_message_id, 30);
    assert!(matches!(status.history_progress, HistoryProgress::Reached(_)));

    for _ in 0..2 {
        assert!(matches!(
            h.engine.process().await.unwrap(),
            TickOutcome::Fetched(FetchTarget::Thread { thread_id: 30, .. })
        ));
    }
    assert_eq!(
        h.engine.process().await.unwrap(),
        TickOutcome::Fetched(FetchTarget::Feed {
            feed_id: G,
            older_than: Some(20),
            check_new: false
        })
    );
    assert_eq!(h.engine.process().await.unwrap(), TickOutcome::UpToDate);

    assert_eq!(
        h.service.calls(),
        vec![
            Call::Feed(G, None),
            Call::Thread(30, None),
            Call::Thread(30, Some(34)),
            Call::Feed(G, Some(20)),
        ]
    );

    let status = h.engine.status().await.unwrap();
    assert!(status.up_to_date);
    assert!(status.open_gaps.is_empty());
    assert_eq!(status.history_progress, HistoryProgress::Complete);
    let feed = &status.feeds[0];
    assert!(feed.reached_empty_result);
    assert_eq!(feed.spans.len(), 1);
    assert_eq!(feed.spans[0].start_message_id, 20);

    assert_eq!(thread_ids(&h.engine, 30).await, vec![30, 33, 34, 35, 36]);
    assert_eq!(thread_ids(&h.engine, 20).await, vec![20, 21]);
    let (threads, unread) = h
        .engine
        .read_cache(|cache| {
            let group = cache.group(GROUP).unwrap();
            (group.threads.clone(), group.unread_thread_count())
        })
        .await
        .unwrap();
    assert_eq!(threads, vec![20, 30]);
    assert_eq!(unread, 2);
}

#[tokio::test]
async fn disabled_engine_does_not_call_the_service() {
    let h = start(TempDir::new().unwrap(), vec![G], PullerSettings::default(), false).await;
    let mut events = h.engine.subscribe();

    assert_eq!(h.engine.process().await.unwrap(), TickOutcome::Disabled);
    assert!(h.service.calls().is_empty());

    h.engine.set_enabled(true).unwrap();
    assert_eq!(h.engine.process().await.unwrap(), check_new(G));
    assert_eq!(events.recv().await.unwrap(), EngineEvent::EnabledChanged(true));
    assert_eq!(
        events.recv().await.unwrap(),
        EngineEvent::CallingService {
            feed_id: G,
            thread_id: None
        }
    );
    assert_eq!(events.recv().await.unwrap(), EngineEvent::UpdatedDatabase);
}

#[tokio::test]
async fn second_tick_is_refused_while_a_call_is_in_flight() {
    let h = harness(vec![G]).await;
    let release = h.service.hold_next();

    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.process().await });
    while h.service.calls().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(h.engine.process().await.unwrap(), TickOutcome::Busy);
    assert!(h.engine.status().await.unwrap().busy);

    release.send(()).unwrap();
    assert_eq!(first.await.unwrap().unwrap(), check_new(G));
    assert_eq!(h.service.calls().len(), 1);
    assert!(!h.engine.status().await.unwrap().busy);
}

#[tokio::test]
async fn closed_gate_defers_the_fetch() {
    let h = harness(vec![G]).await;
    h.gate.closed.store(true, Ordering::SeqCst);
    assert_eq!(h.engine.process().await.unwrap(), TickOutcome::RateGated);
    assert!(h.service.calls().is_empty());

    h.gate.closed.store(false, Ordering::SeqCst);
    assert_eq!(h.engine.process().await.unwrap(), check_new(G));
}

#[tokio::test]
async fn freshen_pulls_the_thread_down_to_what_is_archived() {
    let h = harness(vec![G]).await;
    h.service.respond(Call::Feed(G, None), Ok(feed_page(&[(10, &[])])));
    h.engine.process().await.unwrap();
    assert!(h.engine.status().await.unwrap().open_gaps.is_empty());

    h.service
        .respond(Call::Thread(10, None), Ok(thread_page(10, &[12, 11, 10])));
    let freshen = h.engine.freshen_thread(10).unwrap();
    assert_eq!(
        h.engine.process().await.unwrap(),
        TickOutcome::Fetched(FetchTarget::Thread {
            thread_id: 10,
            feed_id: G,
            older_than: None,
            freshen: Some(freshen.id()),
        })
    );
    freshen.wait().await.unwrap();

    assert_eq!(thread_ids(&h.engine, 10).await, vec![10, 11, 12]);
    let status = h.engine.status().await.unwrap();
    assert!(status.open_gaps.is_empty());
    assert_eq!(status.pending_freshen, 0);
}

#[tokio::test]
async fn cancelled_freshen_reports_interrupted() {
    let h = harness(vec![G]).await;
    let freshen = h.engine.freshen_thread(10).unwrap();
    freshen.cancel();
    assert_eq!(freshen.wait().await, Err(SyncError::FreshenInterrupted));
    assert_eq!(h.engine.status().await.unwrap().pending_freshen, 0);
}

#[tokio::test]
async fn thread_deleted_upstream_fails_its_freshen() {
    let h = harness(vec![G]).await;
    let mut events = h.engine.subscribe();
    h.service.respond(Call::Thread(50, None), Err(TransportError::NotFound));

    let freshen = h.engine.freshen_thread(50).unwrap();
    let expected = SyncError::TransportNotFound {
        feed: None,
        thread: Some(50),
    };
    assert_eq!(
        h.engine.process().await.unwrap(),
        TickOutcome::Failed(expected.clone())
    );
    assert_eq!(freshen.wait().await, Err(expected.clone()));
    assert!(h.engine.status().await.unwrap().open_gaps.is_empty());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        saw_error |= event == EngineEvent::Error(expected.clone());
    }
    assert!(saw_error);
}

#[tokio::test]
async fn feed_deleted_upstream_leaves_the_active_set() {
    let gone = FeedId::Group(99);
    let h = harness(vec![gone]).await;
    h.service.respond(Call::Feed(gone, None), Err(TransportError::NotFound));

    assert_eq!(
        h.engine.process().await.unwrap(),
        TickOutcome::Failed(SyncError::TransportNotFound {
            feed: Some(gone),
            thread: None
        })
    );
    let status = h.engine.status().await.unwrap();
    assert!(status.active_feeds.is_empty());
    assert!(status.feeds.is_empty());
    assert_eq!(h.engine.process().await.unwrap(), TickOutcome::UpToDate);
}

#[tokio::test]
async fn transport_failures_leave_sync_state_untouched() {
    let h = harness(vec![G]).await;
    h.service.respond(Call::Feed(G, None), Err(TransportError::RateLimited));
    h.service
        .respond(Call::Feed(G, None), Err(TransportError::Other("connection reset".into())));

    assert_eq!(
        h.engine.process().await.unwrap(),
        TickOutcome::Failed(SyncError::RateLimitExceeded)
    );
    assert_eq!(h.gate.rate_limited.load(Ordering::SeqCst), 1);
    assert!(h.engine.status().await.unwrap().feeds.is_empty());

    assert_eq!(
        h.engine.process().await.unwrap(),
        TickOutcome::Failed(SyncError::TransportOther("connection reset".into()))
    );
    assert_eq!(h.gate.back_offs.load(Ordering::SeqCst), 1);
    assert!(h.engine.status().await.unwrap().feeds.is_empty());

    // the same work item is retried
    assert_eq!(h.engine.process().await.unwrap(), check_new(G));
    let status = h.engine.status().await.unwrap();
    assert!(status.feeds[0].reached_empty_result);
}

#[tokio::test]
async fn empty_thread_pages_give_up_after_four_attempts() {
    let h = harness(vec![G]).await;
    h.service
        .respond(Call::Feed(G, None), Ok(feed_page(&[(40, &[45])])));
    h.engine.process().await.unwrap();
    assert_eq!(h.engine.status().await.unwrap().open_gaps.len(), 1);

    for _ in 0..3 {
        assert!(matches!(
            h.engine.process().await.unwrap(),
            TickOutcome::Fetched(FetchTarget::Thread { thread_id: 40, .. })
        ));
    }
    assert_eq!(
        h.engine.process().await.unwrap(),
        TickOutcome::Failed(SyncError::EmptyResultAnomaly {
            thread_id: 40,
            attempts: 4
        })
    );
    assert!(h.engine.status().await.unwrap().open_gaps.is_empty());
    let thread_calls = h
        .service
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Thread(40, None)))
        .count();
    assert_eq!(thread_calls, 4);
}

#[tokio::test]
async fn full_resync_keeps_the_archive() {
    let h = harness(vec![G]).await;
    h.service.respond(Call::Feed(G, None), Ok(feed_page(&[(10, &[])])));
    h.engine.process().await.unwrap();
    // one backfill page finds the bottom
    assert_eq!(
        h.engine.process().await.unwrap(),
        TickOutcome::Fetched(FetchTarget::Feed {
            feed_id: G,
            older_than: Some(10),
            check_new: false
        })
    );
    assert_eq!(h.engine.process().await.unwrap(), TickOutcome::UpToDate);
    assert_eq!(
        h.engine.status().await.unwrap().history_progress,
        HistoryProgress::Complete
    );

    let queued = h.engine.freshen_thread(77).unwrap();
    h.engine.request_full_resync().await.unwrap();
    assert_eq!(queued.wait().await, Err(SyncError::FreshenInterrupted));

    let status = h.engine.status().await.unwrap();
    assert!(status.feeds.is_empty());
    assert!(!status.up_to_date);
    assert_eq!(status.history_progress, HistoryProgress::NotStarted);

    assert_eq!(h.engine.process().await.unwrap(), check_new(G));
    assert_eq!(thread_ids(&h.engine, 10).await, vec![10]);
}

#[tokio::test]
async fn local_state_changes_reach_the_cache() {
    let h = harness(vec![G]).await;
    h.service.respond(Call::Feed(G, None), Ok(feed_page(&[(10, &[])])));
    h.engine.process().await.unwrap();
    let mut changes = h.engine.subscribe_cache();

    let unread = |engine: &EngineHandle| {
        let engine = engine.clone();
        async move {
            engine
                .read_cache(|cache| cache.group(GROUP).map(|g| g.unread_thread_count()))
                .await
                .unwrap()
        }
    };
    assert_eq!(unread(&h.engine).await, Some(1));

    h.engine.set_message_state(10, true, false, false).await.unwrap();
    assert_eq!(unread(&h.engine).await, Some(0));

    let batch = changes.recv().await.unwrap();
    assert!(batch
        .iter()
        .any(|c| c.entity == EntityKey::Message(10) && c.kind == ChangeKind::PropertyChanged));
}

#[tokio::test]
async fn restart_resumes_from_persisted_state() {
    let h = harness(vec![G]).await;
    h.service
        .respond(Call::Feed(G, None), Ok(feed_page(&[(40, &[45])])));
    h.engine.process().await.unwrap();
    let before = h.engine.status().await.unwrap();

    let Harness { _dir, db, engine, .. } = h;
    drop(engine);

    let store = StoreHandle::open(db).unwrap();
    let service = FakeService::default();
    let engine = EngineHandle::start(
        store,
        Arc::new(service.clone()),
        Arc::new(OpenGate::default()),
        EngineOptions {
            settings: PullerSettings::default(),
            feeds: vec![G],
            enabled: true,
        },
    )
    .await
    .unwrap();

    let after = engine.status().await.unwrap();
    assert_eq!(after.feeds, before.feeds);
    assert_eq!(after.open_gaps, before.open_gaps);
    assert_eq!(thread_ids(&engine, 40).await, vec![40, 45]);

    assert!(matches!(
        engine.process().await.unwrap(),
        TickOutcome::Fetched(FetchTarget::Thread { thread_id: 40, .. })
    ));
    assert_eq!(service.calls(), vec![Call::Thread(40, None)]);
}
