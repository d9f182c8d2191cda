use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::service::RateGate;

const BASE_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct GateState {
    granted: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    backoff: Option<Duration>,
    last_failure: Option<Instant>,
}

/// Allows `limit` requests per sliding `window`. The last `reserve` slots
/// are only handed to increased-priority requests.
#[derive(Debug)]
pub struct SlidingWindowGate {
    limit: usize,
    reserve: usize,
    window: Duration,
    state: Mutex<GateState>,
}

impl SlidingWindowGate {
    pub fn new(limit: usize, window: Duration) -> Self {
        SlidingWindowGate {
            limit,
            reserve: 1.min(limit),
            window,
            state: Mutex::new(GateState::default()),
        }
    }

    pub fn with_reserve(mut self, reserve: usize) -> Self {
        self.reserve = reserve.min(self.limit);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        // A panic while holding the lock leaves only counters behind.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn check_at(&self, now: Instant, increased_priority: bool) -> bool {
        let mut state = self.lock();
        if let Some(until) = state.blocked_until {
            if now < until {
                return false;
            }
            state.blocked_until = None;
        }
        while let Some(&oldest) = state.granted.front() {
            if now.duration_since(oldest) >= self.window {
                state.granted.pop_front();
            } else {
                break;
            }
        }
        let capacity = if increased_priority {
            self.limit
        } else {
            self.limit - self.reserve
        };
        if state.granted.len() >= capacity {
            debug!(
                "rate gate full ({}/{capacity}, priority={increased_priority})",
                state.granted.len()
            );
            return false;
        }
        state.granted.push_back(now);
        true
    }

    pub(crate) fn rate_limited_at(&self, now: Instant) {
        let mut state = self.lock();
        warn!("rate limit reported, pausing requests for {:?}", self.window);
        state.blocked_until = Some(now + self.window);
    }

    pub(crate) fn back_off_at(&self, now: Instant) {
        let mut state = self.lock();
        let backoff = match (state.backoff, state.last_failure) {
            (Some(current), Some(last)) if now.duration_since(last) < current + self.window => {
                (current * 2).min(MAX_BACKOFF)
            }
            _ => BASE_BACKOFF,
        };
        debug!("backing off for {backoff:?}");
        state.backoff = Some(backoff);
        state.last_failure = Some(now);
        let until = now + backoff;
        state.blocked_until = Some(state.blocked_until.map_or(until, |b| b.max(until)));
    }
}

impl RateGate for SlidingWindowGate {
    fn is_safe_to_request(&self, increased_priority: bool) -> bool {
        self.check_at(Instant::now(), increased_priority)
    }

    fn notify_rate_limit_exceeded(&self) {
        self.rate_limited_at(Instant::now());
    }

    fn back_off(&self) {
        self.back_off_at(Instant::now());
    }
}
