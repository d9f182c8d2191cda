//! Error types for the sync engine, the store and the network collaborator.

use thiserror::Error;

use crate::core::models::{FeedId, ThreadId};

/// Errors raised by the network collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("not found")]
    NotFound,

    #[error("transport error: {0}")]
    Other(String),
}

/// Errors raised by the durable store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An archived payload carries a value the projector does not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("corrupt sync state: {0}")]
    Corrupt(String),

    #[error("store unavailable")]
    Unavailable,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything the engine can surface to consumers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("rate limit exceeded, retrying later")]
    RateLimitExceeded,

    #[error("deleted upstream (feed {feed:?}, thread {thread:?})")]
    TransportNotFound {
        feed: Option<FeedId>,
        thread: Option<ThreadId>,
    },

    #[error("transport failure: {0}")]
    TransportOther(String),

    #[error("thread {thread_id} returned no messages after {attempts} attempts")]
    EmptyResultAnomaly { thread_id: ThreadId, attempts: u32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("freshen request interrupted")]
    FreshenInterrupted,

    #[error("engine stopped")]
    EngineStopped,
}

impl SyncError {
    /// Recoverable errors leave sync state untouched; the same work item is
    /// retried on a later tick.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimitExceeded | SyncError::TransportOther(_) | SyncError::Store(_)
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Protocol(msg) => SyncError::Protocol(msg),
            other => SyncError::Store(other.to_string()),
        }
    }
}
