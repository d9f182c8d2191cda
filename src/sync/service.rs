//! Collaborators the engine drives but does not own: the remote feed API and
//! the request budget shared with every other caller of that API.

use futures::future::BoxFuture;

use crate::core::models::{Envelope, FeedId, MessageId, ThreadId};
use crate::error::TransportError;

/// Reverse-paginated message listing. `older_than: None` asks for the newest
/// page; otherwise only messages with an ID below the bound are returned.
pub trait FeedService: Send + Sync + 'static {
    fn get_messages_in_feed(
        &self,
        feed: FeedId,
        older_than: Option<MessageId>,
    ) -> BoxFuture<'static, Result<Envelope, TransportError>>;

    fn get_messages_in_thread(
        &self,
        thread: ThreadId,
        older_than: Option<MessageId>,
    ) -> BoxFuture<'static, Result<Envelope, TransportError>>;
}

/// Admission control for outgoing requests.
pub trait RateGate: Send + Sync + 'static {
    /// Whether a request may go out now. Granting consumes budget.
    fn is_safe_to_request(&self, increased_priority: bool) -> bool;

    /// The service answered with a rate-limit error.
    fn notify_rate_limit_exceeded(&self);

    /// A request failed for some other transport reason.
    fn back_off(&self);
}
