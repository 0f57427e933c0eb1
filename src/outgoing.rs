use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::time::Duration;
use tokio::time::Instant;

use crate::message::Message;

/// The transmission side of the underlying pipe: the one thing the reliability layer
///  can do with it is hand over a message, plus query the liveness parameters that
///  drive staleness and idle detection.
///
/// This is a trait to facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Outgoing: Send + Sync + 'static {
    /// Hands a message to the underlying channel. `Ok(false)` means the channel did not
    ///  accept the message right now; `Err` means it is broken. Either way the caller
    ///  keeps the chunk queued and retries later.
    async fn send(&self, msg: Message) -> anyhow::Result<bool>;

    /// The oldest age a pending chunk may reach before the connection is considered stale.
    fn max_retry_age(&self) -> Duration;

    fn idle_timeout(&self) -> Duration;

    fn last_accessed(&self) -> Instant;

    fn set_last_accessed(&self, at: Instant);
}
