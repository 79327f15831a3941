//! Batch retrieval and the cursor used by non-destructive scans.

use crate::error::TransportError;
use crate::message::{Batch, Message};
use crate::transport::QueueReceiver;
use std::time::Duration;

/// How messages are pulled from a sub-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Lock-then-complete. Messages not deleted become visible again when the lock expires.
    Destructive,
    /// Read-only snapshots, paginated with a [`Cursor`].
    Peek,
}

/// Position strictly past the highest sequence number seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor(u64);

impl Cursor {
    pub fn position(&self) -> u64 {
        self.0
    }

    /// Moves past `message`. Never moves backwards.
    pub fn advance_past(&mut self, message: &Message) {
        self.0 = self.0.max(message.sequence_number.saturating_add(1));
    }
}

/// Pulls one batch from `receiver`.
///
/// # Arguments
///
/// * `receiver` - Receiver attached to the sub-queue being scanned
/// * `mode` - Whether messages are locked for deletion or only peeked
/// * `max_count` - Most messages to return
/// * `max_wait` - Longest wait for the first message
/// * `cursor` - Where a peek resumes; ignored by destructive fetches
///
/// # Returns
///
/// The batch, in sequence order. An empty batch means the sub-queue is exhausted.
///
/// # Errors
///
/// Returns the transport error of the underlying receive or peek call.
///
/// # Example
///
/// ```no_run
/// use drainq::memory::MemoryBroker;
/// use drainq::{fetch, Cursor, FetchMode, QueueClient, QueueName, SubQueue};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MemoryBroker::new();
/// broker.send_text("orders", "m0", "hello");
///
/// let client = broker.connect().await?;
/// let receiver = client
///     .open_receiver(&QueueName::new("orders")?, SubQueue::Main)
///     .await?;
///
/// let mut cursor = Cursor::default();
/// let batch = fetch(&receiver, FetchMode::Peek, 10, Duration::from_secs(1), cursor).await?;
/// if let Some(last) = batch.last() {
///     cursor.advance_past(last);
/// }
/// # Ok(())
/// # }
/// ```
pub async fn fetch<R: QueueReceiver>(
    receiver: &R,
    mode: FetchMode,
    max_count: u32,
    max_wait: Duration,
    cursor: Cursor,
) -> Result<Batch, TransportError> {
    match mode {
        FetchMode::Destructive => receiver.receive_batch(max_count, max_wait).await,
        FetchMode::Peek => {
            receiver
                .peek_batch(max_count, cursor.position(), max_wait)
                .await
        }
    }
}
