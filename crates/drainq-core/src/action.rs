//! The per-message operations a drain loop can apply.
//!
//! Every action consumes a whole batch and reports per-message outcomes.
//! Failures of individual deletes or sends are absorbed here: they are logged
//! and counted as skipped, and never abort the batch.

use crate::config::QueueName;
use crate::error::{invalid, EngineError, TransportError};
use crate::fetch::FetchMode;
use crate::message::{preview, Message, MessageSnapshot, OutboundMessage, SearchMatch, SubQueue};
use crate::transport::{QueueReceiver, QueueSender, SendReport};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use log::warn;
use std::collections::HashMap;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Substring predicate evaluated against message bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    pattern: String,
    needle: String,
    case_sensitive: bool,
}

impl Matcher {
    pub fn new(pattern: impl Into<String>, case_sensitive: bool) -> Result<Self, EngineError> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(invalid("search pattern cannot be empty"));
        }
        let needle = if case_sensitive {
            pattern.clone()
        } else {
            pattern.to_lowercase()
        };
        Ok(Self {
            pattern,
            needle,
            case_sensitive,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn is_match(&self, text: &str) -> bool {
        if self.case_sensitive {
            text.contains(&self.needle)
        } else {
            text.to_lowercase().contains(&self.needle)
        }
    }
}

/// Operation applied to every message of a batch.
#[derive(Debug)]
pub enum MessageAction<'a, S> {
    /// Acknowledge and remove.
    Delete,
    /// Copy to `destination`, then remove the original once the copy is accepted.
    ForwardThenDelete {
        sender: &'a S,
        destination: &'a QueueName,
    },
    /// Capture a read-only projection.
    Snapshot,
    /// Record messages whose body contains the pattern.
    Match(&'a Matcher),
}

/// What happened to one message during a forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Sent and deleted from the source.
    Moved,
    /// The destination rejected the copy. The original was left untouched.
    SendFailed(String),
    /// The copy was accepted but the original could not be deleted, or its
    /// delete was abandoned on cancellation, so the message now exists in
    /// both queues.
    SentNotDeleted(TransportError),
}

/// Tally of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub checked: u64,
    pub deleted: u64,
    pub moved: u64,
    pub matched: u64,
    pub skipped: u64,
    pub duplicated: u64,
    pub snapshots: Vec<MessageSnapshot>,
    pub matches: Vec<SearchMatch>,
}

impl<'a, S: QueueSender> MessageAction<'a, S> {
    pub fn fetch_mode(&self) -> FetchMode {
        match self {
            MessageAction::Delete | MessageAction::ForwardThenDelete { .. } => {
                FetchMode::Destructive
            }
            MessageAction::Snapshot | MessageAction::Match(_) => FetchMode::Peek,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageAction::Delete => "drain",
            MessageAction::ForwardThenDelete { .. } => "transfer",
            MessageAction::Snapshot => "snapshot",
            MessageAction::Match(_) => "search",
        }
    }

    /// Applies the action to `batch` and tallies every message of it.
    ///
    /// In-batch deletes run concurrently and are counted as they settle. Once
    /// `cancel` fires, operations still in flight are abandoned: their
    /// messages are counted as skipped and stay locked until the lock expires.
    ///
    /// `matched_before` is the number of matches already recorded in the run and
    /// is used to number new matches.
    pub async fn apply<R: QueueReceiver>(
        &self,
        receiver: &R,
        batch: &[Message],
        sub_queue: SubQueue,
        matched_before: u64,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            checked: batch.len() as u64,
            ..Default::default()
        };

        match self {
            MessageAction::Delete => {
                let deletes = batch
                    .iter()
                    .map(|m| async move { (m, receiver.delete(m).await) });
                let settled = settle_until_cancelled(deletes, cancel).await;
                let abandoned = batch.len() - settled.len();
                for (message, result) in settled {
                    match result {
                        Ok(()) => outcome.deleted += 1,
                        Err(e) => {
                            warn!(
                                "skipped message {} in {sub_queue}: {e}",
                                message.message_id
                            );
                            outcome.skipped += 1;
                        }
                    }
                }
                if abandoned > 0 {
                    warn!("cancelled with {abandoned} deletes in flight in {sub_queue}, those messages stay until their lock expires");
                    outcome.skipped += abandoned as u64;
                }
            }
            MessageAction::ForwardThenDelete {
                sender,
                destination,
            } => {
                let outcomes = forward_batch(*sender, receiver, batch, cancel).await;
                for (message, forwarded) in batch.iter().zip(outcomes) {
                    match forwarded {
                        ForwardOutcome::Moved => outcome.moved += 1,
                        ForwardOutcome::SendFailed(reason) => {
                            warn!(
                                "message {} was not sent to {destination}, leaving it in {sub_queue}: {reason}",
                                message.message_id
                            );
                            outcome.skipped += 1;
                        }
                        ForwardOutcome::SentNotDeleted(e) => {
                            warn!(
                                "message {} was sent to {destination} but not deleted from {sub_queue}, it is now duplicated: {e}",
                                message.message_id
                            );
                            outcome.skipped += 1;
                            outcome.duplicated += 1;
                        }
                    }
                }
            }
            MessageAction::Snapshot => {
                outcome.snapshots = batch
                    .iter()
                    .map(|m| MessageSnapshot::capture(m, sub_queue))
                    .collect();
            }
            MessageAction::Match(matcher) => {
                for message in batch {
                    let text = message.body.as_text();
                    if !matcher.is_match(&text) {
                        continue;
                    }
                    outcome.matched += 1;
                    outcome.matches.push(SearchMatch {
                        ordinal: matched_before + outcome.matched,
                        message_id: message.message_id.clone(),
                        sequence_number: message.sequence_number,
                        enqueued_at: message.enqueued_at,
                        dead_letter: message.dead_letter.clone(),
                        preview: preview(&text),
                        source: sub_queue,
                    });
                }
            }
        }

        outcome
    }
}

/// Two-phase forward of a received batch.
///
/// Phase one sends every copy in a single call. Phase two deletes, concurrently,
/// only the originals whose copy was accepted. The send call is always awaited
/// so its outcome is known; deletes still in flight when `cancel` fires are
/// abandoned and reported as [`ForwardOutcome::SentNotDeleted`].
///
/// # Arguments
///
/// * `sender` - Sender attached to the destination queue
/// * `receiver` - Receiver the batch was received from
/// * `batch` - Received messages; each must carry a lock token
/// * `cancel` - Token that abandons the outstanding deletes
///
/// # Returns
///
/// One [`ForwardOutcome`] per message, in batch order. A failed send call
/// marks every message as [`ForwardOutcome::SendFailed`] and deletes nothing.
///
/// # Example
///
/// ```no_run
/// use drainq::memory::MemoryBroker;
/// use drainq::{forward_batch, ForwardOutcome, QueueClient, QueueName, QueueReceiver, SubQueue};
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MemoryBroker::new();
/// broker.send_text("orders", "m0", "hello");
/// broker.create_queue("archive");
///
/// let client = broker.connect().await?;
/// let receiver = client
///     .open_receiver(&QueueName::new("orders")?, SubQueue::Main)
///     .await?;
/// let sender = client.open_sender(&QueueName::new("archive")?).await?;
///
/// let batch = receiver.receive_batch(10, Duration::from_secs(1)).await?;
/// let outcomes = forward_batch(&sender, &receiver, &batch, &CancellationToken::new()).await;
/// assert!(outcomes.iter().all(|o| *o == ForwardOutcome::Moved));
/// # Ok(())
/// # }
/// ```
pub async fn forward_batch<S: QueueSender, R: QueueReceiver>(
    sender: &S,
    receiver: &R,
    batch: &[Message],
    cancel: &CancellationToken,
) -> Vec<ForwardOutcome> {
    let outbound: Vec<OutboundMessage> = batch.iter().map(OutboundMessage::from).collect();

    let report = match sender.send_batch(&outbound).await {
        Ok(report) => report,
        Err(e) => {
            return batch
                .iter()
                .map(|_| ForwardOutcome::SendFailed(e.to_string()))
                .collect();
        }
    };

    let deletes = batch
        .iter()
        .enumerate()
        .filter(|(i, _)| report.is_sent(*i))
        .map(|(i, m)| async move { (i, receiver.delete(m).await) });
    let mut deletes: HashMap<usize, Result<(), TransportError>> =
        settle_until_cancelled(deletes, cancel)
            .await
            .into_iter()
            .collect();

    (0..batch.len())
        .map(|i| settle(&report, i, &mut deletes))
        .collect()
}

fn settle(
    report: &SendReport,
    index: usize,
    deletes: &mut HashMap<usize, Result<(), TransportError>>,
) -> ForwardOutcome {
    if let Some(failure) = report.failure(index) {
        return ForwardOutcome::SendFailed(failure.reason.clone());
    }
    match deletes.remove(&index) {
        Some(Ok(())) => ForwardOutcome::Moved,
        Some(Err(e)) => ForwardOutcome::SentNotDeleted(e),
        None => ForwardOutcome::SentNotDeleted(TransportError::new(
            "delete",
            "cancelled before the delete completed",
        )),
    }
}

/// Drives `operations` concurrently and returns their outputs in completion
/// order. Once `cancel` fires, outputs that are already ready are kept and the
/// rest are dropped.
async fn settle_until_cancelled<F: Future>(
    operations: impl IntoIterator<Item = F>,
    cancel: &CancellationToken,
) -> Vec<F::Output> {
    let mut pending: FuturesUnordered<F> = operations.into_iter().collect();
    let mut settled = Vec::with_capacity(pending.len());
    loop {
        tokio::select! {
            biased;
            next = pending.next() => match next {
                Some(output) => settled.push(output),
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Some(Some(output)) = pending.next().now_or_never() {
                    settled.push(output);
                }
                break;
            }
        }
    }
    settled
}
