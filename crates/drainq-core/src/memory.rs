//! In-process queue service.
//!
//! Behaves like a lock-then-complete broker: received messages stay locked
//! (invisible to further receives) until they are deleted or their locks are
//! released with [`MemoryBroker::release_locks`]. Every queue has a main and a
//! dead-letter sub-queue, and sequence numbers only ever increase.
//!
//! Faults can be injected per message id or per fetch call, which makes the
//! broker suitable for exercising partial-failure paths of the engine.

use crate::config::QueueName;
use crate::error::TransportError;
use crate::message::{Batch, DeadLetterInfo, Message, OutboundMessage, SubQueue};
use crate::transport::{QueueClient, QueueReceiver, QueueSender, SendFailure, SendReport};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Handle counters, used to check that every handle is closed exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub receivers_opened: usize,
    pub receivers_closed: usize,
    pub senders_opened: usize,
    pub senders_closed: usize,
    pub client_closed: usize,
    pub deletes: usize,
    pub send_calls: usize,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_sequence: u64,
    faults: Faults,
    stats: BrokerStats,
}

#[derive(Default)]
struct QueueState {
    main: SubQueueState,
    dead_letter: SubQueueState,
}

impl QueueState {
    fn sub_queue(&mut self, sub_queue: SubQueue) -> &mut SubQueueState {
        match sub_queue {
            SubQueue::Main => &mut self.main,
            SubQueue::DeadLetter => &mut self.dead_letter,
        }
    }
}

#[derive(Default)]
struct SubQueueState {
    messages: BTreeMap<u64, Stored>,
    fetch_sizes: Vec<usize>,
    fetch_calls: usize,
}

struct Stored {
    message: Message,
    locked: bool,
}

#[derive(Default)]
struct Faults {
    send: HashSet<String>,
    send_calls: HashSet<usize>,
    delete: HashSet<String>,
    delete_delay: HashMap<String, Duration>,
    fetch: HashSet<(String, SubQueue, usize)>,
}

/// A queue service held entirely in memory. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a client for this broker.
    pub async fn connect(&self) -> Result<MemoryClient, TransportError> {
        Ok(MemoryClient {
            broker: self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_queue(&self, name: &str) {
        self.lock().queues.entry(name.to_string()).or_default();
    }

    /// Appends `message` to a sub-queue, creating the queue if needed, and
    /// returns the sequence number it was given.
    pub fn enqueue(&self, queue: &str, sub_queue: SubQueue, mut message: Message) -> u64 {
        let mut state = self.lock();
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        message.sequence_number = sequence;
        message.lock_token = None;
        message.enqueued_at.get_or_insert_with(Utc::now);
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .sub_queue(sub_queue)
            .messages
            .insert(
                sequence,
                Stored {
                    message,
                    locked: false,
                },
            );
        sequence
    }

    /// Adds a text message with the given id and body to the main sub-queue.
    pub fn send_text(&self, queue: &str, message_id: &str, body: &str) -> u64 {
        self.enqueue(
            queue,
            SubQueue::Main,
            Message {
                message_id: message_id.to_string(),
                body: body.into(),
                ..Default::default()
            },
        )
    }

    /// Adds a text message to the dead-letter sub-queue with failure metadata.
    pub fn dead_letter_text(
        &self,
        queue: &str,
        message_id: &str,
        body: &str,
        reason: &str,
        error_description: &str,
    ) -> u64 {
        self.enqueue(
            queue,
            SubQueue::DeadLetter,
            Message {
                message_id: message_id.to_string(),
                body: body.into(),
                dead_letter: Some(DeadLetterInfo {
                    reason: Some(reason.to_string()),
                    error_description: Some(error_description.to_string()),
                }),
                ..Default::default()
            },
        )
    }

    /// Messages currently stored in a sub-queue, locked or not, by sequence number.
    pub fn messages(&self, queue: &str, sub_queue: SubQueue) -> Vec<Message> {
        let mut state = self.lock();
        match state.queues.get_mut(queue) {
            Some(q) => q
                .sub_queue(sub_queue)
                .messages
                .values()
                .map(|s| s.message.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self, queue: &str, sub_queue: SubQueue) -> usize {
        let mut state = self.lock();
        state
            .queues
            .get_mut(queue)
            .map_or(0, |q| q.sub_queue(sub_queue).messages.len())
    }

    pub fn is_empty(&self, queue: &str, sub_queue: SubQueue) -> bool {
        self.len(queue, sub_queue) == 0
    }

    /// Sizes of every batch returned from a sub-queue, including empty ones.
    pub fn fetch_sizes(&self, queue: &str, sub_queue: SubQueue) -> Vec<usize> {
        let mut state = self.lock();
        state
            .queues
            .get_mut(queue)
            .map_or_else(Vec::new, |q| q.sub_queue(sub_queue).fetch_sizes.clone())
    }

    /// Makes every locked message of a sub-queue visible again, as if the
    /// locks had expired.
    pub fn release_locks(&self, queue: &str, sub_queue: SubQueue) {
        let mut state = self.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            for stored in q.sub_queue(sub_queue).messages.values_mut() {
                stored.locked = false;
            }
        }
    }

    /// Every send of a message with this id is rejected by the destination.
    pub fn fail_send(&self, message_id: &str) {
        self.lock().faults.send.insert(message_id.to_string());
    }

    /// The `call`-th `send_batch` (1-based, counted across every sender)
    /// fails as a whole and enqueues nothing.
    pub fn fail_send_call(&self, call: usize) {
        self.lock().faults.send_calls.insert(call);
    }

    /// Every delete of a message with this id waits `delay` before it is applied.
    pub fn delay_delete(&self, message_id: &str, delay: Duration) {
        self.lock()
            .faults
            .delete_delay
            .insert(message_id.to_string(), delay);
    }

    /// Every delete of a message with this id fails.
    pub fn fail_delete(&self, message_id: &str) {
        self.lock().faults.delete.insert(message_id.to_string());
    }

    /// The `call`-th fetch (1-based) against the sub-queue fails.
    pub fn fail_fetch(&self, queue: &str, sub_queue: SubQueue, call: usize) {
        self.lock()
            .faults
            .fetch
            .insert((queue.to_string(), sub_queue, call));
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats
    }

    fn fetch(
        &self,
        queue: &str,
        sub_queue: SubQueue,
        operation: &'static str,
        take: impl FnOnce(&mut SubQueueState) -> Batch,
    ) -> Result<Batch, TransportError> {
        let mut state = self.lock();
        let BrokerState { queues, faults, .. } = &mut *state;
        let sub = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::new(operation, format!("queue {queue} not found")))?
            .sub_queue(sub_queue);

        sub.fetch_calls += 1;
        if faults
            .fetch
            .contains(&(queue.to_string(), sub_queue, sub.fetch_calls))
        {
            return Err(TransportError::new(operation, "injected fetch failure"));
        }

        let batch = take(sub);
        sub.fetch_sizes.push(batch.len());
        Ok(batch)
    }
}

/// Client handle of a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryClient {
    broker: MemoryBroker,
}

impl MemoryClient {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl QueueClient for MemoryClient {
    type Receiver = MemoryReceiver;
    type Sender = MemorySender;

    async fn open_receiver(
        &self,
        queue: &QueueName,
        sub_queue: SubQueue,
    ) -> Result<Self::Receiver, TransportError> {
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue.as_str()) {
            return Err(TransportError::new(
                "open_receiver",
                format!("queue {queue} not found"),
            ));
        }
        state.stats.receivers_opened += 1;
        Ok(MemoryReceiver {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            sub_queue,
        })
    }

    async fn open_sender(&self, queue: &QueueName) -> Result<Self::Sender, TransportError> {
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue.as_str()) {
            return Err(TransportError::new(
                "open_sender",
                format!("queue {queue} not found"),
            ));
        }
        state.stats.senders_opened += 1;
        Ok(MemorySender {
            broker: self.broker.clone(),
            queue: queue.to_string(),
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.lock().stats.client_closed += 1;
        Ok(())
    }
}

pub struct MemoryReceiver {
    broker: MemoryBroker,
    queue: String,
    sub_queue: SubQueue,
}

#[async_trait]
impl QueueReceiver for MemoryReceiver {
    async fn receive_batch(
        &self,
        max_count: u32,
        _max_wait: Duration,
    ) -> Result<Batch, TransportError> {
        let queue = self.queue.clone();
        self.broker
            .fetch(&self.queue, self.sub_queue, "receive_batch", |sub| {
                sub.messages
                    .iter_mut()
                    .filter(|(_, stored)| !stored.locked)
                    .take(max_count as usize)
                    .map(|(sequence, stored)| {
                        stored.locked = true;
                        let mut message = stored.message.clone();
                        message.lock_token = Some(format!("{queue}:{sequence}"));
                        message
                    })
                    .collect()
            })
    }

    async fn peek_batch(
        &self,
        max_count: u32,
        from_sequence: u64,
        _max_wait: Duration,
    ) -> Result<Batch, TransportError> {
        self.broker
            .fetch(&self.queue, self.sub_queue, "peek_batch", |sub| {
                sub.messages
                    .range(from_sequence..)
                    .take(max_count as usize)
                    .map(|(_, stored)| stored.message.clone())
                    .collect()
            })
    }

    async fn delete(&self, message: &Message) -> Result<(), TransportError> {
        if message.lock_token.is_none() {
            return Err(TransportError::new(
                "delete",
                "message was peeked and cannot be deleted",
            ));
        }

        let delay = self
            .broker
            .lock()
            .faults
            .delete_delay
            .get(&message.message_id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.broker.lock();
        if state.faults.delete.contains(&message.message_id) {
            return Err(TransportError::new("delete", "injected delete failure"));
        }

        let messages = &mut state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| TransportError::new("delete", format!("queue {} not found", self.queue)))?
            .sub_queue(self.sub_queue)
            .messages;
        match messages.get(&message.sequence_number) {
            Some(stored) if stored.locked => {
                messages.remove(&message.sequence_number);
            }
            _ => {
                return Err(TransportError::new(
                    "delete",
                    format!("lock lost for message {}", message.message_id),
                ))
            }
        }
        state.stats.deletes += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.lock().stats.receivers_closed += 1;
        Ok(())
    }
}

pub struct MemorySender {
    broker: MemoryBroker,
    queue: String,
}

#[async_trait]
impl QueueSender for MemorySender {
    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<SendReport, TransportError> {
        let mut report = SendReport::default();
        let mut accepted = Vec::new();
        {
            let mut state = self.broker.lock();
            state.stats.send_calls += 1;
            if state.faults.send_calls.contains(&state.stats.send_calls) {
                return Err(TransportError::new("send_batch", "injected send failure"));
            }
            for (index, outbound) in messages.iter().enumerate() {
                if state.faults.send.contains(&outbound.message_id) {
                    report.failed.push(SendFailure {
                        index,
                        reason: "injected send failure".to_string(),
                    });
                } else {
                    accepted.push(received_copy(outbound));
                }
            }
        }

        for message in accepted {
            self.broker.enqueue(&self.queue, SubQueue::Main, message);
        }
        Ok(report)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.lock().stats.senders_closed += 1;
        Ok(())
    }
}

fn received_copy(outbound: &OutboundMessage) -> Message {
    let now = Utc::now();
    Message {
        message_id: outbound.message_id.clone(),
        body: outbound.body.clone(),
        content_type: outbound.content_type.clone(),
        subject: outbound.subject.clone(),
        correlation_id: outbound.correlation_id.clone(),
        session_id: outbound.session_id.clone(),
        reply_to: outbound.reply_to.clone(),
        to: outbound.to.clone(),
        time_to_live: outbound.time_to_live,
        properties: outbound.properties.clone(),
        enqueued_at: Some(now),
        expires_at: outbound
            .time_to_live
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl)),
        ..Default::default()
    }
}
