//! Interfaces the engine needs from a queue service.
//!
//! Implemented by [`crate::sqs::SqsClient`] for AWS SQS and by
//! [`crate::memory::MemoryBroker`] for in-process use.

use crate::config::QueueName;
use crate::error::TransportError;
use crate::message::{Batch, Message, OutboundMessage, SubQueue};
use async_trait::async_trait;
use std::time::Duration;

/// A connected queue service. Opened once per process and closed once by its owner.
#[async_trait]
pub trait QueueClient: Send + Sync {
    type Receiver: QueueReceiver;
    type Sender: QueueSender;

    async fn open_receiver(
        &self,
        queue: &QueueName,
        sub_queue: SubQueue,
    ) -> Result<Self::Receiver, TransportError>;

    async fn open_sender(&self, queue: &QueueName) -> Result<Self::Sender, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A handle attached to one sub-queue.
#[async_trait]
pub trait QueueReceiver: Send + Sync {
    /// Locks and returns up to `max_count` messages, waiting at most `max_wait`
    /// for the first one. An empty batch means nothing arrived in time.
    async fn receive_batch(
        &self,
        max_count: u32,
        max_wait: Duration,
    ) -> Result<Batch, TransportError>;

    /// Returns up to `max_count` messages with a sequence number of at least
    /// `from_sequence`, without removing them. Transports that can only
    /// emulate a peek may wait up to `max_wait` for the first message.
    async fn peek_batch(
        &self,
        max_count: u32,
        from_sequence: u64,
        max_wait: Duration,
    ) -> Result<Batch, TransportError>;

    /// Acknowledges a received message, removing it from the sub-queue.
    async fn delete(&self, message: &Message) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A handle that publishes to one queue.
#[async_trait]
pub trait QueueSender: Send + Sync {
    /// Sends every message; entries that were rejected are listed in the report.
    /// An `Err` means none of the messages were accepted.
    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<SendReport, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Per-entry outcome of [`QueueSender::send_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    pub failed: Vec<SendFailure>,
}

/// An entry the destination refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    /// Position of the message in the slice passed to `send_batch`
    pub index: usize,
    pub reason: String,
}

impl SendReport {
    pub fn is_sent(&self, index: usize) -> bool {
        !self.failed.iter().any(|f| f.index == index)
    }

    pub fn failure(&self, index: usize) -> Option<&SendFailure> {
        self.failed.iter().find(|f| f.index == index)
    }
}
