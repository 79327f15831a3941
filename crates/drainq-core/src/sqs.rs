//! AWS SQS transport.
//!
//! The main sub-queue is the named queue. The dead-letter sub-queue is the
//! queue referenced by the source queue's `RedrivePolicy`.
//!
//! SQS has no peek operation, so peeking long-polls receives with a visibility
//! timeout long enough to cover a scan and never deletes them; they become
//! visible again once the timeout elapses. Each peek still counts as a receive:
//! on a queue with a redrive policy, repeated scans can move messages to the
//! dead letter queue, which is logged as a warning.
//!
//! FIFO `SequenceNumber`s are 128-bit and standard queues have none, so every
//! receiver numbers messages in the order it first sees them. A message
//! received again keeps its number, which keeps it behind the peek cursor.

use crate::config::QueueName;
use crate::error::TransportError;
use crate::message::{Batch, DeadLetterInfo, Message, OutboundMessage, Payload, SubQueue};
use crate::transport::{QueueClient, QueueReceiver, QueueSender, SendFailure, SendReport};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs as sqs;
use sqs::error::DisplayErrorContext;
use sqs::types::{
    MessageAttributeValue, MessageSystemAttributeName, QueueAttributeName,
    SendMessageBatchRequestEntry,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Most messages SQS returns or accepts per call.
pub const MAX_SQS_BATCH: u32 = 10;

/// Longest long-poll SQS allows, in seconds.
pub const MAX_WAIT_SECONDS: i32 = 20;

/// Visibility timeout applied while peeking, in seconds.
pub const PEEK_VISIBILITY_SECONDS: i32 = 120;

/// Message attribute names used to carry fields SQS has no native slot for.
pub mod attributes {
    pub const CONTENT_TYPE: &str = "ContentType";
    pub const SUBJECT: &str = "Subject";
    pub const CORRELATION_ID: &str = "CorrelationId";
    pub const REPLY_TO: &str = "ReplyTo";
    pub const TO: &str = "To";
    pub const TIME_TO_LIVE: &str = "TimeToLive";
    pub const DEAD_LETTER_REASON: &str = "DeadLetterReason";
    pub const DEAD_LETTER_ERROR_DESCRIPTION: &str = "DeadLetterErrorDescription";
}

fn sdk_error<E: std::error::Error>(operation: &'static str, e: E) -> TransportError {
    TransportError::new(operation, DisplayErrorContext(e).to_string())
}

/// SQS client wrapper, connected from a pre-built AWS SDK config.
///
/// # Example
///
/// ```no_run
/// use drainq::SqsClient;
///
/// # async fn example() {
/// let config = aws_config::from_env().load().await;
/// let client = SqsClient::connect(config);
/// # }
/// ```
#[derive(Clone)]
pub struct SqsClient {
    /// The AWS SDK configuration used for SQS operations
    pub config: SdkConfig,
    /// The SQS client instance
    pub client: sqs::Client,
}

impl SqsClient {
    /// Creates a client from a pre-built AWS SDK config, allowing the caller to
    /// configure credentials and endpoints (e.g. LocalStack).
    pub fn connect(config: SdkConfig) -> Self {
        let client = sqs::Client::new(&config);
        Self { config, client }
    }

    /// Resolves a queue name to its URL. URLs are returned unchanged.
    pub async fn queue_url(&self, queue: &str) -> Result<String, TransportError> {
        if QueueName::is_url(queue) {
            return Ok(queue.to_string());
        }
        let output = self
            .client
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| sdk_error("get_queue_url", e))?;
        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| TransportError::new("get_queue_url", format!("queue {queue} not found")))
    }

    /// Reads the redrive policy of a queue, if it has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the attributes cannot be read or the policy is not
    /// valid JSON with a `deadLetterTargetArn`.
    pub async fn redrive_policy(
        &self,
        queue_url: &str,
    ) -> Result<Option<RedrivePolicy>, TransportError> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::RedrivePolicy)
            .send()
            .await
            .map_err(|e| sdk_error("get_queue_attributes", e))?;

        let Some(policy) = output
            .attributes()
            .and_then(|a| a.get(&QueueAttributeName::RedrivePolicy))
        else {
            return Ok(None);
        };
        RedrivePolicy::parse(policy).map(Some).ok_or_else(|| {
            TransportError::new(
                "get_queue_attributes",
                format!("unreadable redrive policy on {queue_url}: {policy}"),
            )
        })
    }

    /// Resolves the dead-letter queue URL from the queue's redrive policy.
    pub async fn dead_letter_url(&self, queue_url: &str) -> Result<String, TransportError> {
        let policy = self.redrive_policy(queue_url).await?.ok_or_else(|| {
            TransportError::new(
                "get_queue_attributes",
                format!("{queue_url} has no dead letter queue configured"),
            )
        })?;
        self.queue_url(&policy.dead_letter_queue).await
    }
}

/// The parts of a queue's `RedrivePolicy` attribute the engine uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    /// Name of the queue failed messages are moved to
    pub dead_letter_queue: String,
    /// Receives after which a message is moved
    pub max_receive_count: Option<u64>,
}

impl RedrivePolicy {
    fn parse(policy: &str) -> Option<Self> {
        let policy: serde_json::Value = serde_json::from_str(policy).ok()?;
        let dead_letter_queue = policy["deadLetterTargetArn"]
            .as_str()?
            .rsplit(':')
            .next()
            .filter(|name| !name.is_empty())?
            .to_string();
        // SQS returns the count as a string, hand-written policies often as a number
        let max_receive_count = match &policy["maxReceiveCount"] {
            serde_json::Value::String(count) => count.parse().ok(),
            other => other.as_u64(),
        };
        Some(Self {
            dead_letter_queue,
            max_receive_count,
        })
    }
}

/// Numbers messages in the order a receiver first sees them.
#[derive(Debug, Default)]
struct ArrivalOrder {
    seen: Mutex<HashMap<String, u64>>,
}

impl ArrivalOrder {
    /// Number of `message_id`, assigning the next one on first sight.
    fn number(&self, message_id: &str) -> u64 {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let next = seen.len() as u64;
        *seen.entry(message_id.to_string()).or_insert(next)
    }
}

#[async_trait]
impl QueueClient for SqsClient {
    type Receiver = SqsReceiver;
    type Sender = SqsSender;

    async fn open_receiver(
        &self,
        queue: &QueueName,
        sub_queue: SubQueue,
    ) -> Result<Self::Receiver, TransportError> {
        let url = self.queue_url(queue.as_str()).await?;
        let queue_url = match sub_queue {
            SubQueue::Main => url,
            SubQueue::DeadLetter => self.dead_letter_url(&url).await?,
        };
        let redrive = self.redrive_policy(&queue_url).await.unwrap_or_else(|e| {
            log::debug!("could not read redrive policy of {queue_url}: {e}");
            None
        });
        log::debug!("opened {sub_queue} receiver on {queue_url}");
        Ok(SqsReceiver {
            client: self.client.clone(),
            queue_url,
            sub_queue,
            arrival: ArrivalOrder::default(),
            redrive,
            redrive_warned: AtomicBool::new(false),
        })
    }

    async fn open_sender(&self, queue: &QueueName) -> Result<Self::Sender, TransportError> {
        let queue_url = self.queue_url(queue.as_str()).await?;
        Ok(SqsSender {
            client: self.client.clone(),
            fifo: queue_url.ends_with(".fifo"),
            queue_url,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        // the SDK client holds no connection that needs an explicit shutdown
        Ok(())
    }
}

/// Receiver attached to one SQS queue URL.
pub struct SqsReceiver {
    client: sqs::Client,
    queue_url: String,
    sub_queue: SubQueue,
    arrival: ArrivalOrder,
    redrive: Option<RedrivePolicy>,
    redrive_warned: AtomicBool,
}

impl SqsReceiver {
    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    async fn receive(
        &self,
        operation: &'static str,
        max_count: u32,
        wait_seconds: i32,
        visibility_timeout: Option<i32>,
    ) -> Result<Vec<sqs::types::Message>, TransportError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_count.clamp(1, MAX_SQS_BATCH) as i32)
            .wait_time_seconds(wait_seconds)
            .set_visibility_timeout(visibility_timeout)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| sdk_error(operation, e))?;

        Ok(output.messages.unwrap_or_default())
    }

    fn warn_redrive_once(&self) {
        let Some(policy) = &self.redrive else {
            return;
        };
        if self.redrive_warned.swap(true, Ordering::Relaxed) {
            return;
        }
        let after = policy
            .max_receive_count
            .map_or_else(|| "its receive limit".to_string(), |n| format!("{n} receives"));
        log::warn!(
            "peeking {} counts as a receive: its redrive policy moves a message to {} after {after}",
            self.queue_url,
            policy.dead_letter_queue
        );
    }
}

fn convert(
    message: sqs::types::Message,
    arrival: &ArrivalOrder,
    sub_queue: SubQueue,
    keep_receipt: bool,
) -> Message {
    let message_id = message.message_id.unwrap_or_default();
    let sequence_number = arrival.number(&message_id);
    from_sqs_message(
        message_id,
        message.body.unwrap_or_default(),
        sequence_number,
        &message.attributes.unwrap_or_default(),
        message.message_attributes.unwrap_or_default(),
        message.receipt_handle.filter(|_| keep_receipt),
        sub_queue,
    )
}

/// Converts peeked messages, dropping those already seen before `from_sequence`.
fn peeked(
    messages: Vec<sqs::types::Message>,
    arrival: &ArrivalOrder,
    sub_queue: SubQueue,
    from_sequence: u64,
) -> Batch {
    let mut batch: Batch = messages
        .into_iter()
        .map(|m| convert(m, arrival, sub_queue, false))
        .filter(|m| m.sequence_number >= from_sequence)
        .collect();
    batch.sort_by_key(|m| m.sequence_number);
    batch
}

fn wait_seconds(max_wait: Duration) -> i32 {
    let secs = max_wait.as_millis().div_ceil(1000);
    i32::try_from(secs).map_or(MAX_WAIT_SECONDS, |s| s.min(MAX_WAIT_SECONDS))
}

fn from_sqs_message(
    message_id: String,
    body: String,
    sequence_number: u64,
    attributes: &HashMap<MessageSystemAttributeName, String>,
    message_attributes: HashMap<String, MessageAttributeValue>,
    receipt_handle: Option<String>,
    sub_queue: SubQueue,
) -> Message {
    let mut properties: BTreeMap<String, serde_json::Value> = message_attributes
        .into_iter()
        .filter_map(|(name, value)| {
            value
                .string_value
                .map(|v| (name, serde_json::Value::String(v)))
        })
        .collect();
    let mut take = |name: &str| match properties.remove(name) {
        Some(serde_json::Value::String(s)) => Some(s),
        _ => None,
    };

    let content_type = take(attributes::CONTENT_TYPE);
    let subject = take(attributes::SUBJECT);
    let correlation_id = take(attributes::CORRELATION_ID);
    let reply_to = take(attributes::REPLY_TO);
    let to = take(attributes::TO);
    let time_to_live = take(attributes::TIME_TO_LIVE)
        .and_then(|ttl| ttl.parse::<u64>().ok())
        .map(Duration::from_secs);
    let reason = take(attributes::DEAD_LETTER_REASON);
    let error_description = take(attributes::DEAD_LETTER_ERROR_DESCRIPTION);

    let dead_letter = match sub_queue {
        SubQueue::DeadLetter => Some(DeadLetterInfo {
            reason,
            error_description,
        }),
        SubQueue::Main => None,
    };

    let body = match content_type.as_deref() {
        Some(ct) if ct.contains("json") => serde_json::from_str(&body)
            .map(Payload::Structured)
            .unwrap_or(Payload::Text(body)),
        _ => Payload::Text(body),
    };

    let enqueued_at = attributes
        .get(&MessageSystemAttributeName::SentTimestamp)
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(chrono::DateTime::from_timestamp_millis);
    let expires_at = match (enqueued_at, time_to_live) {
        (Some(at), Some(ttl)) => chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| at.checked_add_signed(ttl)),
        _ => None,
    };

    Message {
        message_id,
        sequence_number,
        body,
        content_type,
        subject,
        correlation_id,
        session_id: attributes.get(&MessageSystemAttributeName::MessageGroupId).cloned(),
        reply_to,
        to,
        partition_key: None,
        time_to_live,
        properties,
        enqueued_at,
        expires_at,
        dead_letter,
        lock_token: receipt_handle,
    }
}

#[async_trait]
impl QueueReceiver for SqsReceiver {
    async fn receive_batch(
        &self,
        max_count: u32,
        max_wait: Duration,
    ) -> Result<Batch, TransportError> {
        let messages = self
            .receive("receive_batch", max_count, wait_seconds(max_wait), None)
            .await?;
        Ok(messages
            .into_iter()
            .map(|m| convert(m, &self.arrival, self.sub_queue, true))
            .collect())
    }

    async fn peek_batch(
        &self,
        max_count: u32,
        from_sequence: u64,
        max_wait: Duration,
    ) -> Result<Batch, TransportError> {
        self.warn_redrive_once();
        let messages = self
            .receive(
                "peek_batch",
                max_count,
                wait_seconds(max_wait),
                Some(PEEK_VISIBILITY_SECONDS),
            )
            .await?;
        Ok(peeked(messages, &self.arrival, self.sub_queue, from_sequence))
    }

    async fn delete(&self, message: &Message) -> Result<(), TransportError> {
        let receipt_handle = message.lock_token.as_deref().ok_or_else(|| {
            TransportError::new("delete", "message was peeked and cannot be deleted")
        })?;

        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| sdk_error("delete", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Sender publishing to one SQS queue URL.
pub struct SqsSender {
    client: sqs::Client,
    queue_url: String,
    fifo: bool,
}

impl SqsSender {
    fn entry(&self, id: usize, message: &OutboundMessage) -> Result<SendMessageBatchRequestEntry, String> {
        let mut message_attributes = HashMap::new();
        let mut put = |name: &str, value: Option<String>| -> Result<(), String> {
            if let Some(value) = value {
                let attribute = MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(value)
                    .build()
                    .map_err(|e| e.to_string())?;
                message_attributes.insert(name.to_string(), attribute);
            }
            Ok(())
        };

        for (name, value) in &message.properties {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            put(name, Some(value))?;
        }
        put(attributes::CONTENT_TYPE, message.content_type.clone())?;
        put(attributes::SUBJECT, message.subject.clone())?;
        put(attributes::CORRELATION_ID, message.correlation_id.clone())?;
        put(attributes::REPLY_TO, message.reply_to.clone())?;
        put(attributes::TO, message.to.clone())?;
        put(
            attributes::TIME_TO_LIVE,
            message.time_to_live.map(|ttl| ttl.as_secs().to_string()),
        )?;

        let mut builder = SendMessageBatchRequestEntry::builder()
            .id(format!("msg_{id}"))
            .message_body(message.body.as_text())
            .set_message_attributes(Some(message_attributes).filter(|a| !a.is_empty()));
        if self.fifo {
            builder = builder
                .message_group_id(message.session_id.clone().unwrap_or_else(|| "default".to_string()))
                .message_deduplication_id(message.message_id.clone());
        }
        builder.build().map_err(|e| e.to_string())
    }
}

#[async_trait]
impl QueueSender for SqsSender {
    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<SendReport, TransportError> {
        let mut report = SendReport::default();

        for (chunk_index, chunk) in messages.chunks(MAX_SQS_BATCH as usize).enumerate() {
            let offset = chunk_index * MAX_SQS_BATCH as usize;
            let mut entries = Vec::with_capacity(chunk.len());
            for (i, message) in chunk.iter().enumerate() {
                match self.entry(offset + i, message) {
                    Ok(entry) => entries.push(entry),
                    Err(reason) => report.failed.push(SendFailure {
                        index: offset + i,
                        reason,
                    }),
                }
            }
            if entries.is_empty() {
                continue;
            }

            match self
                .client
                .send_message_batch()
                .queue_url(&self.queue_url)
                .set_entries(Some(entries))
                .send()
                .await
            {
                Ok(output) => {
                    for failed in output.failed() {
                        if let Some(index) = entry_index(failed.id()) {
                            report.failed.push(SendFailure {
                                index,
                                reason: failed.message().unwrap_or(failed.code()).to_string(),
                            });
                        }
                    }
                }
                Err(e) => {
                    let reason = DisplayErrorContext(&e).to_string();
                    for i in 0..chunk.len() {
                        if report.is_sent(offset + i) {
                            report.failed.push(SendFailure {
                                index: offset + i,
                                reason: reason.clone(),
                            });
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn entry_index(id: &str) -> Option<usize> {
    id.strip_prefix("msg_")?.parse().ok()
}
