//! # drainq-core
//!
//! Batch engine for maintaining a queue and its dead letter queue.
//!
//! The engine repeatedly pulls a bounded batch of messages, applies one
//! operation to every message and stops once the sub-queue is exhausted:
//!
//! - **Drain**: delete every message
//! - **Transfer**: forward every message to another queue, then delete it
//! - **Snapshot**: peek at messages and export a read-only projection
//! - **Search**: peek at messages and record those whose body contains a pattern
//!
//! Each operation runs against the main queue, the dead letter queue, or both.
//! Failures of a single delete or send are counted and logged without stopping
//! the run; a failed fetch ends the run but keeps the counters gathered so far.
//!
//! ## Example
//!
//! ```no_run
//! use drainq::{Engine, EngineConfig, SqsClient, SubQueueMode};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = aws_config::from_env().load().await;
//! let engine = Engine::new(SqsClient::connect(config), EngineConfig::default())?;
//!
//! let summary = engine
//!     .run_search("orders", "ERROR", true, SubQueueMode::Both)
//!     .await;
//! engine.close().await?;
//!
//! for found in summary?.matches() {
//!     println!("{} {}", found.message_id, found.preview);
//! }
//! # Ok(())
//! # }
//! ```

mod action;
mod config;
mod drain;
mod engine;
mod error;
mod fetch;
mod message;
mod selector;
mod summary;

pub mod memory;
pub mod sqs;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use action::{forward_batch, BatchOutcome, ForwardOutcome, Matcher, MessageAction};
pub use config::{EngineConfig, QueueName, DEFAULT_BATCH_SIZE, DEFAULT_MAX_WAIT};
pub use drain::{DrainLoop, ProgressFn};
pub use engine::Engine;
pub use error::{EngineError, RunFailure, TransportError};
pub use fetch::{fetch, Cursor, FetchMode};
pub use message::{
    preview, Batch, DeadLetterInfo, Message, MessageSnapshot, OutboundMessage, Payload,
    SearchMatch, SubQueue, PREVIEW_CHARS, TRACE_PARENT_PROPERTY,
};
pub use selector::{run_selected, FailurePolicy, SubQueueMode};
pub use sqs::SqsClient;
pub use summary::{Progress, RunCounters, RunEnd, RunReport, SessionSummary};
pub use transport::{QueueClient, QueueReceiver, QueueSender, SendFailure, SendReport};
