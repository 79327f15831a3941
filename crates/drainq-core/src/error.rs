//! Error types shared by the transports and the engine.

use crate::message::SubQueue;
use crate::summary::SessionSummary;

/// A single failed remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {message}")]
pub struct TransportError {
    /// The transport operation that failed, e.g. `receive_batch`
    pub operation: &'static str,
    /// Human readable cause reported by the transport
    pub message: String,
}

impl TransportError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Why a single sub-queue run stopped before reaching the end of the queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunFailure {
    #[error("failed to open {sub_queue} receiver: {source}")]
    OpenReceiver {
        sub_queue: SubQueue,
        #[source]
        source: TransportError,
    },
    #[error("fetch from {sub_queue} failed: {source}")]
    Fetch {
        sub_queue: SubQueue,
        #[source]
        source: TransportError,
    },
}

/// Result of a public engine entry point that did not complete.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Rejected before any remote call was made.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to open sender for queue {queue}: {source}")]
    OpenSender {
        queue: String,
        #[source]
        source: TransportError,
    },
    /// A run failed or was cancelled. The summary holds everything that
    /// completed up to that point.
    #[error("{}", describe_interruption(.0))]
    Interrupted(SessionSummary),
}

impl EngineError {
    /// Partial progress, if any run was started.
    pub fn summary(&self) -> Option<&SessionSummary> {
        match self {
            EngineError::Interrupted(summary) => Some(summary),
            _ => None,
        }
    }
}

fn describe_interruption(summary: &SessionSummary) -> String {
    match summary.first_interrupted() {
        Some(run) => format!("{} run {}", run.sub_queue, run.end),
        None => "session interrupted".to_string(),
    }
}

/// Shorthand for configuration failures raised while validating input.
pub(crate) fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::InvalidConfiguration(message.into())
}
