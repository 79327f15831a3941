//! Choice of sub-queues and the order they are processed in.

use crate::error::{invalid, EngineError};
use crate::message::SubQueue;
use crate::summary::{RunEnd, RunReport, SessionSummary};
use std::fmt;
use std::future::Future;
use std::str::FromStr;

/// Which sub-queues an operation runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubQueueMode {
    Main,
    DeadLetter,
    Both,
}

impl SubQueueMode {
    /// Selected sub-queues, main before dead-letter.
    pub fn sub_queues(&self) -> &'static [SubQueue] {
        match self {
            SubQueueMode::Main => &[SubQueue::Main],
            SubQueueMode::DeadLetter => &[SubQueue::DeadLetter],
            SubQueueMode::Both => &[SubQueue::Main, SubQueue::DeadLetter],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubQueueMode::Main => "normal",
            SubQueueMode::DeadLetter => "dlq",
            SubQueueMode::Both => "both",
        }
    }
}

impl FromStr for SubQueueMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" | "main" => Ok(SubQueueMode::Main),
            "dlq" | "dead-letter" | "deadletter" => Ok(SubQueueMode::DeadLetter),
            "both" => Ok(SubQueueMode::Both),
            _ => Err(invalid(format!(
                "invalid mode '{s}'. Use \"normal\", \"dlq\", or \"both\""
            ))),
        }
    }
}

impl fmt::Display for SubQueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with the remaining sub-queues once a run does not complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    AbortOnFirstFailure,
    ContinueOnError,
}

/// Runs `run` for every sub-queue selected by `mode`, one after the other.
///
/// A cancelled run always stops the session, whatever the policy.
pub async fn run_selected<F, Fut>(
    mode: SubQueueMode,
    policy: FailurePolicy,
    mut run: F,
) -> SessionSummary
where
    F: FnMut(SubQueue) -> Fut,
    Fut: Future<Output = RunReport>,
{
    let mut summary = SessionSummary::default();
    for &sub_queue in mode.sub_queues() {
        let report = run(sub_queue).await;
        let stop = match &report.end {
            RunEnd::Cancelled => true,
            end if !end.is_complete() => policy == FailurePolicy::AbortOnFirstFailure,
            _ => false,
        };
        summary.push(report);
        if stop {
            break;
        }
    }
    summary
}
