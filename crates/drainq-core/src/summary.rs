//! Counters kept per sub-queue run and their aggregation across a session.

use crate::action::BatchOutcome;
use crate::error::RunFailure;
use crate::message::{MessageSnapshot, SearchMatch, SubQueue};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Monotonic counters of one run (or of a whole session once merged).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    /// Messages fetched and handed to the action
    pub checked: u64,
    pub matched: u64,
    pub moved: u64,
    pub deleted: u64,
    /// Messages whose delete or send failed and were left on the queue
    pub skipped: u64,
    /// Messages sent to the destination whose original could not be deleted
    pub duplicated: u64,
    /// Non-empty batches processed
    pub batches: u64,
    pub elapsed: Duration,
}

impl RunCounters {
    /// Messages handled per second since the run started.
    pub fn throughput(&self) -> f64 {
        rate(self.checked, self.elapsed)
    }

    pub fn merge(&mut self, other: &RunCounters) {
        self.checked += other.checked;
        self.matched += other.matched;
        self.moved += other.moved;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.duplicated += other.duplicated;
        self.batches += other.batches;
        self.elapsed += other.elapsed;
    }

    pub(crate) fn absorb(&mut self, outcome: &BatchOutcome) {
        self.checked += outcome.checked;
        self.matched += outcome.matched;
        self.moved += outcome.moved;
        self.deleted += outcome.deleted;
        self.skipped += outcome.skipped;
        self.duplicated += outcome.duplicated;
        self.batches += 1;
    }
}

pub(crate) fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Snapshot published after every batch for progress display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub sub_queue: SubQueue,
    pub counters: RunCounters,
    /// Size of the batch that was just processed
    pub batch_len: usize,
    /// Messages per second within that batch
    pub batch_throughput: f64,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    /// An empty batch was fetched.
    Exhausted,
    /// The requested number of messages was reached.
    LimitReached,
    Failed(RunFailure),
    Cancelled,
}

impl RunEnd {
    /// Whether the run stopped on its own terms.
    pub fn is_complete(&self) -> bool {
        matches!(self, RunEnd::Exhausted | RunEnd::LimitReached)
    }
}

impl fmt::Display for RunEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEnd::Exhausted => f.write_str("exhausted"),
            RunEnd::LimitReached => f.write_str("reached its limit"),
            RunEnd::Failed(failure) => write!(f, "failed: {failure}"),
            RunEnd::Cancelled => f.write_str("was cancelled"),
        }
    }
}

/// Result of driving one sub-queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub sub_queue: SubQueue,
    pub counters: RunCounters,
    pub end: RunEnd,
    pub snapshots: Vec<MessageSnapshot>,
    pub matches: Vec<SearchMatch>,
}

impl RunReport {
    pub fn new(sub_queue: SubQueue, end: RunEnd) -> Self {
        Self {
            sub_queue,
            counters: RunCounters::default(),
            end,
            snapshots: Vec::new(),
            matches: Vec::new(),
        }
    }
}

/// Aggregated result of every run in one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    runs: Vec<RunReport>,
    totals: RunCounters,
}

impl SessionSummary {
    pub fn push(&mut self, run: RunReport) {
        self.totals.merge(&run.counters);
        self.runs.push(run);
    }

    /// Per sub-queue breakdown, in execution order.
    pub fn runs(&self) -> &[RunReport] {
        &self.runs
    }

    pub fn run(&self, sub_queue: SubQueue) -> Option<&RunReport> {
        self.runs.iter().find(|r| r.sub_queue == sub_queue)
    }

    pub fn totals(&self) -> &RunCounters {
        &self.totals
    }

    pub fn elapsed(&self) -> Duration {
        self.totals.elapsed
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &MessageSnapshot> {
        self.runs.iter().flat_map(|r| r.snapshots.iter())
    }

    pub fn matches(&self) -> impl Iterator<Item = &SearchMatch> {
        self.runs.iter().flat_map(|r| r.matches.iter())
    }

    pub fn is_complete(&self) -> bool {
        self.runs.iter().all(|r| r.end.is_complete())
    }

    pub fn first_interrupted(&self) -> Option<&RunReport> {
        self.runs.iter().find(|r| !r.end.is_complete())
    }
}

impl FromIterator<RunReport> for SessionSummary {
    fn from_iter<T: IntoIterator<Item = RunReport>>(iter: T) -> Self {
        let mut summary = SessionSummary::default();
        for run in iter {
            summary.push(run);
        }
        summary
    }
}
