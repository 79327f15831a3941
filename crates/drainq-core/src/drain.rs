//! The batch loop driving one sub-queue run.

use crate::action::MessageAction;
use crate::config::EngineConfig;
use crate::error::RunFailure;
use crate::fetch::{fetch, Cursor, FetchMode};
use crate::message::SubQueue;
use crate::summary::{rate, Progress, RunEnd, RunReport};
use crate::transport::{QueueReceiver, QueueSender};
use log::{debug, error};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Callback receiving a [`Progress`] snapshot after every batch.
pub type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Repeatedly fetches a batch and applies an action until the sub-queue is
/// exhausted, a fetch fails, the limit is reached, or the run is cancelled.
///
/// A short batch does not end the run, only an empty one does. In-batch
/// operations are awaited before the next fetch so at most one batch of
/// messages is locked at a time. Cancellation abandons a pending fetch at
/// once; a batch being applied is tallied with whatever settled before the
/// run ends as cancelled.
pub struct DrainLoop<'a, R, S> {
    receiver: &'a R,
    sub_queue: SubQueue,
    action: &'a MessageAction<'a, S>,
    config: &'a EngineConfig,
    limit: Option<u64>,
    cancel: &'a CancellationToken,
    progress: Option<&'a ProgressFn>,
}

impl<'a, R: QueueReceiver, S: QueueSender> DrainLoop<'a, R, S> {
    pub fn new(
        receiver: &'a R,
        sub_queue: SubQueue,
        action: &'a MessageAction<'a, S>,
        config: &'a EngineConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            receiver,
            sub_queue,
            action,
            config,
            limit: None,
            cancel,
            progress: None,
        }
    }

    /// Stops after `limit` messages have been checked.
    pub fn limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn progress(mut self, progress: Option<&'a ProgressFn>) -> Self {
        self.progress = progress;
        self
    }

    pub async fn run(self) -> RunReport {
        let started = Instant::now();
        let mode = self.action.fetch_mode();
        let mut report = RunReport::new(self.sub_queue, RunEnd::Exhausted);
        let mut cursor = Cursor::default();

        report.end = loop {
            if self.cancel.is_cancelled() {
                break RunEnd::Cancelled;
            }

            let Some(want) = self.next_request_size(report.counters.checked) else {
                break RunEnd::LimitReached;
            };

            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break RunEnd::Cancelled,
                fetched = fetch(self.receiver, mode, want, self.config.max_wait, cursor) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(source) => {
                    error!("{} of {} failed: {source}", self.action.name(), self.sub_queue);
                    break RunEnd::Failed(RunFailure::Fetch {
                        sub_queue: self.sub_queue,
                        source,
                    });
                }
            };

            let Some(last) = batch.last() else {
                break RunEnd::Exhausted;
            };
            if mode == FetchMode::Peek {
                cursor.advance_past(last);
            }

            let batch_started = Instant::now();
            let outcome = self
                .action
                .apply(
                    self.receiver,
                    &batch,
                    self.sub_queue,
                    report.counters.matched,
                    self.cancel,
                )
                .await;
            let batch_elapsed = batch_started.elapsed();

            report.counters.absorb(&outcome);
            report.counters.elapsed = started.elapsed();
            report.snapshots.extend(outcome.snapshots);
            report.matches.extend(outcome.matches);

            debug!(
                "{} {}: batch of {} ({} requested), {} checked, cursor {}",
                self.action.name(),
                self.sub_queue,
                batch.len(),
                want,
                report.counters.checked,
                cursor.position()
            );

            if let Some(progress) = self.progress {
                progress(&Progress {
                    sub_queue: self.sub_queue,
                    counters: report.counters,
                    batch_len: batch.len(),
                    batch_throughput: rate(batch.len() as u64, batch_elapsed),
                });
            }
        };

        report.counters.elapsed = started.elapsed();
        report
    }

    /// Count for the next fetch, or `None` when the limit has been reached.
    fn next_request_size(&self, checked: u64) -> Option<u32> {
        let batch_size = self.config.batch_size;
        match self.limit {
            None => Some(batch_size),
            Some(limit) if checked >= limit => None,
            Some(limit) => {
                let remaining = limit - checked;
                Some(u32::try_from(remaining).map_or(batch_size, |r| r.min(batch_size)))
            }
        }
    }
}
