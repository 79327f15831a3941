//! Entry points used by the CLI: drain, transfer, snapshot and search.

use crate::action::{Matcher, MessageAction};
use crate::config::{EngineConfig, QueueName};
use crate::drain::{DrainLoop, ProgressFn};
use crate::error::{invalid, EngineError, RunFailure, TransportError};
use crate::message::SubQueue;
use crate::selector::{run_selected, FailurePolicy, SubQueueMode};
use crate::summary::{Progress, RunEnd, RunReport, SessionSummary};
use crate::transport::{QueueClient, QueueReceiver, QueueSender};
use log::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Batch queue-operation engine bound to one connected client.
///
/// The engine does not close the client on its own; call [`Engine::close`]
/// once every operation is done, whether they succeeded or not.
///
/// # Example
///
/// ```no_run
/// use drainq::{Engine, EngineConfig, SqsClient, SubQueueMode};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = aws_config::from_env().load().await;
/// let engine = Engine::new(SqsClient::connect(config), EngineConfig::default())?;
///
/// let result = engine.run_drain("orders", SubQueueMode::DeadLetter).await;
/// engine.close().await?;
///
/// println!("deleted {}", result?.totals().deleted);
/// # Ok(())
/// # }
/// ```
pub struct Engine<C: QueueClient> {
    client: C,
    config: EngineConfig,
    policy: FailurePolicy,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl<C: QueueClient> Engine<C> {
    pub fn new(client: C, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            policy: FailurePolicy::default(),
            cancel: CancellationToken::new(),
            progress: None,
        })
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Token that cancels every run of this engine when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Deletes every message from the selected sub-queues.
    pub async fn run_drain(
        &self,
        queue: &str,
        mode: SubQueueMode,
    ) -> Result<SessionSummary, EngineError> {
        let queue = QueueName::new(queue)?;
        let action = MessageAction::<C::Sender>::Delete;
        finish(self.run_all(&queue, mode, &action, None).await)
    }

    /// Moves every message from the selected sub-queues of `source` to `destination`.
    ///
    /// The sender is opened once, shared by every run, and closed once before
    /// returning.
    pub async fn run_transfer(
        &self,
        source: &str,
        destination: &str,
        mode: SubQueueMode,
    ) -> Result<SessionSummary, EngineError> {
        let source = QueueName::new(source)?;
        let destination = QueueName::new(destination)?;
        if source == destination && mode != SubQueueMode::DeadLetter {
            return Err(invalid(format!(
                "cannot move messages from the main queue of {source} into itself"
            )));
        }

        let sender = self
            .client
            .open_sender(&destination)
            .await
            .map_err(|source| EngineError::OpenSender {
                queue: destination.to_string(),
                source,
            })?;

        let action = MessageAction::ForwardThenDelete {
            sender: &sender,
            destination: &destination,
        };
        let summary = self.run_all(&source, mode, &action, None).await;

        if let Err(e) = sender.close().await {
            warn!("failed to close sender for {destination}: {e}");
        }

        finish(summary)
    }

    /// Peeks at up to `count` messages per selected sub-queue without removing them.
    pub async fn run_snapshot(
        &self,
        queue: &str,
        count: u64,
        mode: SubQueueMode,
    ) -> Result<SessionSummary, EngineError> {
        let queue = QueueName::new(queue)?;
        if count == 0 {
            return Err(invalid("count must be at least 1"));
        }
        let action = MessageAction::<C::Sender>::Snapshot;
        finish(self.run_all(&queue, mode, &action, Some(count)).await)
    }

    /// Scans the selected sub-queues for messages whose body contains `pattern`.
    pub async fn run_search(
        &self,
        queue: &str,
        pattern: &str,
        case_sensitive: bool,
        mode: SubQueueMode,
    ) -> Result<SessionSummary, EngineError> {
        let queue = QueueName::new(queue)?;
        let matcher = Matcher::new(pattern, case_sensitive)?;
        let action = MessageAction::<C::Sender>::Match(&matcher);
        finish(self.run_all(&queue, mode, &action, None).await)
    }

    /// Runs `action` against every sub-queue selected by `mode` using the
    /// engine's failure policy.
    ///
    /// The main queue runs before the dead letter queue. A cancelled run always
    /// ends the session; a failed run ends it unless the policy is
    /// [`FailurePolicy::ContinueOnError`].
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue whose sub-queues are processed
    /// * `mode` - Which sub-queues to process
    /// * `action` - Operation applied to every fetched message
    /// * `limit` - Most messages to check per sub-queue, `None` for all
    ///
    /// # Returns
    ///
    /// The summary of every run that was started, complete or not. Use
    /// [`SessionSummary::is_complete`] to tell them apart.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use drainq::memory::MemoryBroker;
    /// use drainq::{Engine, EngineConfig, MessageAction, QueueName, SubQueueMode};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let broker = MemoryBroker::new();
    /// let engine = Engine::new(broker.connect().await?, EngineConfig::default())?;
    ///
    /// let queue = QueueName::new("orders")?;
    /// let summary = engine
    ///     .run_all(&queue, SubQueueMode::Both, &MessageAction::Snapshot, Some(10))
    ///     .await;
    /// println!("{} captured", summary.snapshots().count());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run_all(
        &self,
        queue: &QueueName,
        mode: SubQueueMode,
        action: &MessageAction<'_, C::Sender>,
        limit: Option<u64>,
    ) -> SessionSummary {
        run_selected(mode, self.policy, move |sub_queue| {
            self.run_one(queue, sub_queue, action, limit)
        })
        .await
    }

    /// Runs `action` against a single sub-queue. The receiver is always closed
    /// before returning.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue the sub-queue belongs to
    /// * `sub_queue` - The main or the dead letter queue
    /// * `action` - Operation applied to every fetched message
    /// * `limit` - Most messages to check, `None` for all
    ///
    /// # Returns
    ///
    /// The report of the run. Failures to open the receiver or to fetch end the
    /// run as [`RunEnd::Failed`] and keep the counters gathered so far; they
    /// are never returned as errors.
    pub async fn run_one(
        &self,
        queue: &QueueName,
        sub_queue: SubQueue,
        action: &MessageAction<'_, C::Sender>,
        limit: Option<u64>,
    ) -> RunReport {
        info!("{} {} of {queue}", action.name(), sub_queue);

        let receiver = match self.client.open_receiver(queue, sub_queue).await {
            Ok(receiver) => receiver,
            Err(source) => {
                return RunReport::new(
                    sub_queue,
                    RunEnd::Failed(RunFailure::OpenReceiver { sub_queue, source }),
                )
            }
        };

        let report = DrainLoop::new(&receiver, sub_queue, action, &self.config, &self.cancel)
            .limit(limit)
            .progress(self.progress.as_ref())
            .run()
            .await;

        if let Err(e) = receiver.close().await {
            warn!("failed to close {sub_queue} receiver for {queue}: {e}");
        }

        let c = &report.counters;
        info!(
            "{} {} of {queue} {}: {} checked, {} matched, {} moved, {} deleted, {} skipped in {:.1?} ({:.1} msg/s)",
            action.name(),
            sub_queue,
            report.end,
            c.checked,
            c.matched,
            c.moved,
            c.deleted,
            c.skipped,
            c.elapsed,
            c.throughput()
        );

        report
    }

    /// Closes the client. Call once, at the very end.
    pub async fn close(self) -> Result<(), TransportError> {
        self.client.close().await
    }
}

fn finish(summary: SessionSummary) -> Result<SessionSummary, EngineError> {
    if summary.is_complete() {
        Ok(summary)
    } else {
        Err(EngineError::Interrupted(summary))
    }
}
