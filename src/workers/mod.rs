//! Queue consumers and scheduled jobs.
//!
//! A [`QueueWorker`] pulls a batch, hands every message to its [`MessageHandler`]
//! independently and turns each result into a queue disposition through
//! [`ErrorClass`].

pub mod blockchain_settlement;
pub mod scheduler;

use async_trait::async_trait;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{AppError, ErrorClass};
use crate::queue::{Envelope, Queue, QueueError, RetryDisposition};

pub use blockchain_settlement::BlockchainSettlementHandler;
pub use scheduler::{Scheduler, ScheduledJob};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, envelope: &Envelope) -> Result<(), AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Requeued,
    DeadLettered,
    /// Put back untouched; the worker stops after this batch.
    Halted,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub acked: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub halted: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.acked + self.requeued + self.dead_lettered + self.halted
    }

    pub fn is_fatal(&self) -> bool {
        self.halted > 0
    }

    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Acked => self.acked += 1,
            Disposition::Requeued => self.requeued += 1,
            Disposition::DeadLettered => self.dead_lettered += 1,
            Disposition::Halted => self.halted += 1,
        }
    }
}

pub struct QueueWorker {
    queue: Arc<dyn Queue>,
    queue_name: String,
    handler: Arc<dyn MessageHandler>,
    batch_size: usize,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn Queue>,
        queue_name: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            handler,
            batch_size: batch_size.max(1),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Processes messages until `shutdown` resolves or a fatal failure halts the worker.
    pub async fn run<S>(&self, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        info!(queue = %self.queue_name, handler = self.handler.name(), "Queue worker started");
        tokio::pin!(shutdown);

        loop {
            let report = tokio::select! {
                _ = &mut shutdown => {
                    info!(queue = %self.queue_name, "Queue worker stopping");
                    return Ok(());
                }
                report = self.process_batch() => report,
            };

            match report {
                Ok(report) if report.is_fatal() => {
                    error!(alert = true, queue = %self.queue_name, handler = self.handler.name(), "Queue worker halted on fatal error");
                    anyhow::bail!("{} worker halted on a fatal error", self.handler.name());
                }
                Ok(report) if report.total() > 0 => continue,
                Ok(_) => {}
                Err(e) => error!(queue = %self.queue_name, error = %e, "Queue receive failed"),
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!(queue = %self.queue_name, "Queue worker stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Handles one batch. Messages run concurrently and independently; one failing
    /// message never affects another's disposition.
    pub async fn process_batch(&self) -> Result<BatchReport, QueueError> {
        let batch = self.queue.receive(&self.queue_name, self.batch_size).await?;
        let mut report = BatchReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        let outcomes = join_all(batch.iter().map(|envelope| self.process(envelope))).await;
        for outcome in outcomes {
            match outcome {
                Ok(disposition) => report.record(disposition),
                Err(e) => {
                    // The message stays in flight and is recovered on restart.
                    error!(queue = %self.queue_name, error = %e, "Failed to update message disposition");
                }
            }
        }

        info!(
            queue = %self.queue_name,
            acked = report.acked,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            halted = report.halted,
            "Processed batch"
        );
        Ok(report)
    }

    async fn process(&self, envelope: &Envelope) -> Result<Disposition, QueueError> {
        let queue = self.queue_name.as_str();
        let result = self.handler.handle(envelope).await;

        let error = match result {
            Ok(()) => {
                self.queue.ack(queue, envelope).await?;
                return Ok(Disposition::Acked);
            }
            Err(e) => e,
        };

        match error.class() {
            ErrorClass::Consistency => {
                info!(queue, message_id = %envelope.id, reason = %error, "Message already applied");
                self.queue.ack(queue, envelope).await?;
                Ok(Disposition::Acked)
            }
            ErrorClass::Provider { retryable: true } => {
                match self.queue.retry(queue, envelope).await? {
                    RetryDisposition::Requeued => {
                        warn!(queue, message_id = %envelope.id, attempts = envelope.attempts + 1, error = %error, "Message will be redelivered");
                        Ok(Disposition::Requeued)
                    }
                    RetryDisposition::DeadLettered => {
                        error!(alert = true, queue, message_id = %envelope.id, error = %error, "Message exhausted its attempts");
                        Ok(Disposition::DeadLettered)
                    }
                }
            }
            ErrorClass::Validation | ErrorClass::Provider { retryable: false } => {
                error!(queue, message_id = %envelope.id, error = %error, "Message rejected, moved to dead letter");
                self.queue.dead_letter(queue, envelope).await?;
                Ok(Disposition::DeadLettered)
            }
            ErrorClass::Fatal => {
                error!(alert = true, queue, message_id = %envelope.id, error = %error, "Fatal error while handling message");
                self.queue.requeue(queue, envelope).await?;
                Ok(Disposition::Halted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use crate::queue::InMemoryQueue;
    use serde_json::json;

    struct ByPayload;

    #[async_trait]
    impl MessageHandler for ByPayload {
        fn name(&self) -> &'static str {
            "by-payload"
        }

        async fn handle(&self, envelope: &Envelope) -> Result<(), AppError> {
            match envelope.payload["kind"].as_str() {
                Some("ok") => Ok(()),
                Some("dup") => Err(AppError::Conflict("already settled".into())),
                Some("flaky") => Err(ProviderError::Unavailable("rpc down".into()).into()),
                Some("bad") => Err(AppError::Validation("no txId".into())),
                _ => Err(AppError::Internal("misconfigured".into())),
            }
        }
    }

    fn worker(queue: &Arc<InMemoryQueue>) -> QueueWorker {
        QueueWorker::new(queue.clone(), "jobs", Arc::new(ByPayload), 10)
    }

    #[tokio::test]
    async fn each_message_gets_its_own_disposition() {
        let queue = Arc::new(InMemoryQueue::new(3));
        for kind in ["ok", "dup", "flaky", "bad"] {
            queue.publish("jobs", json!({ "kind": kind })).await.unwrap();
        }

        let report = worker(&queue).process_batch().await.unwrap();

        assert_eq!(report.acked, 2);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.dead_lettered, 1);
        assert!(!report.is_fatal());
        assert_eq!(queue.ready_len("jobs"), 1);
        assert_eq!(queue.in_flight_len("jobs"), 0);
        assert_eq!(queue.dead_letters("jobs").len(), 1);
    }

    #[tokio::test]
    async fn retryable_failures_dead_letter_after_max_attempts() {
        let queue = Arc::new(InMemoryQueue::new(2));
        queue.publish("jobs", json!({ "kind": "flaky" })).await.unwrap();
        let worker = worker(&queue);

        assert_eq!(worker.process_batch().await.unwrap().requeued, 1);
        assert_eq!(worker.process_batch().await.unwrap().dead_lettered, 1);
        assert_eq!(queue.ready_len("jobs"), 0);
    }

    #[tokio::test]
    async fn fatal_errors_keep_the_message_and_halt() {
        let queue = Arc::new(InMemoryQueue::new(3));
        queue.publish("jobs", json!({ "kind": "boom" })).await.unwrap();
        let worker = worker(&queue);

        let report = worker.process_batch().await.unwrap();
        assert!(report.is_fatal());
        assert_eq!(queue.ready_len("jobs"), 1);

        let result = worker.run(std::future::pending()).await;
        assert!(result.is_err());
        assert_eq!(queue.ready_len("jobs"), 1);
    }
}
