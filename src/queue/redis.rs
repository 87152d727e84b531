use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{info, warn};
use uuid::Uuid;

use super::{dead_letter_key, processing_key, Envelope, Queue, QueueError, RetryDisposition};

/// Reliable list queue: `RPOPLPUSH` into `<queue>:processing`, removal on ack,
/// `<queue>:dead` after `max_attempts` deliveries.
#[derive(Clone)]
pub struct RedisQueue {
    connection: MultiplexedConnection,
    max_attempts: u32,
}

impl RedisQueue {
    pub async fn connect(url: &str, max_attempts: u32) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        Ok(Self {
            connection,
            max_attempts,
        })
    }

    /// Moves messages left in flight by a crashed consumer back onto the queue.
    pub async fn recover_inflight(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.connection.clone();
        let mut recovered = 0;
        loop {
            let moved: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(processing_key(queue))
                .arg(queue)
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            warn!(queue, recovered, "Recovered in-flight messages");
        }
        Ok(recovered)
    }

    async fn push(&self, key: &str, envelope: &Envelope) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        let raw = serde_json::to_string(envelope)?;
        redis::cmd("LPUSH")
            .arg(key)
            .arg(raw)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn move_from_processing(
        &self,
        queue: &str,
        envelope: &Envelope,
        destination: &str,
        replacement: &Envelope,
    ) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        let raw = serde_json::to_string(replacement)?;
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(processing_key(queue))
            .arg(1)
            .arg(&envelope.raw)
            .ignore()
            .cmd("LPUSH")
            .arg(destination)
            .arg(raw)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn publish(&self, queue: &str, payload: serde_json::Value) -> Result<Uuid, QueueError> {
        let envelope = Envelope::new(payload);
        self.push(queue, &envelope).await?;
        info!(queue, message_id = %envelope.id, "Published message");
        Ok(envelope.id)
    }

    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<Envelope>, QueueError> {
        let mut conn = self.connection.clone();
        let mut batch = Vec::with_capacity(max);

        while batch.len() < max {
            let raw: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(queue)
                .arg(processing_key(queue))
                .query_async(&mut conn)
                .await?;
            let Some(raw) = raw else {
                break;
            };

            match serde_json::from_str::<Envelope>(&raw) {
                Ok(mut envelope) => {
                    envelope.raw = raw;
                    batch.push(envelope);
                }
                Err(e) => {
                    warn!(queue, error = %e, "Unreadable message moved to dead letter");
                    redis::pipe()
                        .atomic()
                        .cmd("LREM")
                        .arg(processing_key(queue))
                        .arg(1)
                        .arg(&raw)
                        .ignore()
                        .cmd("LPUSH")
                        .arg(dead_letter_key(queue))
                        .arg(&raw)
                        .ignore()
                        .query_async::<_, ()>(&mut conn)
                        .await?;
                }
            }
        }

        Ok(batch)
    }

    async fn ack(&self, queue: &str, envelope: &Envelope) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        redis::cmd("LREM")
            .arg(processing_key(queue))
            .arg(1)
            .arg(&envelope.raw)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry(&self, queue: &str, envelope: &Envelope) -> Result<RetryDisposition, QueueError> {
        let mut next = envelope.clone();
        next.attempts += 1;

        if next.attempts >= self.max_attempts {
            self.move_from_processing(queue, envelope, &dead_letter_key(queue), &next)
                .await?;
            warn!(queue, message_id = %envelope.id, attempts = next.attempts, "Message dead-lettered");
            return Ok(RetryDisposition::DeadLettered);
        }

        self.move_from_processing(queue, envelope, queue, &next).await?;
        Ok(RetryDisposition::Requeued)
    }

    async fn dead_letter(&self, queue: &str, envelope: &Envelope) -> Result<(), QueueError> {
        self.move_from_processing(queue, envelope, &dead_letter_key(queue), envelope)
            .await
    }

    async fn requeue(&self, queue: &str, envelope: &Envelope) -> Result<(), QueueError> {
        self.move_from_processing(queue, envelope, queue, envelope).await
    }
}
