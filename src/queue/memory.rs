use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

use super::{Envelope, Queue, QueueError, RetryDisposition};

#[derive(Default)]
struct Lists {
    ready: VecDeque<Envelope>,
    in_flight: Vec<Envelope>,
    dead: Vec<Envelope>,
}

/// Process-local queue with the same delivery semantics as [`super::RedisQueue`].
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, Lists>>,
    max_attempts: u32,
}

impl InMemoryQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }

    fn with<T>(&self, queue: &str, f: impl FnOnce(&mut Lists) -> T) -> T {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        f(queues.entry(queue.to_string()).or_default())
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.with(queue, |lists| lists.ready.len())
    }

    pub fn in_flight_len(&self, queue: &str) -> usize {
        self.with(queue, |lists| lists.in_flight.len())
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<Envelope> {
        self.with(queue, |lists| lists.dead.clone())
    }

    /// Enqueues an already-built envelope, e.g. to simulate duplicate delivery.
    pub fn push(&self, queue: &str, envelope: Envelope) {
        self.with(queue, |lists| lists.ready.push_back(envelope));
    }
}

fn take_in_flight(lists: &mut Lists, id: Uuid) -> Option<Envelope> {
    let index = lists.in_flight.iter().position(|e| e.id == id)?;
    Some(lists.in_flight.remove(index))
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn publish(&self, queue: &str, payload: serde_json::Value) -> Result<Uuid, QueueError> {
        let envelope = Envelope::new(payload);
        let id = envelope.id;
        self.push(queue, envelope);
        Ok(id)
    }

    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<Envelope>, QueueError> {
        Ok(self.with(queue, |lists| {
            let mut batch = Vec::new();
            while batch.len() < max {
                let Some(envelope) = lists.ready.pop_front() else {
                    break;
                };
                lists.in_flight.push(envelope.clone());
                batch.push(envelope);
            }
            batch
        }))
    }

    async fn ack(&self, queue: &str, envelope: &Envelope) -> Result<(), QueueError> {
        self.with(queue, |lists| {
            take_in_flight(lists, envelope.id);
        });
        Ok(())
    }

    async fn retry(&self, queue: &str, envelope: &Envelope) -> Result<RetryDisposition, QueueError> {
        let max_attempts = self.max_attempts;
        Ok(self.with(queue, |lists| {
            let mut next = take_in_flight(lists, envelope.id).unwrap_or_else(|| envelope.clone());
            next.attempts += 1;
            if next.attempts >= max_attempts {
                lists.dead.push(next);
                RetryDisposition::DeadLettered
            } else {
                lists.ready.push_back(next);
                RetryDisposition::Requeued
            }
        }))
    }

    async fn dead_letter(&self, queue: &str, envelope: &Envelope) -> Result<(), QueueError> {
        self.with(queue, |lists| {
            let message = take_in_flight(lists, envelope.id).unwrap_or_else(|| envelope.clone());
            lists.dead.push(message);
        });
        Ok(())
    }

    async fn requeue(&self, queue: &str, envelope: &Envelope) -> Result<(), QueueError> {
        self.with(queue, |lists| {
            let message = take_in_flight(lists, envelope.id).unwrap_or_else(|| envelope.clone());
            lists.ready.push_front(message);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_and_acks() {
        let queue = InMemoryQueue::new(3);
        queue.publish("q", json!({"txId": "a"})).await.unwrap();
        queue.publish("q", json!({"txId": "b"})).await.unwrap();

        let batch = queue.receive("q", 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.in_flight_len("q"), 2);

        queue.ack("q", &batch[0]).await.unwrap();
        assert_eq!(queue.in_flight_len("q"), 1);
    }

    #[tokio::test]
    async fn retries_then_dead_letters() {
        let queue = InMemoryQueue::new(2);
        queue.publish("q", json!({})).await.unwrap();

        let first = queue.receive("q", 1).await.unwrap().remove(0);
        assert_eq!(queue.retry("q", &first).await.unwrap(), RetryDisposition::Requeued);

        let second = queue.receive("q", 1).await.unwrap().remove(0);
        assert_eq!(second.attempts, 1);
        assert_eq!(
            queue.retry("q", &second).await.unwrap(),
            RetryDisposition::DeadLettered
        );
        assert_eq!(queue.dead_letters("q").len(), 1);
        assert_eq!(queue.ready_len("q"), 0);
        assert_eq!(queue.in_flight_len("q"), 0);
    }
}
