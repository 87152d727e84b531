//! Work queues consumed by the settlement workers.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use self::memory::InMemoryQueue;
pub use self::redis::RedisQueue;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("invalid message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A delivered message. `attempts` counts previous failed deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub attempts: u32,
    pub payload: serde_json::Value,
    /// Exact stored form, used to remove the message from the in-flight list.
    #[serde(skip)]
    pub(crate) raw: String,
}

impl Envelope {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempts: 0,
            payload,
            raw: String::new(),
        }
    }

    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Requeued,
    DeadLettered,
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn publish(&self, queue: &str, payload: serde_json::Value) -> Result<Uuid, QueueError>;

    /// Takes up to `max` messages and marks them in flight.
    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<Envelope>, QueueError>;

    async fn ack(&self, queue: &str, envelope: &Envelope) -> Result<(), QueueError>;

    /// Redelivers with one more attempt counted, or dead-letters once the attempt cap
    /// is reached.
    async fn retry(&self, queue: &str, envelope: &Envelope) -> Result<RetryDisposition, QueueError>;

    async fn dead_letter(&self, queue: &str, envelope: &Envelope) -> Result<(), QueueError>;

    /// Puts the message back untouched.
    async fn requeue(&self, queue: &str, envelope: &Envelope) -> Result<(), QueueError>;
}

pub fn processing_key(queue: &str) -> String {
    format!("{}:processing", queue)
}

pub fn dead_letter_key(queue: &str) -> String {
    format!("{}:dead", queue)
}
