//! Abstraction over the durable message broker.
//!
//! The pipeline does not implement its own durability; it relies on the
//! backing transport for persistence, competing-consumer delivery (each
//! message claimed by exactly one worker at a time), redelivery after a
//! visibility timeout, and a dead-letter destination for messages that
//! exhausted processing.

pub mod memory;
pub mod pg;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::errors::AppError;

/// Current envelope schema version, stamped into every published message.
pub const MESSAGE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue transport error: {0}")]
    Transport(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Transport(e.to_string())
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        AppError::Queue(e.to_string())
    }
}

/// Envelope carrying an application reference to the processing workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub application_id: Uuid,
    pub user_id: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub correlation_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(application_id: Uuid, user_id: String, payload: serde_json::Value) -> Self {
        QueueMessage {
            application_id,
            user_id,
            payload,
            retry_count: 0,
            correlation_id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
        }
    }
}

/// A claimed message. The claim expires after the transport's visibility
/// timeout, at which point the message is redelivered to another consumer;
/// every receipt must therefore be treated as a possible redelivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: i64,
    pub message: QueueMessage,
}

/// A message parked in the dead-letter destination, pending operator action.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: i64,
    pub application_id: Uuid,
    pub user_id: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub correlation_id: Uuid,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Queue and dead-letter depths for the admin surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueDepths {
    pub ready: u64,
    pub dead_letters: u64,
}

#[async_trait::async_trait]
pub trait QueueTransport: Send + Sync {
    /// Durably enqueues a message for processing.
    async fn publish(&self, message: QueueMessage) -> Result<(), QueueError>;

    /// Claims the next available message, if any, making it invisible to
    /// other consumers until acked, nacked, or the visibility timeout lapses.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Permanently removes a claimed message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Returns a claimed message to the queue. With `requeue`, the retry
    /// count is incremented and the message becomes visible again after
    /// `delay`; without it, the message is dropped.
    async fn nack(
        &self,
        delivery: &Delivery,
        requeue: bool,
        delay: std::time::Duration,
    ) -> Result<(), QueueError>;

    /// Routes a message to the dead-letter destination.
    async fn publish_dead_letter(
        &self,
        message: &QueueMessage,
        error: &str,
    ) -> Result<(), QueueError>;

    async fn depths(&self) -> Result<QueueDepths, QueueError>;

    async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>, QueueError>;

    /// Moves a dead letter back onto the primary queue with a fresh retry
    /// budget. Returns false if the id is unknown.
    async fn requeue_dead_letter(&self, id: i64) -> Result<bool, QueueError>;

    /// Permanently discards a dead letter. Returns false if the id is unknown.
    async fn discard_dead_letter(&self, id: i64) -> Result<bool, QueueError>;
}
