//! In-process queue transport for tests and single-process deployments.
//!
//! Mirrors the broker contract (claim-one-at-a-time, delayed availability,
//! dead-letter routing) over a mutex-guarded map. Nothing here survives a
//! restart, so multi-instance deployments use [`super::pg::PgQueue`].

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;

use super::{DeadLetter, Delivery, QueueDepths, QueueError, QueueMessage, QueueTransport};

struct StoredMessage {
    message: QueueMessage,
    available_at: Instant,
    locked: bool,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    next_dead_id: i64,
    messages: BTreeMap<i64, StoredMessage>,
    dead: BTreeMap<i64, DeadLetter>,
}

#[derive(Default)]
#[allow(dead_code)]
pub struct InMemoryQueue {
    inner: Mutex<Inner>,
}

impl InMemoryQueue {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl QueueTransport for InMemoryQueue {
    async fn publish(&self, message: QueueMessage) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        inner.messages.insert(
            id,
            StoredMessage {
                message,
                available_at: Instant::now(),
                locked: false,
            },
        );
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let now = Instant::now();

        let claimed = inner
            .messages
            .iter_mut()
            .find(|(_, stored)| !stored.locked && stored.available_at <= now)
            .map(|(id, stored)| {
                stored.locked = true;
                Delivery {
                    receipt: *id,
                    message: stored.message.clone(),
                }
            });

        Ok(claimed)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.messages.remove(&delivery.receipt);
        Ok(())
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        requeue: bool,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if requeue {
            if let Some(stored) = inner.messages.get_mut(&delivery.receipt) {
                stored.message.retry_count += 1;
                stored.available_at = Instant::now() + delay;
                stored.locked = false;
            }
        } else {
            inner.messages.remove(&delivery.receipt);
        }
        Ok(())
    }

    async fn publish_dead_letter(
        &self,
        message: &QueueMessage,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.next_dead_id += 1;
        let id = inner.next_dead_id;
        inner.dead.insert(
            id,
            DeadLetter {
                id,
                application_id: message.application_id,
                user_id: message.user_id.clone(),
                payload: message.payload.clone(),
                retry_count: message.retry_count,
                correlation_id: message.correlation_id,
                error: error.to_string(),
                failed_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn depths(&self) -> Result<QueueDepths, QueueError> {
        let inner = self.inner.lock().expect("queue poisoned");
        Ok(QueueDepths {
            ready: inner.messages.len() as u64,
            dead_letters: inner.dead.len() as u64,
        })
    }

    async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>, QueueError> {
        let inner = self.inner.lock().expect("queue poisoned");
        Ok(inner
            .dead
            .values()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn requeue_dead_letter(&self, id: i64) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        let Some(letter) = inner.dead.remove(&id) else {
            return Ok(false);
        };

        inner.next_id += 1;
        let message_id = inner.next_id;
        inner.messages.insert(
            message_id,
            StoredMessage {
                message: QueueMessage {
                    application_id: letter.application_id,
                    user_id: letter.user_id,
                    payload: letter.payload,
                    retry_count: 0,
                    correlation_id: letter.correlation_id,
                    enqueued_at: Utc::now(),
                },
                available_at: Instant::now(),
                locked: false,
            },
        );
        Ok(true)
    }

    async fn discard_dead_letter(&self, id: i64) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        Ok(inner.dead.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn message() -> QueueMessage {
        QueueMessage::new(Uuid::new_v4(), "u1".to_string(), json!({"job_count": 1}))
    }

    #[tokio::test]
    async fn test_claimed_message_is_invisible_until_nacked() {
        let queue = InMemoryQueue::new();
        queue.publish(message()).await.unwrap();

        let delivery = queue.receive().await.unwrap().expect("one message");
        assert!(queue.receive().await.unwrap().is_none());

        queue
            .nack(&delivery, true, Duration::ZERO)
            .await
            .unwrap();
        let redelivered = queue.receive().await.unwrap().expect("redelivery");
        assert_eq!(redelivered.message.retry_count, 1);
    }

    #[tokio::test]
    async fn test_ack_removes_the_message() {
        let queue = InMemoryQueue::new();
        queue.publish(message()).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        queue.ack(&delivery).await.unwrap();

        assert!(queue.receive().await.unwrap().is_none());
        assert_eq!(queue.depths().await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn test_dead_letter_requeue_resets_retry_budget() {
        let queue = InMemoryQueue::new();
        let mut msg = message();
        msg.retry_count = 5;
        queue.publish_dead_letter(&msg, "boom").await.unwrap();
        assert_eq!(queue.depths().await.unwrap().dead_letters, 1);

        let letters = queue.dead_letters(10).await.unwrap();
        assert!(queue.requeue_dead_letter(letters[0].id).await.unwrap());

        let delivery = queue.receive().await.unwrap().expect("requeued message");
        assert_eq!(delivery.message.retry_count, 0);
        assert_eq!(queue.depths().await.unwrap().dead_letters, 0);
    }
}
