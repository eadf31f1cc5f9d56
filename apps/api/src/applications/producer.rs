//! Submission producer: admission control, the durable pending write, and
//! the queue publish.
//!
//! Ordering invariant: the application record is written before the message
//! is published, so no worker can ever claim a message whose backing record
//! does not exist. A publish that keeps failing leaves the application in
//! `pending` and surfaces the failure to the submitter; the submission is
//! never silently lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::events::{EventBus, StatusChangedEvent};
use crate::idempotency::{IdempotencyStore, Reservation};
use crate::models::application::{Application, ApplicationStatus, JobData, SubmitReceipt};
use crate::queue::{QueueMessage, QueueTransport, MESSAGE_VERSION};
use crate::rate_limit::{RateDecision, RateLimiter};

use super::store::ApplicationStore;

/// Validated submission parameters, as supplied by the request layer.
pub struct SubmissionRequest {
    pub jobs: Vec<JobData>,
    pub resume_id: Option<Uuid>,
}

/// Result of a submission: a freshly accepted application, or the stored
/// response of an earlier submission replayed under its idempotency key.
pub enum SubmitOutcome {
    Accepted {
        receipt: SubmitReceipt,
        rate: Option<RateDecision>,
    },
    Replayed {
        response: serde_json::Value,
    },
}

pub struct SubmissionProducer {
    store: Arc<dyn ApplicationStore>,
    queue: Arc<dyn QueueTransport>,
    gate: Arc<dyn IdempotencyStore>,
    limiter: Option<Arc<RateLimiter>>,
    events: EventBus,
    publish_retries: u32,
}

impl SubmissionProducer {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        queue: Arc<dyn QueueTransport>,
        gate: Arc<dyn IdempotencyStore>,
        limiter: Option<Arc<RateLimiter>>,
        events: EventBus,
        publish_retries: u32,
    ) -> Self {
        Self {
            store,
            queue,
            gate,
            limiter,
            events,
            publish_retries,
        }
    }

    pub async fn submit(
        &self,
        user_id: &str,
        request: SubmissionRequest,
        idempotency_key: Option<&str>,
    ) -> Result<SubmitOutcome, AppError> {
        if request.jobs.is_empty() {
            return Err(AppError::Validation(
                "At least one job is required".to_string(),
            ));
        }

        let rate = match &self.limiter {
            Some(limiter) => {
                let decision = limiter.allow(user_id).await?;
                if let RateDecision::Denied { reset_at } = decision {
                    return Err(AppError::RateLimited {
                        limit: limiter.limit(),
                        reset_at,
                    });
                }
                Some(decision)
            }
            None => None,
        };

        if let Some(key) = idempotency_key {
            match self.gate.check_and_reserve(user_id, key).await? {
                Reservation::Fresh => {}
                Reservation::Replay(response) => {
                    return Ok(SubmitOutcome::Replayed { response });
                }
            }
        }

        match self.accept(user_id, request).await {
            Ok(receipt) => {
                if let Some(key) = idempotency_key {
                    let stored = serde_json::to_value(&receipt)
                        .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
                    self.gate.store(user_id, key, stored).await?;
                }
                Ok(SubmitOutcome::Accepted { receipt, rate })
            }
            Err(e) => {
                // Free the key so the client can retry the failed submission.
                if let Some(key) = idempotency_key {
                    self.gate.release(user_id, key).await?;
                }
                Err(e)
            }
        }
    }

    /// The durable write plus the publish, in that order.
    async fn accept(
        &self,
        user_id: &str,
        request: SubmissionRequest,
    ) -> Result<SubmitReceipt, AppError> {
        let now = Utc::now();
        let app = Application {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            job_count: request.jobs.len() as i32,
            jobs: request.jobs,
            status: ApplicationStatus::Pending,
            resume_id: request.resume_id,
            created_at: now,
            updated_at: now,
            processed_at: None,
            error_reason: None,
        };
        self.store.create(&app).await?;

        let message = QueueMessage::new(
            app.id,
            app.user_id.clone(),
            json!({
                "version": MESSAGE_VERSION,
                "job_count": app.job_count,
                "resume_id": app.resume_id,
            }),
        );
        self.publish_with_retry(message).await?;

        info!(
            application_id = %app.id,
            user_id,
            job_count = app.job_count,
            "application accepted and queued"
        );
        self.events.emit(StatusChangedEvent {
            application_id: app.id,
            user_id: app.user_id.clone(),
            status: ApplicationStatus::Pending,
            previous_status: None,
            job_count: app.job_count,
            error_reason: None,
            occurred_at: now,
        });

        Ok(SubmitReceipt {
            application_id: app.id,
            status: ApplicationStatus::Pending,
            job_count: app.job_count,
            status_url: format!("/api/v1/applications/{}/status", app.id),
            created_at: now,
        })
    }

    async fn publish_with_retry(&self, message: QueueMessage) -> Result<(), AppError> {
        let mut last_error = None;
        for attempt in 0..self.publish_retries.max(1) {
            if attempt > 0 {
                sleep(Duration::from_millis(100 * (1 << (attempt - 1)))).await;
            }
            match self.queue.publish(message.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        application_id = %message.application_id,
                        attempt,
                        "queue publish failed: {e}"
                    );
                    last_error = Some(e);
                }
            }
        }
        // The pending record stays in place; the submitter sees the failure
        // and can retry.
        warn!(
            application_id = %message.application_id,
            "queue publish exhausted retries, application left pending"
        );
        Err(last_error
            .map(AppError::from)
            .unwrap_or_else(|| AppError::Queue("publish failed".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applications::store::InMemoryApplicationStore;
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::queue::memory::InMemoryQueue;
    use crate::queue::QueueError;
    use crate::rate_limit::InMemoryRateLimitStore;

    fn job() -> JobData {
        JobData {
            title: "Platform Engineer".to_string(),
            portal: Some("indeed".to_string()),
            company: Some("Globex".to_string()),
            description: None,
        }
    }

    struct Fixture {
        store: Arc<InMemoryApplicationStore>,
        queue: Arc<InMemoryQueue>,
        producer: SubmissionProducer,
    }

    fn fixture(rate_limit: Option<u32>) -> Fixture {
        let store = Arc::new(InMemoryApplicationStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let gate = Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(3600)));
        let limiter = rate_limit.map(|limit| {
            Arc::new(RateLimiter::new(
                Arc::new(InMemoryRateLimitStore::new()),
                limit,
                Duration::from_secs(3600),
            ))
        });
        let producer = SubmissionProducer::new(
            store.clone(),
            queue.clone(),
            gate,
            limiter,
            EventBus::default(),
            3,
        );
        Fixture {
            store,
            queue,
            producer,
        }
    }

    #[tokio::test]
    async fn test_submit_returns_pending_receipt_and_queues_one_message() {
        let f = fixture(None);
        let outcome = f
            .producer
            .submit(
                "u1",
                SubmissionRequest {
                    jobs: vec![job(), job(), job()],
                    resume_id: None,
                },
                None,
            )
            .await
            .unwrap();

        let SubmitOutcome::Accepted { receipt, .. } = outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(receipt.status, ApplicationStatus::Pending);
        assert_eq!(receipt.job_count, 3);

        let stored = f.store.fetch(receipt.application_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ApplicationStatus::Pending);
        assert_eq!(f.queue.depths().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_empty_submission_is_rejected_before_any_write() {
        let f = fixture(None);
        let result = f
            .producer
            .submit(
                "u1",
                SubmissionRequest {
                    jobs: vec![],
                    resume_id: None,
                },
                None,
            )
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(f.queue.depths().await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_replays_without_second_record() {
        let f = fixture(None);
        let request = || SubmissionRequest {
            jobs: vec![job()],
            resume_id: None,
        };

        let first = f
            .producer
            .submit("u1", request(), Some("K1"))
            .await
            .unwrap();
        let SubmitOutcome::Accepted { receipt, .. } = first else {
            panic!("expected acceptance");
        };

        let second = f
            .producer
            .submit("u1", request(), Some("K1"))
            .await
            .unwrap();
        let SubmitOutcome::Replayed { response } = second else {
            panic!("expected replay");
        };

        // The replay is the stored response, byte for byte.
        assert_eq!(response, serde_json::to_value(&receipt).unwrap());
        // No second message, no second record.
        assert_eq!(f.queue.depths().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_denial_is_distinguishable() {
        let f = fixture(Some(1));
        let request = || SubmissionRequest {
            jobs: vec![job()],
            resume_id: None,
        };

        f.producer.submit("u1", request(), None).await.unwrap();
        let denied = f.producer.submit("u1", request(), None).await;
        assert!(matches!(denied, Err(AppError::RateLimited { .. })));
    }

    /// Queue that always refuses publishes.
    struct BrokenQueue;

    #[async_trait::async_trait]
    impl QueueTransport for BrokenQueue {
        async fn publish(&self, _message: QueueMessage) -> Result<(), QueueError> {
            Err(QueueError::Transport("broker unreachable".to_string()))
        }
        async fn receive(&self) -> Result<Option<crate::queue::Delivery>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, _d: &crate::queue::Delivery) -> Result<(), QueueError> {
            Ok(())
        }
        async fn nack(
            &self,
            _d: &crate::queue::Delivery,
            _requeue: bool,
            _delay: Duration,
        ) -> Result<(), QueueError> {
            Ok(())
        }
        async fn publish_dead_letter(
            &self,
            _m: &QueueMessage,
            _e: &str,
        ) -> Result<(), QueueError> {
            Ok(())
        }
        async fn depths(&self) -> Result<crate::queue::QueueDepths, QueueError> {
            Ok(crate::queue::QueueDepths {
                ready: 0,
                dead_letters: 0,
            })
        }
        async fn dead_letters(
            &self,
            _limit: i64,
        ) -> Result<Vec<crate::queue::DeadLetter>, QueueError> {
            Ok(Vec::new())
        }
        async fn requeue_dead_letter(&self, _id: i64) -> Result<bool, QueueError> {
            Ok(false)
        }
        async fn discard_dead_letter(&self, _id: i64) -> Result<bool, QueueError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_pending_and_releases_the_key() {
        let store = Arc::new(InMemoryApplicationStore::new());
        let gate = Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(3600)));
        let producer = SubmissionProducer::new(
            store.clone(),
            Arc::new(BrokenQueue),
            gate.clone(),
            None,
            EventBus::default(),
            2,
        );

        let result = producer
            .submit(
                "u1",
                SubmissionRequest {
                    jobs: vec![job()],
                    resume_id: None,
                },
                Some("K1"),
            )
            .await;
        assert!(matches!(result, Err(AppError::Queue(_))));

        // The key was released, so a retry reserves it afresh rather than
        // conflicting or replaying a response that was never stored.
        assert!(matches!(
            gate.check_and_reserve("u1", "K1").await.unwrap(),
            crate::idempotency::Reservation::Fresh
        ));
    }
}
