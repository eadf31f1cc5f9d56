//! Processing worker: consumes queue messages and drives each application
//! through the pending -> processing -> success/failed state machine.
//!
//! Multiple worker instances compete on the same queue; the transport hands
//! each message to one worker at a time but redelivers after crashes or
//! visibility timeouts, so every step here is guarded to make redelivery
//! safe: terminal applications are acked and dropped, and terminal
//! transitions happen at most once.

pub mod processor;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::applications::store::{ApplicationStore, ProcessingAdmission};
use crate::events::{EventBus, StatusChangedEvent};
use crate::models::application::{Application, ApplicationStatus};
use crate::queue::{Delivery, QueueError, QueueTransport};
use self::processor::JobProcessor;
use self::retry::{ProcessingError, RetryPolicy};

pub struct ProcessingWorker {
    store: Arc<dyn ApplicationStore>,
    queue: Arc<dyn QueueTransport>,
    processor: Arc<dyn JobProcessor>,
    events: EventBus,
    policy: RetryPolicy,
}

impl ProcessingWorker {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        queue: Arc<dyn QueueTransport>,
        processor: Arc<dyn JobProcessor>,
        events: EventBus,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            processor,
            events,
            policy,
        }
    }

    /// Consumes messages until the process exits, sleeping `poll_interval`
    /// whenever the queue is empty.
    pub async fn run(&self, poll_interval: Duration) {
        info!("processing worker started");
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => sleep(poll_interval).await,
                Err(e) => {
                    error!("worker queue error: {e}");
                    sleep(poll_interval).await;
                }
            }
        }
    }

    /// Claims and handles at most one message. Returns whether a message was
    /// claimed.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(delivery) = self.queue.receive().await? else {
            return Ok(false);
        };
        self.handle(delivery).await?;
        Ok(true)
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), QueueError> {
        let msg = &delivery.message;
        debug!(
            application_id = %msg.application_id,
            retry_count = msg.retry_count,
            correlation_id = %msg.correlation_id,
            "received processing message"
        );

        let app = match self.store.fetch(msg.application_id).await {
            Ok(Some(app)) => app,
            Ok(None) => {
                // A message must never be published before the record is
                // durably written, so a missing record is unrecoverable.
                warn!(
                    application_id = %msg.application_id,
                    "message references a missing application, dead-lettering"
                );
                self.queue
                    .publish_dead_letter(msg, "application record not found")
                    .await?;
                self.queue.ack(&delivery).await?;
                return Ok(());
            }
            Err(e) => {
                // Store unavailable: leave the claim in place and let the
                // visibility timeout redeliver without burning retry budget.
                error!(application_id = %msg.application_id, "status store unavailable: {e}");
                return Ok(());
            }
        };

        match self.store.begin_processing(app.id).await {
            Ok(ProcessingAdmission::Admitted) => {}
            Ok(ProcessingAdmission::Terminal(status)) => {
                debug!(
                    application_id = %app.id,
                    status = %status,
                    "redelivery of a terminal application, dropping"
                );
                self.queue.ack(&delivery).await?;
                return Ok(());
            }
            Err(e) => {
                error!(application_id = %app.id, "could not admit application: {e}");
                return Ok(());
            }
        }
        self.emit(&app, ApplicationStatus::Processing, Some(app.status), None);

        match self.processor.process(&app).await {
            Ok(()) => {
                match self.store.finish(app.id, ApplicationStatus::Success, None).await {
                    Ok(transitioned) => {
                        if transitioned {
                            info!(application_id = %app.id, "application processed successfully");
                            self.emit(
                                &app,
                                ApplicationStatus::Success,
                                Some(ApplicationStatus::Processing),
                                None,
                            );
                        }
                        self.queue.ack(&delivery).await?;
                    }
                    Err(e) => {
                        // Leave the claim for redelivery; the terminal guard
                        // makes the retried transition idempotent.
                        error!(application_id = %app.id, "could not record success: {e}");
                    }
                }
            }
            Err(e) if e.is_retryable() && msg.retry_count < self.policy.max_retries => {
                let delay = self.policy.backoff_delay(msg.retry_count);
                warn!(
                    application_id = %app.id,
                    retry_count = msg.retry_count,
                    max_retries = self.policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "retryable processing failure, scheduling redelivery: {e}"
                );
                self.queue.nack(&delivery, true, delay).await?;
            }
            Err(e) => {
                let reason = if e.is_retryable() {
                    format!("Max retries exceeded: {e}")
                } else {
                    e.to_string()
                };
                self.fail(&delivery, &app, &e, &reason).await?;
            }
        }

        Ok(())
    }

    /// Terminal failure path: one failed transition, one dead letter. The
    /// `transitioned` guard keeps redeliveries from duplicating either.
    async fn fail(
        &self,
        delivery: &Delivery,
        app: &Application,
        cause: &ProcessingError,
        reason: &str,
    ) -> Result<(), QueueError> {
        error!(
            application_id = %app.id,
            retryable = cause.is_retryable(),
            "application failed permanently: {reason}"
        );

        match self
            .store
            .finish(app.id, ApplicationStatus::Failed, Some(reason))
            .await
        {
            Ok(transitioned) => {
                if transitioned {
                    self.emit(
                        app,
                        ApplicationStatus::Failed,
                        Some(ApplicationStatus::Processing),
                        Some(reason),
                    );
                    self.queue
                        .publish_dead_letter(&delivery.message, reason)
                        .await?;
                }
                self.queue.ack(delivery).await?;
            }
            Err(e) => {
                error!(application_id = %app.id, "could not record failure: {e}");
            }
        }
        Ok(())
    }

    fn emit(
        &self,
        app: &Application,
        status: ApplicationStatus,
        previous: Option<ApplicationStatus>,
        error_reason: Option<&str>,
    ) {
        self.events.emit(StatusChangedEvent {
            application_id: app.id,
            user_id: app.user_id.clone(),
            status,
            previous_status: previous,
            job_count: app.job_count,
            error_reason: error_reason.map(str::to_string),
            occurred_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use serde_json::json;
    use uuid::Uuid;

    use crate::applications::store::InMemoryApplicationStore;
    use crate::models::application::JobData;
    use crate::queue::memory::InMemoryQueue;
    use crate::queue::QueueMessage;

    /// Processor that replays a scripted sequence of outcomes, then succeeds.
    struct ScriptedProcessor {
        outcomes: Mutex<VecDeque<Result<(), ProcessingError>>>,
        calls: AtomicU32,
    }

    impl ScriptedProcessor {
        fn new(outcomes: Vec<Result<(), ProcessingError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl JobProcessor for ScriptedProcessor {
        async fn process(&self, _application: &Application) -> Result<(), ProcessingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }
    }

    struct Harness {
        store: Arc<InMemoryApplicationStore>,
        queue: Arc<InMemoryQueue>,
        processor: Arc<ScriptedProcessor>,
        worker: ProcessingWorker,
        events: EventBus,
    }

    fn harness(outcomes: Vec<Result<(), ProcessingError>>, max_retries: u32) -> Harness {
        let store = Arc::new(InMemoryApplicationStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let processor = Arc::new(ScriptedProcessor::new(outcomes));
        let events = EventBus::default();
        let worker = ProcessingWorker::new(
            store.clone(),
            queue.clone(),
            processor.clone(),
            events.clone(),
            RetryPolicy {
                max_retries,
                // Zero delays so redeliveries are immediately claimable.
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
        );
        Harness {
            store,
            queue,
            processor,
            worker,
            events,
        }
    }

    async fn submit(harness: &Harness, job_count: i32) -> Uuid {
        let now = Utc::now();
        let app = Application {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            jobs: (0..job_count)
                .map(|i| JobData {
                    title: format!("Role {i}"),
                    portal: Some("linkedin".to_string()),
                    company: None,
                    description: None,
                })
                .collect(),
            job_count,
            status: ApplicationStatus::Pending,
            resume_id: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            error_reason: None,
        };
        harness.store.create(&app).await.unwrap();
        harness
            .queue
            .publish(QueueMessage::new(
                app.id,
                app.user_id.clone(),
                json!({"job_count": job_count}),
            ))
            .await
            .unwrap();
        app.id
    }

    async fn drain(harness: &Harness) {
        while harness.worker.run_once().await.unwrap() {}
    }

    #[tokio::test]
    async fn test_successful_processing_reaches_success() {
        // Scenario: submit with 3 jobs, worker picks it up, processing
        // succeeds.
        let h = harness(vec![], 5);
        let mut rx = h.events.subscribe();
        let id = submit(&h, 3).await;

        drain(&h).await;

        let app = h.store.fetch(id).await.unwrap().unwrap();
        assert_eq!(app.status, ApplicationStatus::Success);
        assert!(app.processed_at.is_some());
        assert!(app.error_reason.is_none());
        assert_eq!(h.queue.depths().await.unwrap().ready, 0);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, ApplicationStatus::Processing);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.status, ApplicationStatus::Success);
        assert_eq!(second.job_count, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_on_first_attempt() {
        // Scenario: non-retryable error -> failed immediately, no retry,
        // dead-lettered at once.
        let h = harness(
            vec![Err(ProcessingError::NonRetryable(
                "posting no longer exists".to_string(),
            ))],
            5,
        );
        let id = submit(&h, 1).await;

        drain(&h).await;

        let app = h.store.fetch(id).await.unwrap().unwrap();
        assert_eq!(app.status, ApplicationStatus::Failed);
        assert_eq!(app.error_reason.as_deref(), Some("posting no longer exists"));
        assert_eq!(h.processor.calls(), 1);

        let depths = h.queue.depths().await.unwrap();
        assert_eq!(depths.ready, 0);
        assert_eq!(depths.dead_letters, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        // Scenario: retryable error three times, then success (max 5) ->
        // success, no dead letter.
        let retryable = || Err(ProcessingError::Retryable("portal timeout".to_string()));
        let h = harness(vec![retryable(), retryable(), retryable(), Ok(())], 5);
        let id = submit(&h, 1).await;

        drain(&h).await;

        let app = h.store.fetch(id).await.unwrap().unwrap();
        assert_eq!(app.status, ApplicationStatus::Success);
        assert!(app.error_reason.is_none());
        assert_eq!(h.processor.calls(), 4);

        let depths = h.queue.depths().await.unwrap();
        assert_eq!(depths.ready, 0);
        assert_eq!(depths.dead_letters, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_exactly_once() {
        let retryable = || Err(ProcessingError::Retryable("portal timeout".to_string()));
        let h = harness(vec![retryable(), retryable(), retryable()], 2);
        let id = submit(&h, 1).await;

        drain(&h).await;

        // Initial attempt + two retries, then the budget is spent.
        assert_eq!(h.processor.calls(), 3);
        let app = h.store.fetch(id).await.unwrap().unwrap();
        assert_eq!(app.status, ApplicationStatus::Failed);
        assert!(app
            .error_reason
            .as_deref()
            .unwrap()
            .starts_with("Max retries exceeded"));

        let depths = h.queue.depths().await.unwrap();
        assert_eq!(depths.ready, 0);
        assert_eq!(depths.dead_letters, 1);
    }

    #[tokio::test]
    async fn test_redelivery_of_terminal_application_is_dropped() {
        let h = harness(vec![], 5);
        let id = submit(&h, 1).await;
        drain(&h).await;
        assert_eq!(
            h.store.fetch(id).await.unwrap().unwrap().status,
            ApplicationStatus::Success
        );

        // A duplicate message for the already-terminal application.
        h.queue
            .publish(QueueMessage::new(id, "u1".to_string(), json!({"job_count": 1})))
            .await
            .unwrap();
        let calls_before = h.processor.calls();
        drain(&h).await;

        assert_eq!(h.processor.calls(), calls_before);
        let depths = h.queue.depths().await.unwrap();
        assert_eq!(depths.ready, 0);
        assert_eq!(depths.dead_letters, 0);
    }

    #[tokio::test]
    async fn test_missing_application_record_is_dead_lettered() {
        let h = harness(vec![], 5);
        h.queue
            .publish(QueueMessage::new(
                Uuid::new_v4(),
                "u1".to_string(),
                json!({"job_count": 1}),
            ))
            .await
            .unwrap();

        drain(&h).await;

        assert_eq!(h.processor.calls(), 0);
        assert_eq!(h.queue.depths().await.unwrap().dead_letters, 1);
    }
}
