//! Read-path acceleration with failure isolation.
//!
//! A distributed primary backend (Redis) sits behind a three-state circuit
//! breaker; an in-process cache takes over while the primary is unhealthy.
//! The cache is best effort only: a miss or an unavailable backend never
//! produces a wrong answer, just a slower trip to the status store.

pub mod memory;
pub mod redis;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use memory::MemoryCache;

#[derive(Debug, Error)]
#[error("cache backend error: {0}")]
pub struct CacheBackendError(pub String);

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheBackendError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheBackendError>;
    async fn delete(&self, key: &str) -> Result<(), CacheBackendError>;
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, primary serving.
    Closed,
    /// Primary bypassed; fallback only until the cooldown elapses.
    Open,
    /// Cooldown elapsed; one trial request probes the primary.
    HalfOpen,
}

/// Explicit finite automaton guarding the primary backend. Transitions are
/// driven by `try_acquire`/`record_*` under the owner's lock; the cooldown
/// guard is a timestamp, not a timer.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether the caller may contact the primary right now. While OPEN this
    /// flips to HALF_OPEN once the cooldown has elapsed, granting exactly one
    /// trial; further callers are refused until the trial outcome is
    /// recorded.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| t.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    debug!("cache circuit half-open, probing primary");
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            info!("cache circuit closed after successful probe");
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                warn!("cache circuit re-opened after failed probe");
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    warn!(
                        failures = self.failure_count,
                        "cache circuit opened, serving from fallback"
                    );
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// Cache key construction with consistent namespacing.
pub struct CacheKey;

impl CacheKey {
    const PREFIX: &'static str = "conveyor";

    /// Status entries are scoped by owner as well as id so a cache hit can
    /// never leak another user's application.
    pub fn application_status(user_id: &str, application_id: Uuid) -> String {
        format!("{}:app:{}:{}:status", Self::PREFIX, user_id, application_id)
    }
}

/// Layered cache: primary behind the breaker, in-process fallback otherwise.
/// Transparent to callers regardless of backend health.
pub struct CacheLayer {
    primary: Arc<dyn CacheBackend>,
    fallback: MemoryCache,
    breaker: Mutex<CircuitBreaker>,
    default_ttl: Duration,
}

impl CacheLayer {
    pub fn new(
        primary: Arc<dyn CacheBackend>,
        failure_threshold: u32,
        reset_timeout: Duration,
        default_ttl: Duration,
    ) -> Self {
        Self {
            primary,
            fallback: MemoryCache::new(1000),
            breaker: Mutex::new(CircuitBreaker::new(failure_threshold, reset_timeout)),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    #[allow(dead_code)]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().expect("breaker poisoned").state()
    }

    fn acquire(&self) -> bool {
        self.breaker.lock().expect("breaker poisoned").try_acquire()
    }

    fn record(&self, success: bool) {
        let mut breaker = self.breaker.lock().expect("breaker poisoned");
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if self.acquire() {
            match self.primary.get(key).await {
                Ok(value) => {
                    self.record(true);
                    return value;
                }
                Err(e) => {
                    warn!(key, "primary cache get failed: {e}");
                    self.record(false);
                }
            }
        }
        self.fallback.get(key)
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if self.acquire() {
            match self.primary.set(key, value, ttl).await {
                Ok(()) => {
                    self.record(true);
                    return;
                }
                Err(e) => {
                    warn!(key, "primary cache set failed: {e}");
                    self.record(false);
                }
            }
        }
        self.fallback.set(key, value, ttl);
    }

    /// Removes a key from both layers. The fallback is always purged so a
    /// recovering primary cannot leave a stale local entry behind.
    pub async fn delete(&self, key: &str) {
        self.fallback.delete(key);
        if self.acquire() {
            match self.primary.delete(key).await {
                Ok(()) => self.record(true),
                Err(e) => {
                    warn!(key, "primary cache delete failed: {e}");
                    self.record(false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FlakyBackend {
        failing: AtomicBool,
        calls: AtomicU32,
    }

    impl FlakyBackend {
        fn new(failing: bool) -> Self {
            Self {
                failing: AtomicBool::new(failing),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheBackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(CacheBackendError("connection refused".to_string()))
            } else {
                Ok(None)
            }
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheBackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(CacheBackendError("connection refused".to_string()))
            } else {
                Ok(())
            }
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheBackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(CacheBackendError("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_breaker_opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_breaker_success_resets_failure_streak() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_breaker_grants_exactly_one_trial_after_cooldown() {
        let mut breaker = CircuitBreaker::new(1, Duration::ZERO);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Zero cooldown: the next acquire is the single half-open trial.
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_breaker_failed_trial_restarts_cooldown() {
        let mut breaker = CircuitBreaker::new(1, Duration::ZERO);
        breaker.record_failure();
        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_circuit_serves_fallback_without_touching_primary() {
        let primary = Arc::new(FlakyBackend::new(true));
        // Long cooldown so the circuit stays open for the whole test.
        let cache = CacheLayer::new(primary.clone(), 2, Duration::from_secs(600), TTL);

        cache.get("k").await;
        cache.get("k").await;
        assert_eq!(cache.circuit_state(), CircuitState::Open);
        let calls_at_open = primary.calls();

        // While open, reads and writes are served locally.
        cache.set("k", "v", TTL).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(primary.calls(), calls_at_open);
    }

    #[tokio::test]
    async fn test_recovered_primary_closes_the_circuit() {
        let primary = Arc::new(FlakyBackend::new(true));
        let cache = CacheLayer::new(primary.clone(), 1, Duration::ZERO, TTL);

        cache.get("k").await;
        assert_eq!(cache.circuit_state(), CircuitState::Open);

        primary.failing.store(false, Ordering::SeqCst);
        // Cooldown of zero: this call is the half-open trial, and it succeeds.
        cache.get("k").await;
        assert_eq!(cache.circuit_state(), CircuitState::Closed);
    }
}
