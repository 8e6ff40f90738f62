//! Retry, fallback, and circuit-breaking for external gateway calls.
//!
//! `ErrorRecoveryService::attempt_recovery` is the single choke point every
//! recoverable gateway call goes through: bounded retries with exponential
//! backoff behind a per-service circuit breaker, then an optional fallback.
//! The strategy that produced the value is recorded for observability.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::RecoveryConfig;
use crate::error::{RagError, RagResult};
use crate::health::{CircuitBreaker, CircuitState, HealthRegistry, ServiceKind};

/// How a recovered value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// First call succeeded; no recovery was needed.
    None,
    /// A retry after at least one failure succeeded.
    Retry,
    /// Retries were exhausted and the fallback produced the value.
    Fallback,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::None => "none",
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
        }
    }
}

/// A successful outcome plus how it was reached.
#[derive(Debug)]
pub struct Recovered<T> {
    pub value: T,
    pub strategy: RecoveryStrategy,
    pub attempts: u32,
}

#[derive(Default)]
struct StrategyCounters {
    retries: AtomicU64,
    fallbacks: AtomicU64,
    exhaustions: AtomicU64,
}

pub struct ErrorRecoveryService {
    registry: Arc<HealthRegistry>,
    breakers: DashMap<ServiceKind, Arc<CircuitBreaker>>,
    counters: DashMap<ServiceKind, Arc<StrategyCounters>>,
    config: RecoveryConfig,
}

impl ErrorRecoveryService {
    pub fn new(registry: Arc<HealthRegistry>, config: RecoveryConfig) -> Self {
        Self {
            registry,
            breakers: DashMap::new(),
            counters: DashMap::new(),
            config,
        }
    }

    /// The circuit breaker guarding one service, exposed for manual
    /// open/close/reset.
    pub fn breaker(&self, service: ServiceKind) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.config.breaker_failure_threshold,
                    Duration::from_secs(self.config.breaker_reset_secs),
                ))
            })
            .clone()
    }

    fn counters(&self, service: ServiceKind) -> Arc<StrategyCounters> {
        self.counters
            .entry(service)
            .or_insert_with(|| Arc::new(StrategyCounters::default()))
            .clone()
    }

    /// (retries, fallbacks, exhaustions) recorded for one service.
    pub fn strategy_totals(&self, service: ServiceKind) -> (u64, u64, u64) {
        let counters = self.counters(service);
        (
            counters.retries.load(Ordering::Relaxed),
            counters.fallbacks.load(Ordering::Relaxed),
            counters.exhaustions.load(Ordering::Relaxed),
        )
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << (attempt - 1).min(16));
        Duration::from_millis(exp.min(self.config.max_delay_ms))
    }

    /// Run `retry_fn` with bounded retries; on exhaustion run `fallback_fn`
    /// when supplied. Every outcome feeds the health registry and the
    /// service's circuit breaker.
    pub async fn attempt_recovery<T, R, RFut, F, FFut>(
        &self,
        service: ServiceKind,
        mut retry_fn: R,
        fallback_fn: Option<F>,
    ) -> RagResult<Recovered<T>>
    where
        R: FnMut() -> RFut + Send,
        RFut: Future<Output = anyhow::Result<T>> + Send,
        F: FnOnce() -> FFut + Send,
        FFut: Future<Output = anyhow::Result<T>> + Send,
        T: Send,
    {
        let breaker = self.breaker(service);
        let counters = self.counters(service);
        let mut last_error: Option<anyhow::Error> = None;
        let mut attempts = 0;

        if breaker.allow_request() {
            for attempt in 1..=self.config.max_attempts {
                attempts = attempt;
                match retry_fn().await {
                    Ok(value) => {
                        breaker.record_success();
                        self.registry.record_success(service);
                        let strategy = if attempt == 1 {
                            RecoveryStrategy::None
                        } else {
                            counters.retries.fetch_add(1, Ordering::Relaxed);
                            RecoveryStrategy::Retry
                        };
                        tracing::debug!(
                            service = %service,
                            strategy = strategy.as_str(),
                            attempts = attempt,
                            "call recovered"
                        );
                        return Ok(Recovered {
                            value,
                            strategy,
                            attempts: attempt,
                        });
                    }
                    Err(err) => {
                        breaker.record_failure();
                        self.registry.record_failure(service);
                        tracing::warn!(
                            service = %service,
                            attempt,
                            max_attempts = self.config.max_attempts,
                            error = %err,
                            "gateway call failed"
                        );
                        last_error = Some(err);

                        if breaker.state() == CircuitState::Open {
                            break;
                        }
                        if attempt < self.config.max_attempts {
                            tokio::time::sleep(self.backoff_delay(attempt)).await;
                        }
                    }
                }
            }
        } else {
            tracing::warn!(service = %service, "circuit open, skipping retries");
        }

        if let Some(fallback) = fallback_fn {
            match fallback().await {
                Ok(value) => {
                    counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(service = %service, attempts, "fallback produced a value");
                    return Ok(Recovered {
                        value,
                        strategy: RecoveryStrategy::Fallback,
                        attempts,
                    });
                }
                Err(err) => {
                    tracing::warn!(service = %service, error = %err, "fallback failed");
                    last_error = Some(err);
                }
            }
        }

        counters.exhaustions.fetch_add(1, Ordering::Relaxed);
        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "circuit open and no fallback available".to_string());
        Err(RagError::upstream(service, message))
    }

    /// Retry-only variant for calls with no meaningful fallback.
    pub async fn retry<T, R, RFut>(
        &self,
        service: ServiceKind,
        retry_fn: R,
    ) -> RagResult<Recovered<T>>
    where
        R: FnMut() -> RFut + Send,
        RFut: Future<Output = anyhow::Result<T>> + Send,
        T: Send,
    {
        self.attempt_recovery(
            service,
            retry_fn,
            None::<fn() -> std::future::Ready<anyhow::Result<T>>>,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            breaker_failure_threshold: 5,
            breaker_reset_secs: 30,
        }
    }

    fn service() -> ErrorRecoveryService {
        ErrorRecoveryService::new(Arc::new(HealthRegistry::new()), fast_config())
    }

    #[tokio::test]
    async fn test_first_try_success_needs_no_recovery() {
        let recovery = service();
        let recovered = recovery
            .retry(ServiceKind::Embedding, || async { Ok(42u32) })
            .await
            .unwrap();
        assert_eq!(recovered.value, 42);
        assert_eq!(recovered.strategy, RecoveryStrategy::None);
        assert_eq!(recovered.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let recovery = service();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let recovered = recovery
            .retry(ServiceKind::VectorIndex, move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(anyhow!("transient"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(recovered.value, "ok");
        assert_eq!(recovered.strategy, RecoveryStrategy::Retry);
        assert_eq!(recovered.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fallback_after_exhaustion() {
        let recovery = service();
        let recovered = recovery
            .attempt_recovery(
                ServiceKind::WebSearch,
                || async { Err::<&str, _>(anyhow!("down")) },
                Some(|| async { Ok("from fallback") }),
            )
            .await
            .unwrap();

        assert_eq!(recovered.value, "from fallback");
        assert_eq!(recovered.strategy, RecoveryStrategy::Fallback);
        let (_, fallbacks, _) = recovery.strategy_totals(ServiceKind::WebSearch);
        assert_eq!(fallbacks, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_without_fallback_errors() {
        let recovery = service();
        let err = recovery
            .retry(ServiceKind::Completion, || async {
                Err::<(), _>(anyhow!("boom"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "UPSTREAM_SERVICE_ERROR");
        let (_, _, exhaustions) = recovery.strategy_totals(ServiceKind::Completion);
        assert_eq!(exhaustions, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_retries() {
        let recovery = service();
        recovery.breaker(ServiceKind::Embedding).force_open();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let recovered = recovery
            .attempt_recovery(
                ServiceKind::Embedding,
                move || {
                    let calls = calls_in.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(1u8)
                    }
                },
                Some(|| async { Ok(2u8) }),
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(recovered.value, 2);
        assert_eq!(recovered.strategy, RecoveryStrategy::Fallback);
    }

    #[tokio::test]
    async fn test_failures_feed_health_registry() {
        let registry = Arc::new(HealthRegistry::new());
        let recovery = ErrorRecoveryService::new(registry.clone(), fast_config());

        let _ = recovery
            .retry(ServiceKind::WebSearch, || async {
                Err::<(), _>(anyhow!("down"))
            })
            .await;

        assert!(!registry.status(ServiceKind::WebSearch).is_healthy());
        assert_eq!(registry.total_failures(ServiceKind::WebSearch), 3);
    }
}
