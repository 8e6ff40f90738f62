//! Per-service health tracking and circuit breaking.
//!
//! Every external gateway gets a consecutive-failure state machine
//! (`Healthy -> Degraded(1..=3) -> Down`) and a circuit breaker. The registry
//! is passed explicitly to the pipeline rather than living in a global, and
//! `overall_status` aggregates the worst service level so every response can
//! carry `degraded` / `degradationLevel` annotations.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Consecutive failures before each degradation step.
const FAILURES_PER_LEVEL: u32 = 2;
/// Consecutive failures at which a service is reported fully down.
const DOWN_AFTER_FAILURES: u32 = 8;
/// With no new failures, the reported level steps down once per window.
const DEFAULT_DECAY_WINDOW: Duration = Duration::from_secs(30);
/// Probe successes required to close a half-open circuit.
const HALF_OPEN_CLOSE_AFTER: u32 = 3;
/// Concurrent probe requests admitted while half-open.
const HALF_OPEN_MAX_PROBES: u64 = 3;

/// External collaborators tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Embedding,
    VectorIndex,
    WebSearch,
    Completion,
    Cache,
    ChunkStore,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 6] = [
        ServiceKind::Embedding,
        ServiceKind::VectorIndex,
        ServiceKind::WebSearch,
        ServiceKind::Completion,
        ServiceKind::Cache,
        ServiceKind::ChunkStore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Embedding => "embedding",
            ServiceKind::VectorIndex => "vector-index",
            ServiceKind::WebSearch => "web-search",
            ServiceKind::Completion => "completion",
            ServiceKind::Cache => "cache",
            ServiceKind::ChunkStore => "chunk-store",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reported health of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Healthy,
    /// Degradation level 1 (mild) through 3 (severe).
    Degraded(u8),
    Down,
}

impl ServiceStatus {
    /// Numeric severity: 0 healthy, 1..=3 degraded, 4 down.
    pub fn severity(&self) -> u8 {
        match self {
            ServiceStatus::Healthy => 0,
            ServiceStatus::Degraded(level) => (*level).clamp(1, 3),
            ServiceStatus::Down => 4,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Healthy)
    }

    fn from_severity(severity: u8) -> Self {
        match severity {
            0 => ServiceStatus::Healthy,
            1..=3 => ServiceStatus::Degraded(severity),
            _ => ServiceStatus::Down,
        }
    }
}

#[derive(Default)]
struct ServiceHealth {
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    last_failure: RwLock<Option<Instant>>,
}

/// Process-wide health registry, shared by `Arc` across in-flight requests.
///
/// Reads and updates are lock-light: failure counters are atomics and the
/// per-service entries live in a concurrent map, so many requests can record
/// outcomes at once without coordination.
pub struct HealthRegistry {
    services: DashMap<ServiceKind, Arc<ServiceHealth>>,
    decay_window: Duration,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::with_decay_window(DEFAULT_DECAY_WINDOW)
    }

    /// Registry whose reported levels decay one step per `window` of quiet.
    pub fn with_decay_window(window: Duration) -> Self {
        Self {
            services: DashMap::new(),
            decay_window: window,
        }
    }

    fn entry(&self, kind: ServiceKind) -> Arc<ServiceHealth> {
        self.services
            .entry(kind)
            .or_insert_with(|| Arc::new(ServiceHealth::default()))
            .clone()
    }

    pub fn record_success(&self, kind: ServiceKind) {
        let entry = self.entry(kind);
        entry.consecutive_failures.store(0, Ordering::SeqCst);
        entry.total_successes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self, kind: ServiceKind) {
        let entry = self.entry(kind);
        let failures = entry.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        entry.total_failures.fetch_add(1, Ordering::SeqCst);
        *entry.last_failure.write() = Some(Instant::now());
        tracing::debug!(
            service = %kind,
            consecutive_failures = failures,
            "recorded service failure"
        );
    }

    /// Current status of one service: consecutive failures set the level,
    /// quiet time since the last failure steps it back down.
    pub fn status(&self, kind: ServiceKind) -> ServiceStatus {
        let entry = match self.services.get(&kind) {
            Some(entry) => entry.clone(),
            None => return ServiceStatus::Healthy,
        };

        let failures = entry.consecutive_failures.load(Ordering::SeqCst);
        if failures == 0 {
            return ServiceStatus::Healthy;
        }

        let mut severity = if failures >= DOWN_AFTER_FAILURES {
            4
        } else {
            failures.div_ceil(FAILURES_PER_LEVEL).min(3) as u8
        };

        if let Some(last) = *entry.last_failure.read() {
            let window_ms = self.decay_window.as_millis().max(1);
            let quiet_windows = (last.elapsed().as_millis() / window_ms).min(4) as u8;
            severity = severity.saturating_sub(quiet_windows);
        }

        ServiceStatus::from_severity(severity)
    }

    /// Worst-case status across every tracked service.
    pub fn overall_status(&self) -> ServiceStatus {
        let worst = ServiceKind::ALL
            .iter()
            .map(|kind| self.status(*kind).severity())
            .max()
            .unwrap_or(0);
        ServiceStatus::from_severity(worst)
    }

    /// Status of every service, for operational reporting.
    pub fn snapshot(&self) -> Vec<(ServiceKind, ServiceStatus)> {
        ServiceKind::ALL
            .iter()
            .map(|kind| (*kind, self.status(*kind)))
            .collect()
    }

    pub fn total_failures(&self, kind: ServiceKind) -> u64 {
        self.services
            .get(&kind)
            .map(|entry| entry.total_failures.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Clear one service back to healthy (operational override).
    pub fn reset(&self, kind: ServiceKind) {
        if let Some(entry) = self.services.get(&kind) {
            entry.consecutive_failures.store(0, Ordering::SeqCst);
            *entry.last_failure.write() = None;
        }
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected until the reset timeout elapses.
    Open,
    /// A limited number of probe requests test whether the service recovered.
    HalfOpen,
}

/// Circuit breaker guarding one external gateway.
///
/// Opens after `threshold` consecutive failures; after `timeout` of quiet the
/// next check admits up to three probes, and three probe successes close the
/// circuit again. Manual open/close/reset are exposed for operational use.
pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    last_failure_time: RwLock<Option<Instant>>,
    threshold: u32,
    timeout: Duration,
    half_open_probes: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_time: RwLock::new(None),
            threshold: threshold.max(1),
            timeout,
            half_open_probes: AtomicU64::new(0),
        }
    }

    /// Whether a request may go out right now.
    pub fn allow_request(&self) -> bool {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(last_failure) = *self.last_failure_time.read() {
                    if last_failure.elapsed() >= self.timeout {
                        *self.state.write() = CircuitState::HalfOpen;
                        self.half_open_probes.store(0, Ordering::SeqCst);
                        self.success_count.store(0, Ordering::SeqCst);
                        return true;
                    }
                }
                false
            }
            CircuitState::HalfOpen => {
                self.half_open_probes.fetch_add(1, Ordering::SeqCst) < HALF_OPEN_MAX_PROBES
            }
        }
    }

    pub fn record_success(&self) {
        let state = *self.state.read();
        if state == CircuitState::HalfOpen {
            let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
            if successes >= HALF_OPEN_CLOSE_AFTER {
                *self.state.write() = CircuitState::Closed;
                self.failure_count.store(0, Ordering::SeqCst);
                self.success_count.store(0, Ordering::SeqCst);
            }
        } else {
            self.failure_count.store(0, Ordering::SeqCst);
        }
    }

    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_failure_time.write() = Some(Instant::now());

        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                if failures >= self.threshold {
                    tracing::warn!(failures, "circuit opened");
                    *self.state.write() = CircuitState::Open;
                }
            }
            // Any failure while probing reopens immediately.
            CircuitState::HalfOpen => {
                *self.state.write() = CircuitState::Open;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Force the circuit open (operational kill switch).
    pub fn force_open(&self) {
        *self.state.write() = CircuitState::Open;
        *self.last_failure_time.write() = Some(Instant::now());
    }

    /// Force the circuit closed without waiting for probes.
    pub fn force_close(&self) {
        *self.state.write() = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.force_close();
        *self.last_failure_time.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults_healthy() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.status(ServiceKind::Embedding), ServiceStatus::Healthy);
        assert_eq!(registry.overall_status(), ServiceStatus::Healthy);
    }

    #[test]
    fn test_failures_escalate_levels() {
        let registry = HealthRegistry::new();
        let kind = ServiceKind::Completion;

        registry.record_failure(kind);
        assert_eq!(registry.status(kind), ServiceStatus::Degraded(1));

        registry.record_failure(kind);
        registry.record_failure(kind);
        assert_eq!(registry.status(kind), ServiceStatus::Degraded(2));

        for _ in 0..5 {
            registry.record_failure(kind);
        }
        assert_eq!(registry.status(kind), ServiceStatus::Down);
    }

    #[test]
    fn test_success_resets_to_healthy() {
        let registry = HealthRegistry::new();
        let kind = ServiceKind::WebSearch;

        registry.record_failure(kind);
        registry.record_failure(kind);
        assert!(!registry.status(kind).is_healthy());

        registry.record_success(kind);
        assert!(registry.status(kind).is_healthy());
    }

    #[test]
    fn test_overall_is_worst_case() {
        let registry = HealthRegistry::new();
        registry.record_failure(ServiceKind::Embedding);
        for _ in 0..4 {
            registry.record_failure(ServiceKind::Cache);
        }

        assert_eq!(registry.status(ServiceKind::Embedding), ServiceStatus::Degraded(1));
        assert_eq!(registry.status(ServiceKind::Cache), ServiceStatus::Degraded(2));
        assert_eq!(registry.overall_status(), ServiceStatus::Degraded(2));
    }

    #[test]
    fn test_quiet_time_decays_level() {
        let registry = HealthRegistry::with_decay_window(Duration::from_millis(40));
        let kind = ServiceKind::VectorIndex;

        registry.record_failure(kind);
        registry.record_failure(kind);
        registry.record_failure(kind);
        assert_eq!(registry.status(kind), ServiceStatus::Degraded(2));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(registry.status(kind), ServiceStatus::Degraded(1));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(registry.status(kind), ServiceStatus::Healthy);
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        breaker.record_failure();
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert!(breaker.allow_request());
        breaker.record_failure();

        assert!(!breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_circuit_half_open_after_timeout() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(80));

        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.allow_request());

        std::thread::sleep(Duration::from_millis(100));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_circuit_closes_after_probe_successes() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(80));

        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(100));
        assert!(breaker.allow_request());

        breaker.record_success();
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failure_while_half_open_reopens() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(80));

        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(100));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_manual_controls() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));

        breaker.force_open();
        assert!(!breaker.allow_request());

        breaker.force_close();
        assert!(breaker.allow_request());

        breaker.record_failure();
        breaker.reset();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
