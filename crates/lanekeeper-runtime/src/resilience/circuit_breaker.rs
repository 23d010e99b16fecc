//! Circuit breaker to isolate failing providers.
//!
//! When a provider fails repeatedly for a lane, the circuit opens and
//! subsequent calls are rejected without being attempted. After the
//! recovery timeout a single probe is let through; its outcome decides
//! whether the circuit closes or reopens.
//!
//! ```text
//! Closed → Open:      failure_count >= failure_threshold
//! Open → HalfOpen:    recovery_timeout elapsed (one probe admitted)
//! HalfOpen → Closed:  probe succeeds (counters reset)
//! HalfOpen → Open:    probe fails (timer restarts)
//! ```

use chrono::{DateTime, Utc};
use lanekeeper_core::config::duration;
use lanekeeper_core::LaneKind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time before a recovery probe is admitted
    #[serde(with = "duration")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Provider is isolated, calls are rejected
    Open,

    /// One probe call is testing recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0 closed, 1 half-open, 2 open.
    pub fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker bookkeeping for one (lane, provider) pair.
#[derive(Debug, Clone)]
pub struct BreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout,
            opened_at: None,
        }
    }

    fn recovery_elapsed(&self) -> bool {
        self.opened_at
            .map(|t| t.elapsed() >= self.recovery_timeout)
            .unwrap_or(true)
    }
}

/// A state change, to be appended to the active lane trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerTransition {
    pub lane: LaneKind,
    pub provider: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub failure_count: u32,
    pub at: DateTime<Utc>,
}

/// Decision for one prospective provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    pub transition: Option<BreakerTransition>,
}

impl Admission {
    fn allow() -> Self {
        Self {
            allowed: true,
            transition: None,
        }
    }

    fn deny() -> Self {
        Self {
            allowed: false,
            transition: None,
        }
    }
}

/// Point-in-time copy of one breaker, for gauges and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub lane: LaneKind,
    pub provider: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

type BreakerKey = (LaneKind, String);

/// Registry of circuit breakers, one per (lane, provider).
///
/// Shared by every concurrent request; each transition happens under the
/// write lock so two requests can never both claim the half-open probe.
pub struct CircuitBreaker {
    states: RwLock<HashMap<BreakerKey, BreakerState>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker registry.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call to `provider` for `lane` may be attempted now.
    pub fn can_execute(&self, lane: LaneKind, provider: &str) -> bool {
        self.admit(lane, provider).allowed
    }

    /// Like [`can_execute`](Self::can_execute), also reporting the
    /// open → half-open transition the admission caused.
    pub fn admit(&self, lane: LaneKind, provider: &str) -> Admission {
        let key = (lane, provider.to_string());

        // Fast path: closed or unknown circuits only need the read lock.
        {
            let states = self.states.read();
            match states.get(&key) {
                None => return Admission::allow(),
                Some(s) if s.state == CircuitState::Closed => return Admission::allow(),
                _ => {}
            }
        }

        let mut states = self.states.write();
        let Some(entry) = states.get_mut(&key) else {
            return Admission::allow();
        };

        match entry.state {
            CircuitState::Closed => Admission::allow(),
            CircuitState::Open => {
                if !entry.recovery_elapsed() {
                    return Admission::deny();
                }
                entry.state = CircuitState::HalfOpen;
                tracing::info!(
                    lane = %lane,
                    provider = %provider,
                    "Circuit half-open, admitting recovery probe"
                );
                Admission {
                    allowed: true,
                    transition: Some(BreakerTransition {
                        lane,
                        provider: provider.to_string(),
                        from: CircuitState::Open,
                        to: CircuitState::HalfOpen,
                        failure_count: entry.failure_count,
                        at: Utc::now(),
                    }),
                }
            }
            // The probe is in flight until its outcome (or abandonment) is reported.
            CircuitState::HalfOpen => Admission::deny(),
        }
    }

    /// Record a successful provider call.
    pub fn on_success(&self, lane: LaneKind, provider: &str) -> Option<BreakerTransition> {
        let mut states = self.states.write();
        let entry = states
            .entry((lane, provider.to_string()))
            .or_insert_with(|| BreakerState::new(&self.config));

        match entry.state {
            CircuitState::HalfOpen => {
                let failures = entry.failure_count;
                entry.state = CircuitState::Closed;
                entry.failure_count = 0;
                entry.success_count = 0;
                entry.opened_at = None;
                tracing::info!(lane = %lane, provider = %provider, "Circuit closed after successful probe");
                Some(BreakerTransition {
                    lane,
                    provider: provider.to_string(),
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                    failure_count: failures,
                    at: Utc::now(),
                })
            }
            CircuitState::Closed => {
                // Reset failures on success
                entry.failure_count = 0;
                entry.success_count = entry.success_count.saturating_add(1);
                None
            }
            // Late result from a call admitted before the circuit opened.
            CircuitState::Open => None,
        }
    }

    /// Record a failed (or timed out) provider call.
    pub fn on_failure(&self, lane: LaneKind, provider: &str) -> Option<BreakerTransition> {
        let mut states = self.states.write();
        let entry = states
            .entry((lane, provider.to_string()))
            .or_insert_with(|| BreakerState::new(&self.config));

        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.last_failure_time = Some(Utc::now());

        let from = entry.state;
        match from {
            CircuitState::Closed if entry.failure_count >= entry.failure_threshold => {
                tracing::warn!(
                    lane = %lane,
                    provider = %provider,
                    failures = entry.failure_count,
                    "Circuit opened after repeated failures"
                );
            }
            CircuitState::HalfOpen => {
                tracing::warn!(lane = %lane, provider = %provider, "Circuit reopened after failed probe");
            }
            _ => return None,
        }

        entry.state = CircuitState::Open;
        entry.success_count = 0;
        entry.opened_at = Some(Instant::now());

        Some(BreakerTransition {
            lane,
            provider: provider.to_string(),
            from,
            to: CircuitState::Open,
            failure_count: entry.failure_count,
            at: Utc::now(),
        })
    }

    /// Give back a half-open probe whose call never produced an outcome.
    ///
    /// The circuit returns to open with its original timer, so the next
    /// admission may probe again. No failure is counted.
    pub fn abandon_probe(&self, lane: LaneKind, provider: &str) -> Option<BreakerTransition> {
        let mut states = self.states.write();
        let entry = states.get_mut(&(lane, provider.to_string()))?;
        if entry.state != CircuitState::HalfOpen {
            return None;
        }
        entry.state = CircuitState::Open;
        tracing::debug!(lane = %lane, provider = %provider, "Recovery probe abandoned");
        Some(BreakerTransition {
            lane,
            provider: provider.to_string(),
            from: CircuitState::HalfOpen,
            to: CircuitState::Open,
            failure_count: entry.failure_count,
            at: Utc::now(),
        })
    }

    /// Current state of a circuit (closed if never used).
    pub fn state(&self, lane: LaneKind, provider: &str) -> BreakerState {
        self.states
            .read()
            .get(&(lane, provider.to_string()))
            .cloned()
            .unwrap_or_else(|| BreakerState::new(&self.config))
    }

    /// Copies of every known circuit, ordered by (lane, provider).
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = self
            .states
            .read()
            .iter()
            .map(|((lane, provider), s)| BreakerSnapshot {
                lane: *lane,
                provider: provider.clone(),
                state: s.state,
                failure_count: s.failure_count,
                success_count: s.success_count,
                last_failure_time: s.last_failure_time,
            })
            .collect();
        out.sort_by(|a, b| (a.lane, &a.provider).cmp(&(b.lane, &b.provider)));
        out
    }

    /// Reset all circuits to closed.
    pub fn reset(&self) {
        self.states.write().clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(20),
        })
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::default();
        assert!(cb.can_execute(LaneKind::Web, "brave"));
        assert_eq!(cb.state(LaneKind::Web, "brave").state, CircuitState::Closed);
    }

    #[test]
    fn test_circuit_opens_after_failures() {
        let cb = fast_breaker(2);

        assert!(cb.on_failure(LaneKind::Web, "brave").is_none());
        assert!(cb.can_execute(LaneKind::Web, "brave"));

        let transition = cb.on_failure(LaneKind::Web, "brave").unwrap();
        assert_eq!(transition.from, CircuitState::Closed);
        assert_eq!(transition.to, CircuitState::Open);
        assert!(!cb.can_execute(LaneKind::Web, "brave"));
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = CircuitBreaker::default();

        cb.on_failure(LaneKind::Web, "brave");
        cb.on_failure(LaneKind::Web, "brave");
        cb.on_success(LaneKind::Web, "brave");

        // Need 3 more consecutive failures to open
        cb.on_failure(LaneKind::Web, "brave");
        cb.on_failure(LaneKind::Web, "brave");
        assert!(cb.can_execute(LaneKind::Web, "brave"));
        assert_eq!(cb.state(LaneKind::Web, "brave").failure_count, 2);
    }

    #[test]
    fn test_half_open_admits_single_probe_then_closes() {
        let cb = fast_breaker(2);
        cb.on_failure(LaneKind::Web, "brave");
        cb.on_failure(LaneKind::Web, "brave");
        assert!(!cb.can_execute(LaneKind::Web, "brave"));

        std::thread::sleep(Duration::from_millis(30));

        let admission = cb.admit(LaneKind::Web, "brave");
        assert!(admission.allowed);
        assert_eq!(admission.transition.unwrap().to, CircuitState::HalfOpen);
        assert!(!cb.can_execute(LaneKind::Web, "brave"));

        let transition = cb.on_success(LaneKind::Web, "brave").unwrap();
        assert_eq!(transition.to, CircuitState::Closed);

        let state = cb.state(LaneKind::Web, "brave");
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.success_count, 0);
        assert!(cb.can_execute(LaneKind::Web, "brave"));
    }

    #[test]
    fn test_failed_probe_reopens_and_restarts_timer() {
        let cb = fast_breaker(1);
        cb.on_failure(LaneKind::Vector, "qdrant");
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.can_execute(LaneKind::Vector, "qdrant"));

        let transition = cb.on_failure(LaneKind::Vector, "qdrant").unwrap();
        assert_eq!(transition.from, CircuitState::HalfOpen);
        assert_eq!(transition.to, CircuitState::Open);
        assert!(!cb.can_execute(LaneKind::Vector, "qdrant"));

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.can_execute(LaneKind::Vector, "qdrant"));
    }

    #[test]
    fn test_slow_probe_blocks_second_probe_until_abandoned() {
        let cb = fast_breaker(1);
        cb.on_failure(LaneKind::Web, "brave");
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.can_execute(LaneKind::Web, "brave"));

        // Probe still running well past the recovery timeout.
        std::thread::sleep(Duration::from_millis(60));
        assert!(!cb.can_execute(LaneKind::Web, "brave"));
        assert_eq!(cb.state(LaneKind::Web, "brave").state, CircuitState::HalfOpen);

        let transition = cb.abandon_probe(LaneKind::Web, "brave").unwrap();
        assert_eq!(transition.to, CircuitState::Open);
        assert_eq!(cb.state(LaneKind::Web, "brave").failure_count, 1);

        let admission = cb.admit(LaneKind::Web, "brave");
        assert!(admission.allowed);
        assert_eq!(admission.transition.unwrap().to, CircuitState::HalfOpen);
        assert!(cb.abandon_probe(LaneKind::Llm, "openai").is_none());
    }

    #[test]
    fn test_breakers_are_independent() {
        let cb = fast_breaker(2);

        cb.on_failure(LaneKind::Web, "brave");
        cb.on_failure(LaneKind::Web, "brave");

        assert!(!cb.can_execute(LaneKind::Web, "brave"));
        assert!(cb.can_execute(LaneKind::Web, "duckduckgo"));
        assert!(cb.can_execute(LaneKind::Vector, "brave"));
    }

    #[test]
    fn test_only_one_concurrent_probe() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(200),
        });
        cb.on_failure(LaneKind::Llm, "openai");
        std::thread::sleep(Duration::from_millis(220));

        let admitted = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if cb.can_execute(LaneKind::Llm, "openai") {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_snapshot_is_sorted_copy() {
        let cb = fast_breaker(1);
        cb.on_failure(LaneKind::Web, "tavily");
        cb.on_success(LaneKind::Llm, "openai");
        cb.on_failure(LaneKind::Web, "brave");

        let snapshot = cb.snapshot();
        let keys: Vec<_> = snapshot.iter().map(|s| (s.lane, s.provider.as_str())).collect();
        assert_eq!(
            keys,
            vec![
                (LaneKind::Llm, "openai"),
                (LaneKind::Web, "brave"),
                (LaneKind::Web, "tavily"),
            ]
        );
        assert_eq!(snapshot[1].state, CircuitState::Open);

        cb.reset();
        assert!(cb.snapshot().is_empty());
    }
}
