//! Time budget management for fan-out requests.
//!
//! Each request gets a [`BudgetLedger`] derived from its tier's profile.
//! Lanes ask the ledger for an effective timeout before launching and
//! report their elapsed time when they finish.

use lanekeeper_core::config::duration;
use lanekeeper_core::{BudgetProfile, BudgetRegistry, ComplexityTier, ConfigError, LaneKind};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use thiserror::Error;

/// Remaining-after below this fraction of the global limit raises `warning`.
pub const WARNING_FRACTION: f64 = 0.20;

/// Remaining-after below this fraction of the global limit raises `critical`.
pub const CRITICAL_FRACTION: f64 = 0.05;

fn to_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Which budget was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "lane", rename_all = "snake_case")]
pub enum BudgetScope {
    Lane(LaneKind),
    Global,
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lane(lane) => write!(f, "lane '{}'", lane),
            Self::Global => write!(f, "global"),
        }
    }
}

/// Raised only by strict profiles. The orchestrator turns it into a
/// degraded response; it must never become a transport failure.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{scope} budget exceeded for request '{request_id}': consumed {consumed:?} of {limit:?}")]
pub struct BudgetExceededError {
    pub request_id: String,
    pub scope: BudgetScope,
    pub consumed: Duration,
    pub limit: Duration,
}

/// Errors from the budget tracker.
#[derive(Error, Debug)]
pub enum BudgetError {
    #[error("A budget ledger is already active for request '{0}'")]
    AlreadyActive(String),

    #[error("No active budget ledger for request '{0}'")]
    UnknownRequest(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Time budget for one scope (lane or request).
pub struct TimeBudget {
    /// Maximum time allowed
    pub limit: Duration,

    /// Consumed time in microseconds
    used: AtomicU64,
}

impl TimeBudget {
    /// Create a new time budget.
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    /// Record consumption; returns (previous total, new total).
    pub fn record(&self, elapsed: Duration) -> (Duration, Duration) {
        let micros = to_micros(elapsed);
        let before = self.used.fetch_add(micros, Ordering::SeqCst);
        (
            Duration::from_micros(before),
            Duration::from_micros(before.saturating_add(micros)),
        )
    }

    /// Get remaining time (zero once exhausted).
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.used())
    }

    /// Get consumed time.
    pub fn used(&self) -> Duration {
        Duration::from_micros(self.used.load(Ordering::SeqCst))
    }
}

/// The admission-control decision for one lane about to launch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectiveTimeout {
    pub lane: LaneKind,

    /// The lane's own allocation (zero when the profile has none)
    #[serde(with = "duration")]
    pub allocation: Duration,

    /// `min(allocation, remaining)`
    #[serde(with = "duration")]
    pub timeout: Duration,

    /// Request budget left before this grant
    #[serde(with = "duration")]
    pub remaining: Duration,

    /// Request budget left if the lane uses its whole timeout
    #[serde(with = "duration")]
    pub remaining_after: Duration,

    pub within_budget: bool,
    pub warning: bool,
    pub critical: bool,
}

/// What a usage report crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageCheck {
    pub lane_over_allocation: bool,
    pub global_over_limit: bool,
}

impl UsageCheck {
    pub fn is_over(&self) -> bool {
        self.lane_over_allocation || self.global_over_limit
    }
}

/// A recorded budget crossing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetViolation {
    pub scope: BudgetScope,
    #[serde(with = "duration")]
    pub consumed: Duration,
    #[serde(with = "duration")]
    pub limit: Duration,
    /// Raised as a hard failure (strict profile, beyond tolerance)
    pub hard: bool,
}

/// Per-lane row of a budget summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneUsage {
    pub lane: LaneKind,
    #[serde(with = "duration::option")]
    pub allocation: Option<Duration>,
    #[serde(with = "duration")]
    pub consumed: Duration,
    /// consumed / allocation; absent when the lane has no allocation
    pub utilization: Option<f64>,
    pub over_allocation: bool,
}

/// Produced once per ledger at request end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub request_id: String,
    pub tier: ComplexityTier,
    #[serde(with = "duration")]
    pub global_limit: Duration,
    #[serde(with = "duration")]
    pub consumed: Duration,
    #[serde(with = "duration")]
    pub remaining: Duration,
    pub utilization: f64,
    pub lanes: Vec<LaneUsage>,
    /// consumed ≤ global limit
    pub within_budget: bool,
    #[serde(with = "duration::option")]
    pub ttfb: Option<Duration>,
    pub ttfb_within: bool,
    /// Within tolerance, TTFB met, and no strict violation
    pub sla_passed: bool,
    pub hard_failure: bool,
    pub violations: Vec<BudgetViolation>,
    #[serde(with = "duration")]
    pub wall_clock: Duration,
}

/// Per-request mutable ledger.
///
/// Lane tasks of the same request share it through `Arc`; every update is
/// an atomic add, so racing `record_usage` calls never lose time.
pub struct BudgetLedger {
    request_id: String,
    tier: ComplexityTier,
    profile: Arc<BudgetProfile>,
    strict: bool,
    started_at: Instant,
    global: TimeBudget,
    lanes: HashMap<LaneKind, TimeBudget>,
    first_byte: OnceLock<Duration>,
    hard_failure: AtomicBool,
    violations: Mutex<Vec<BudgetViolation>>,
    summary: OnceLock<BudgetSummary>,
}

impl BudgetLedger {
    /// Create a ledger for one request.
    pub fn new(
        request_id: impl Into<String>,
        tier: ComplexityTier,
        profile: Arc<BudgetProfile>,
        strict_override: bool,
    ) -> Self {
        // Every lane gets a meter up front so the hot path never writes the map.
        let lanes = LaneKind::ALL
            .into_iter()
            .map(|lane| (lane, TimeBudget::new(profile.allocation(lane).unwrap_or_default())))
            .collect();

        Self {
            request_id: request_id.into(),
            tier,
            strict: profile.strict || strict_override,
            global: TimeBudget::new(profile.global_response_limit),
            profile,
            started_at: Instant::now(),
            lanes,
            first_byte: OnceLock::new(),
            hard_failure: AtomicBool::new(false),
            violations: Mutex::new(Vec::new()),
            summary: OnceLock::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn tier(&self) -> ComplexityTier {
        self.tier
    }

    pub fn profile(&self) -> &BudgetProfile {
        &self.profile
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Cumulative time recorded across all lanes.
    pub fn consumed(&self) -> Duration {
        self.global.used()
    }

    /// Global limit minus consumed, never negative.
    pub fn remaining(&self) -> Duration {
        self.global.remaining()
    }

    /// Time recorded for one lane.
    pub fn lane_consumed(&self, lane: LaneKind) -> Duration {
        self.lanes.get(&lane).map(TimeBudget::used).unwrap_or_default()
    }

    /// Compute the timeout a lane may use: `min(allocation, remaining)`.
    ///
    /// A lane is never handed more time than the request has left. Lanes
    /// without an allocation fail closed with a zero timeout.
    pub fn effective_timeout(&self, lane: LaneKind) -> EffectiveTimeout {
        let limit = self.profile.global_response_limit;
        let remaining = self.remaining();

        let allocation = match self.profile.allocation(lane) {
            Some(allocation) => allocation,
            None => {
                tracing::warn!(
                    request_id = %self.request_id,
                    tier = %self.tier,
                    lane = %lane,
                    "No allocation for lane, failing closed"
                );
                Duration::ZERO
            }
        };

        let timeout = allocation.min(remaining);
        let remaining_after = remaining.saturating_sub(timeout);
        let fraction = if limit.is_zero() {
            0.0
        } else {
            remaining_after.as_secs_f64() / limit.as_secs_f64()
        };

        EffectiveTimeout {
            lane,
            allocation,
            timeout,
            remaining,
            remaining_after,
            within_budget: !timeout.is_zero(),
            warning: fraction < WARNING_FRACTION,
            critical: fraction < CRITICAL_FRACTION,
        }
    }

    /// Record elapsed time for a lane. Monotonic: usage is only ever added.
    ///
    /// Crossings are reported in the returned [`UsageCheck`]. Strict ledgers
    /// return [`BudgetExceededError`] once usage passes the tolerated limit;
    /// the usage itself is recorded either way.
    pub fn record_usage(
        &self,
        lane: LaneKind,
        elapsed: Duration,
    ) -> Result<UsageCheck, BudgetExceededError> {
        let (lane_before, lane_total) = match self.lanes.get(&lane) {
            Some(meter) => meter.record(elapsed),
            None => (Duration::ZERO, elapsed),
        };
        let (global_before, global_total) = self.global.record(elapsed);

        let allocation = self.profile.allocation(lane).unwrap_or_default();
        let limit = self.profile.global_response_limit;

        let check = UsageCheck {
            lane_over_allocation: lane_total > allocation,
            global_over_limit: global_total > limit,
        };

        let lane_hard = self.strict && lane_total > self.profile.with_tolerance(allocation);
        let global_hard = self.strict && global_total > self.profile.with_tolerance(limit);

        // Log each crossing once: on the report that crossed it.
        if check.lane_over_allocation && lane_before <= allocation {
            self.note_violation(BudgetScope::Lane(lane), lane_total, allocation, lane_hard);
        }
        if check.global_over_limit && global_before <= limit {
            self.note_violation(BudgetScope::Global, global_total, limit, global_hard);
        }

        if global_hard || lane_hard {
            self.hard_failure.store(true, Ordering::SeqCst);
            let (scope, consumed, limit) = if global_hard {
                (BudgetScope::Global, global_total, limit)
            } else {
                (BudgetScope::Lane(lane), lane_total, allocation)
            };
            return Err(BudgetExceededError {
                request_id: self.request_id.clone(),
                scope,
                consumed,
                limit,
            });
        }

        Ok(check)
    }

    /// Record time to first byte. The first report wins.
    pub fn record_first_byte(&self, elapsed: Duration) -> bool {
        self.first_byte.set(elapsed).is_ok()
    }

    fn note_violation(&self, scope: BudgetScope, consumed: Duration, limit: Duration, hard: bool) {
        tracing::warn!(
            request_id = %self.request_id,
            scope = %scope,
            consumed = ?consumed,
            limit = ?limit,
            hard,
            "Budget exceeded"
        );
        self.violations.lock().push(BudgetViolation {
            scope,
            consumed,
            limit,
            hard,
        });
    }

    /// Summarize the ledger. Idempotent: later calls return the first summary.
    pub fn finish(&self) -> BudgetSummary {
        self.summary.get_or_init(|| self.summarize()).clone()
    }

    /// Whether [`finish`](Self::finish) has run.
    pub fn is_finished(&self) -> bool {
        self.summary.get().is_some()
    }

    fn summarize(&self) -> BudgetSummary {
        let limit = self.profile.global_response_limit;
        let consumed = self.consumed();

        let lanes: Vec<LaneUsage> = LaneKind::ALL
            .into_iter()
            .filter_map(|lane| {
                let allocation = self.profile.allocation(lane);
                let used = self.lane_consumed(lane);
                if allocation.is_none() && used.is_zero() {
                    return None;
                }
                let utilization = allocation
                    .filter(|a| !a.is_zero())
                    .map(|a| used.as_secs_f64() / a.as_secs_f64());
                Some(LaneUsage {
                    lane,
                    allocation,
                    consumed: used,
                    utilization,
                    over_allocation: used > allocation.unwrap_or_default(),
                })
            })
            .collect();

        let ttfb = self.first_byte.get().copied();
        let ttfb_within = ttfb
            .map(|t| t <= self.profile.with_tolerance(self.profile.ttfb_limit))
            .unwrap_or(true);
        let hard_failure = self.hard_failure.load(Ordering::SeqCst);
        let within_tolerance = consumed <= self.profile.with_tolerance(limit);

        BudgetSummary {
            request_id: self.request_id.clone(),
            tier: self.tier,
            global_limit: limit,
            consumed,
            remaining: self.remaining(),
            utilization: consumed.as_secs_f64() / limit.as_secs_f64(),
            lanes,
            within_budget: consumed <= limit,
            ttfb,
            ttfb_within,
            sla_passed: within_tolerance && ttfb_within && !hard_failure,
            hard_failure,
            violations: self.violations.lock().clone(),
            wall_clock: self.started_at.elapsed(),
        }
    }
}

/// Budget tracker: hands out one ledger per active request.
pub struct BudgetTracker {
    registry: Arc<BudgetRegistry>,
    active: RwLock<HashMap<String, Arc<BudgetLedger>>>,
    strict_override: bool,
}

impl BudgetTracker {
    /// Create a tracker over a loaded registry.
    pub fn new(registry: Arc<BudgetRegistry>) -> Self {
        Self {
            registry,
            active: RwLock::new(HashMap::new()),
            strict_override: false,
        }
    }

    /// Treat every profile as strict.
    pub fn with_strict_override(mut self, strict: bool) -> Self {
        self.strict_override = strict;
        self
    }

    pub fn registry(&self) -> &BudgetRegistry {
        &self.registry
    }

    /// Start a ledger for a request.
    pub fn begin(
        &self,
        request_id: &str,
        tier: ComplexityTier,
    ) -> Result<Arc<BudgetLedger>, BudgetError> {
        let profile = self.registry.get_profile(tier)?;

        let mut active = self.active.write();
        if active.contains_key(request_id) {
            return Err(BudgetError::AlreadyActive(request_id.to_string()));
        }

        let ledger = Arc::new(BudgetLedger::new(
            request_id,
            tier,
            profile,
            self.strict_override,
        ));
        active.insert(request_id.to_string(), Arc::clone(&ledger));

        tracing::debug!(request_id, tier = %tier, "Budget ledger opened");
        Ok(ledger)
    }

    /// Active ledger for a request.
    pub fn get(&self, request_id: &str) -> Option<Arc<BudgetLedger>> {
        self.active.read().get(request_id).cloned()
    }

    /// Close a request's ledger and return its summary.
    pub fn end(&self, request_id: &str) -> Result<BudgetSummary, BudgetError> {
        let ledger = self
            .active
            .write()
            .remove(request_id)
            .ok_or_else(|| BudgetError::UnknownRequest(request_id.to_string()))?;

        let summary = ledger.finish();
        tracing::debug!(
            request_id,
            utilization = summary.utilization,
            sla_passed = summary.sla_passed,
            "Budget ledger closed"
        );
        Ok(summary)
    }

    /// Number of requests with an open ledger.
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::new(Arc::new(BudgetRegistry::with_defaults()))
    }
}
