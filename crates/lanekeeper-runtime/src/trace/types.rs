//! Trace records: what happened to one request, lane by lane.

use chrono::{DateTime, Utc};
use lanekeeper_core::config::duration;
use lanekeeper_core::{LaneKind, ProviderSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::resilience::{BreakerTransition, CircuitState, EffectiveTimeout};

/// Lifecycle of one lane execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneStatus {
    Pending,
    Running,
    Completed,
    Timeout,
    Failed,
    Skipped,
    CircuitOpen,
}

impl LaneStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::CircuitOpen => "circuit_open",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Terminal statuses that degrade the response.
    pub fn is_degraded(self) -> bool {
        matches!(self, Self::Timeout | Self::Failed | Self::CircuitOpen)
    }
}

impl fmt::Display for LaneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of a lane execution within its trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaneId(pub usize);

/// One retry, in call order within its lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based, strictly increasing within a lane
    pub attempt: u32,
    pub provider: String,
    pub source: ProviderSource,
    pub error: String,
    #[serde(with = "duration")]
    pub delay: Duration,
    pub at: DateTime<Utc>,
}

/// A breaker transition observed while the lane was running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerEvent {
    pub provider: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub failure_count: u32,
    pub at: DateTime<Utc>,
}

impl From<BreakerTransition> for CircuitBreakerEvent {
    fn from(t: BreakerTransition) -> Self {
        Self {
            provider: t.provider,
            from: t.from,
            to: t.to,
            failure_count: t.failure_count,
            at: t.at,
        }
    }
}

/// Budget as granted when the lane launched, plus what it used.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LaneBudgetSnapshot {
    #[serde(with = "duration")]
    pub allocation: Duration,
    #[serde(with = "duration")]
    pub granted: Duration,
    #[serde(with = "duration")]
    pub remaining_at_start: Duration,
    pub warning: bool,
    pub critical: bool,
    #[serde(with = "duration::option")]
    pub consumed: Option<Duration>,
}

impl From<&EffectiveTimeout> for LaneBudgetSnapshot {
    fn from(t: &EffectiveTimeout) -> Self {
        Self {
            allocation: t.allocation,
            granted: t.timeout,
            remaining_at_start: t.remaining,
            warning: t.warning,
            critical: t.critical,
            consumed: None,
        }
    }
}

/// One lane execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneTrace {
    pub lane: LaneKind,
    pub status: LaneStatus,
    pub provider: Option<String>,
    pub source: Option<ProviderSource>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(with = "duration::option")]
    pub duration: Option<Duration>,
    pub error: Option<String>,
    pub retry_attempts: Vec<RetryAttempt>,
    pub breaker_events: Vec<CircuitBreakerEvent>,
    pub budget: LaneBudgetSnapshot,
}

impl LaneTrace {
    pub(crate) fn new(lane: LaneKind, budget: LaneBudgetSnapshot) -> Self {
        Self {
            lane,
            status: LaneStatus::Pending,
            provider: None,
            source: None,
            started_at: None,
            ended_at: None,
            duration: None,
            error: None,
            retry_attempts: Vec::new(),
            breaker_events: Vec::new(),
            budget,
        }
    }
}

/// How a lane ended, as reported by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneCompletion {
    pub status: LaneStatus,
    pub provider: Option<String>,
    pub source: Option<ProviderSource>,
    pub error: Option<String>,
    /// Measured by the caller; the recorder's own clock is used otherwise
    pub consumed: Option<Duration>,
}

impl LaneCompletion {
    pub fn completed(provider: impl Into<String>, source: ProviderSource) -> Self {
        Self {
            status: LaneStatus::Completed,
            provider: Some(provider.into()),
            source: Some(source),
            error: None,
            consumed: None,
        }
    }

    pub fn failed(status: LaneStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            provider: None,
            source: None,
            error: Some(error.into()),
            consumed: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>, source: ProviderSource) -> Self {
        self.provider = Some(provider.into());
        self.source = Some(source);
        self
    }

    pub fn with_consumed(mut self, consumed: Duration) -> Self {
        self.consumed = Some(consumed);
        self
    }
}

/// The world as it looked when the request started. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub captured_at: DateTime<Utc>,
    /// Keyed by `lane/provider`
    pub provider_reachability: BTreeMap<String, bool>,
    pub resource_utilization: BTreeMap<String, f64>,
    pub endpoint_config: BTreeMap<String, String>,
    pub config_version: String,
}

impl EnvironmentSnapshot {
    pub fn empty(config_version: impl Into<String>) -> Self {
        Self {
            captured_at: Utc::now(),
            provider_reachability: BTreeMap::new(),
            resource_utilization: BTreeMap::new(),
            endpoint_config: BTreeMap::new(),
            config_version: config_version.into(),
        }
    }
}

/// Everything recorded for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalTrace {
    pub trace_id: String,
    pub request_id: String,
    pub scenario: String,
    pub environment: Arc<EnvironmentSnapshot>,
    pub lanes: Vec<LaneTrace>,
    pub degradation_flags: Vec<String>,
    pub uncertainty_flags: Vec<String>,
    pub overall_success: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(with = "duration::option")]
    pub total_duration: Option<Duration>,
}

impl GlobalTrace {
    pub fn lanes_with_status(&self, status: LaneStatus) -> impl Iterator<Item = &LaneTrace> {
        self.lanes.iter().filter(move |l| l.status == status)
    }

    pub fn is_degraded(&self) -> bool {
        !self.degradation_flags.is_empty()
    }
}

/// Aggregate over completed traces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub count: usize,
    pub success_rate: f64,
    pub degraded_count: usize,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
    pub lane_status_counts: BTreeMap<LaneKind, BTreeMap<LaneStatus, u64>>,
}
