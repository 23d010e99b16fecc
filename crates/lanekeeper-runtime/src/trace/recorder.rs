//! Trace recorder: builds a [`GlobalTrace`] per request and keeps a
//! bounded store of finished ones for auditing.

use chrono::Utc;
use lanekeeper_core::{LaneKind, ProviderSource};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use super::types::{
    CircuitBreakerEvent, EnvironmentSnapshot, GlobalTrace, LaneBudgetSnapshot, LaneCompletion,
    LaneId, LaneStatus, LaneTrace, RetryAttempt, TraceSummary,
};
use crate::metrics::percentile;
use crate::resilience::{BreakerTransition, CircuitBreaker, CircuitState, EffectiveTimeout};

/// Default number of finished traces kept.
pub const DEFAULT_MAX_COMPLETED: usize = 1000;

const DEADLINE_CANCELLED: &str = "cancelled at request deadline";

/// Errors from trace recording.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Trace '{trace_id}' has no lane #{lane}")]
    UnknownLane { trace_id: String, lane: usize },

    #[error("Lane #{lane} of trace '{trace_id}' is already finalized")]
    AlreadyFinalized { trace_id: String, lane: usize },

    #[error("Lane #{lane} of trace '{trace_id}' is not pending")]
    NotPending { trace_id: String, lane: usize },

    #[error("'{status}' is not a terminal lane status")]
    NotTerminal { status: LaneStatus },

    #[error("Trace '{0}' is already finished")]
    TraceClosed(String),

    #[error("No completed trace '{0}'")]
    UnknownTrace(String),

    #[error("Failed to serialize trace: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Captures the environment snapshot frozen into each trace.
pub trait EnvironmentProbe: Send + Sync {
    fn capture(&self) -> EnvironmentSnapshot;
}

/// A fixed environment, restamped on each capture.
#[derive(Debug, Clone)]
pub struct StaticEnvironment {
    snapshot: EnvironmentSnapshot,
}

impl StaticEnvironment {
    pub fn new(snapshot: EnvironmentSnapshot) -> Self {
        Self { snapshot }
    }
}

impl Default for StaticEnvironment {
    fn default() -> Self {
        Self::new(EnvironmentSnapshot::empty("unknown"))
    }
}

impl EnvironmentProbe for StaticEnvironment {
    fn capture(&self) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            captured_at: Utc::now(),
            ..self.snapshot.clone()
        }
    }
}

/// Reachability read from the circuit breakers: a provider whose circuit
/// is open counts as unreachable.
pub struct BreakerEnvironment {
    breakers: Arc<CircuitBreaker>,
    config_version: String,
    endpoint_config: BTreeMap<String, String>,
}

impl BreakerEnvironment {
    pub fn new(breakers: Arc<CircuitBreaker>, config_version: impl Into<String>) -> Self {
        Self {
            breakers,
            config_version: config_version.into(),
            endpoint_config: BTreeMap::new(),
        }
    }

    pub fn with_endpoint(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.endpoint_config.insert(name.into(), value.into());
        self
    }
}

impl EnvironmentProbe for BreakerEnvironment {
    fn capture(&self) -> EnvironmentSnapshot {
        let snapshot = self.breakers.snapshot();
        let open = snapshot
            .iter()
            .filter(|b| b.state == CircuitState::Open)
            .count();

        let mut resource_utilization = BTreeMap::new();
        if !snapshot.is_empty() {
            resource_utilization.insert(
                "open_circuit_ratio".to_string(),
                open as f64 / snapshot.len() as f64,
            );
        }

        EnvironmentSnapshot {
            captured_at: Utc::now(),
            provider_reachability: snapshot
                .into_iter()
                .map(|b| (format!("{}/{}", b.lane, b.provider), b.state != CircuitState::Open))
                .collect(),
            resource_utilization,
            endpoint_config: self.endpoint_config.clone(),
            config_version: self.config_version.clone(),
        }
    }
}

struct ActiveTrace {
    trace: GlobalTrace,
    started: Instant,
    lane_started: Vec<Option<Instant>>,
    closed: bool,
}

impl ActiveTrace {
    fn lane_mut(&mut self, id: LaneId) -> Result<&mut LaneTrace, TraceError> {
        let trace_id = &self.trace.trace_id;
        self.trace
            .lanes
            .get_mut(id.0)
            .ok_or_else(|| TraceError::UnknownLane {
                trace_id: trace_id.clone(),
                lane: id.0,
            })
    }

    fn ensure_open(&self) -> Result<(), TraceError> {
        if self.closed {
            return Err(TraceError::TraceClosed(self.trace.trace_id.clone()));
        }
        Ok(())
    }

    fn push_lane(&mut self, lane: LaneKind, budget: LaneBudgetSnapshot, running: bool) -> LaneId {
        let mut entry = LaneTrace::new(lane, budget);
        let started = if running {
            entry.status = LaneStatus::Running;
            entry.started_at = Some(Utc::now());
            Some(Instant::now())
        } else {
            None
        };
        self.trace.lanes.push(entry);
        self.lane_started.push(started);
        LaneId(self.trace.lanes.len() - 1)
    }

    fn finalize_lane(&mut self, id: LaneId, completion: LaneCompletion) -> Result<(), TraceError> {
        let started = self.lane_started.get(id.0).copied().flatten();
        let trace_id = self.trace.trace_id.clone();
        let entry = self.lane_mut(id)?;

        if entry.status.is_terminal() {
            return Err(TraceError::AlreadyFinalized {
                trace_id,
                lane: id.0,
            });
        }

        let consumed = completion
            .consumed
            .or_else(|| started.map(|s| s.elapsed()))
            .unwrap_or_default();

        entry.status = completion.status;
        if completion.provider.is_some() {
            entry.provider = completion.provider;
            entry.source = completion.source;
        }
        entry.error = completion.error;
        entry.ended_at = Some(Utc::now());
        entry.duration = Some(consumed);
        entry.budget.consumed = Some(consumed);
        Ok(())
    }
}

/// Per-request recording handle. Clone it into each lane task.
///
/// Appends within one trace keep call order.
#[derive(Clone)]
pub struct TraceHandle {
    trace_id: Arc<str>,
    state: Arc<Mutex<ActiveTrace>>,
}

impl TraceHandle {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn environment(&self) -> Arc<EnvironmentSnapshot> {
        Arc::clone(&self.state.lock().trace.environment)
    }

    /// Register a lane that has not launched yet.
    pub fn plan_lane(
        &self,
        lane: LaneKind,
        budget: &EffectiveTimeout,
    ) -> Result<LaneId, TraceError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        Ok(state.push_lane(lane, budget.into(), false))
    }

    /// Append a lane and mark it running.
    pub fn start_lane(
        &self,
        lane: LaneKind,
        budget: &EffectiveTimeout,
    ) -> Result<LaneId, TraceError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        Ok(state.push_lane(lane, budget.into(), true))
    }

    /// Move a planned lane to running.
    pub fn mark_running(&self, id: LaneId) -> Result<(), TraceError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let trace_id = state.trace.trace_id.clone();
        let entry = state.lane_mut(id)?;
        if entry.status != LaneStatus::Pending {
            return Err(TraceError::NotPending {
                trace_id,
                lane: id.0,
            });
        }
        entry.status = LaneStatus::Running;
        entry.started_at = Some(Utc::now());
        state.lane_started[id.0] = Some(Instant::now());
        Ok(())
    }

    /// Finalize a lane. Allowed exactly once.
    pub fn complete_lane(&self, id: LaneId, completion: LaneCompletion) -> Result<(), TraceError> {
        if !completion.status.is_terminal() {
            return Err(TraceError::NotTerminal {
                status: completion.status,
            });
        }
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.finalize_lane(id, completion)
    }

    /// Finalize a lane as skipped.
    pub fn skip_lane(&self, id: LaneId, reason: impl Into<String>) -> Result<(), TraceError> {
        self.complete_lane(id, LaneCompletion::failed(LaneStatus::Skipped, reason))
    }

    /// Append a retry; returns its attempt number.
    pub fn record_retry(
        &self,
        id: LaneId,
        provider: &str,
        source: ProviderSource,
        error: impl Into<String>,
        delay: Duration,
    ) -> Result<u32, TraceError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let entry = state.lane_mut(id)?;
        let attempt = entry.retry_attempts.len() as u32 + 1;
        entry.retry_attempts.push(RetryAttempt {
            attempt,
            provider: provider.to_string(),
            source,
            error: error.into(),
            delay,
            at: Utc::now(),
        });
        Ok(attempt)
    }

    pub fn record_breaker_event(
        &self,
        id: LaneId,
        transition: BreakerTransition,
    ) -> Result<(), TraceError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state
            .lane_mut(id)?
            .breaker_events
            .push(CircuitBreakerEvent::from(transition));
        Ok(())
    }

    /// Add a degradation flag (deduplicated).
    pub fn flag_degradation(&self, flag: impl Into<String>) {
        let flag = flag.into();
        let mut state = self.state.lock();
        if !state.trace.degradation_flags.contains(&flag) {
            state.trace.degradation_flags.push(flag);
        }
    }

    /// Add an uncertainty flag (deduplicated).
    pub fn flag_uncertainty(&self, flag: impl Into<String>) {
        let flag = flag.into();
        let mut state = self.state.lock();
        if !state.trace.uncertainty_flags.contains(&flag) {
            state.trace.uncertainty_flags.push(flag);
        }
    }

    /// Copy of the trace as recorded so far.
    pub fn snapshot(&self) -> GlobalTrace {
        self.state.lock().trace.clone()
    }
}

/// Process-wide recorder.
pub struct TraceRecorder {
    probe: Arc<dyn EnvironmentProbe>,
    active: RwLock<HashMap<String, TraceHandle>>,
    completed: RwLock<VecDeque<Arc<GlobalTrace>>>,
    max_completed: usize,
}

impl TraceRecorder {
    pub fn new(probe: Arc<dyn EnvironmentProbe>) -> Self {
        Self {
            probe,
            active: RwLock::new(HashMap::new()),
            completed: RwLock::new(VecDeque::new()),
            max_completed: DEFAULT_MAX_COMPLETED,
        }
    }

    pub fn with_max_completed(mut self, max_completed: usize) -> Self {
        self.max_completed = max_completed.max(1);
        self
    }

    /// Open a trace with a frozen environment snapshot.
    pub fn start_global(&self, request_id: &str, scenario: &str) -> TraceHandle {
        let trace_id = Uuid::new_v4().to_string();
        let trace = GlobalTrace {
            trace_id: trace_id.clone(),
            request_id: request_id.to_string(),
            scenario: scenario.to_string(),
            environment: Arc::new(self.probe.capture()),
            lanes: Vec::new(),
            degradation_flags: Vec::new(),
            uncertainty_flags: Vec::new(),
            overall_success: false,
            started_at: Utc::now(),
            ended_at: None,
            total_duration: None,
        };

        let handle = TraceHandle {
            trace_id: Arc::from(trace_id.as_str()),
            state: Arc::new(Mutex::new(ActiveTrace {
                trace,
                started: Instant::now(),
                lane_started: Vec::new(),
                closed: false,
            })),
        };
        self.active.write().insert(trace_id, handle.clone());
        handle
    }

    /// Close a trace and move it to completed storage.
    ///
    /// Lanes still running are recorded as timed out at the deadline and
    /// lanes never launched as skipped. `overall_success` defaults to "no
    /// degradation flag".
    pub fn finish_global(
        &self,
        handle: &TraceHandle,
        overall_success: Option<bool>,
    ) -> Result<Arc<GlobalTrace>, TraceError> {
        let finished = {
            let mut state = handle.state.lock();
            state.ensure_open()?;

            for index in 0..state.trace.lanes.len() {
                let completion = match state.trace.lanes[index].status {
                    LaneStatus::Running => {
                        LaneCompletion::failed(LaneStatus::Timeout, DEADLINE_CANCELLED)
                    }
                    LaneStatus::Pending => LaneCompletion::failed(
                        LaneStatus::Skipped,
                        "not launched before request end",
                    ),
                    _ => continue,
                };
                state.finalize_lane(LaneId(index), completion)?;
            }

            let flags: Vec<String> = state
                .trace
                .lanes
                .iter()
                .filter(|l| l.status.is_degraded())
                .map(|l| format!("{}_{}", l.lane, l.status))
                .collect();
            for flag in flags {
                if !state.trace.degradation_flags.contains(&flag) {
                    state.trace.degradation_flags.push(flag);
                }
            }

            state.trace.overall_success =
                overall_success.unwrap_or(state.trace.degradation_flags.is_empty());
            state.trace.ended_at = Some(Utc::now());
            state.trace.total_duration = Some(state.started.elapsed());
            state.closed = true;

            Arc::new(state.trace.clone())
        };

        self.active.write().remove(handle.trace_id());

        {
            let mut completed = self.completed.write();
            completed.push_back(Arc::clone(&finished));
            while completed.len() > self.max_completed {
                completed.pop_front();
            }
        }

        tracing::debug!(
            trace_id = %finished.trace_id,
            request_id = %finished.request_id,
            lanes = finished.lanes.len(),
            success = finished.overall_success,
            degradation = ?finished.degradation_flags,
            "Trace finalized"
        );
        Ok(finished)
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// A completed trace by id.
    pub fn get(&self, trace_id: &str) -> Option<Arc<GlobalTrace>> {
        self.completed
            .read()
            .iter()
            .rev()
            .find(|t| t.trace_id == trace_id)
            .cloned()
    }

    /// Stable snapshot of completed traces, oldest first.
    pub fn completed(&self) -> Vec<Arc<GlobalTrace>> {
        self.completed.read().iter().cloned().collect()
    }

    /// Success rate and duration percentiles over completed traces.
    pub fn summary(&self) -> TraceSummary {
        let traces = self.completed();
        if traces.is_empty() {
            return TraceSummary::default();
        }

        let mut durations: Vec<f64> = traces
            .iter()
            .filter_map(|t| t.total_duration)
            .map(|d| d.as_micros() as f64 / 1000.0)
            .collect();
        durations.sort_by(f64::total_cmp);

        let mut lane_status_counts: BTreeMap<LaneKind, BTreeMap<LaneStatus, u64>> =
            BTreeMap::new();
        for lane in traces.iter().flat_map(|t| t.lanes.iter()) {
            *lane_status_counts
                .entry(lane.lane)
                .or_default()
                .entry(lane.status)
                .or_default() += 1;
        }

        let successes = traces.iter().filter(|t| t.overall_success).count();
        TraceSummary {
            count: traces.len(),
            success_rate: successes as f64 / traces.len() as f64,
            degraded_count: traces.iter().filter(|t| t.is_degraded()).count(),
            p50_duration_ms: percentile(&durations, 50.0),
            p95_duration_ms: percentile(&durations, 95.0),
            p99_duration_ms: percentile(&durations, 99.0),
            lane_status_counts,
        }
    }

    /// Percentile of a lane's recorded durations across completed traces.
    pub fn lane_latency_percentile(&self, lane: LaneKind, p: f64) -> Option<Duration> {
        let mut micros: Vec<f64> = self
            .completed()
            .iter()
            .flat_map(|t| t.lanes.iter())
            .filter(|l| l.lane == lane)
            .filter_map(|l| l.duration)
            .map(|d| d.as_micros() as f64)
            .collect();
        if micros.is_empty() {
            return None;
        }
        micros.sort_by(f64::total_cmp);
        Some(Duration::from_micros(percentile(&micros, p) as u64))
    }

    /// Pretty JSON of one completed trace, for audit export.
    pub fn to_json(&self, trace_id: &str) -> Result<String, TraceError> {
        let trace = self
            .get(trace_id)
            .ok_or_else(|| TraceError::UnknownTrace(trace_id.to_string()))?;
        Ok(serde_json::to_string_pretty(trace.as_ref())?)
    }
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new(Arc::new(StaticEnvironment::default()))
    }
}
