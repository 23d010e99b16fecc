//! Orchestrator-facing facade over the request-path subsystems.
//!
//! The coordinator does not schedule lanes. The orchestrator spawns one task
//! per lane and calls into a shared [`LaneCoordinator`]; each call hands the
//! task its sub-deadline and records what happened:
//! - Budget ledger: effective timeouts and usage
//! - Circuit breakers: admission before every provider call
//! - Fallback metrics: one event per provider call
//! - Trace recorder: lanes, retries and breaker transitions in call order
//!
//! Lane failures never escape as errors. [`LaneCoordinator::run_lane`]
//! returns a [`LaneOutcome`] and the request is marked degraded instead.

use backon::{BackoffBuilder, ExponentialBuilder};
use lanekeeper_core::config::duration;
use lanekeeper_core::{ComplexityTier, ConfigError, LaneKind, ProviderSource};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::Settings;
use crate::metrics::{MetricLabels, MetricRecord, MetricsExporter};
use crate::providers::{ProviderCandidate, ProviderError};
use crate::resilience::{
    BreakerTransition, BudgetError, BudgetLedger, BudgetSummary, BudgetTracker, CircuitBreaker,
    EffectiveTimeout, FallbackEvent, FallbackMetrics, UsageCheck,
};
use crate::trace::{
    BreakerEnvironment, GlobalTrace, LaneCompletion, LaneId, LaneStatus, TraceError, TraceHandle,
    TraceRecorder,
};

/// Errors from request bookkeeping (not from lanes).
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("lane {lane} reported with non-terminal status {status}")]
    NonTerminalStatus { lane: LaneKind, status: LaneStatus },
}

/// Backoff between provider attempts within one lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Calls per candidate before moving to the next one
    pub attempts_per_provider: u32,

    #[serde(with = "duration")]
    pub min_delay: Duration,

    #[serde(with = "duration")]
    pub max_delay: Duration,

    pub factor: f32,

    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts_per_provider: 1,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    fn backoff(&self, max_times: usize) -> impl Iterator<Item = Duration> {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.factor)
            .with_max_times(max_times);
        if self.jitter {
            builder.with_jitter().build()
        } else {
            builder.build()
        }
    }
}

/// Result of one lane, as handed back to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum LaneOutcome<T> {
    Completed {
        value: T,
        provider: String,
        source: ProviderSource,
    },
    Degraded {
        status: LaneStatus,
        reason: String,
    },
}

impl<T> LaneOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Completed { value, .. } => Some(value),
            Self::Degraded { .. } => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Completed { value, .. } => Some(value),
            Self::Degraded { .. } => None,
        }
    }
}

/// A lane the orchestrator ran itself.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneReport {
    pub lane: LaneKind,
    pub status: LaneStatus,
    pub provider: Option<ProviderCandidate>,
    pub consumed: Duration,
    pub fallback_used: bool,
    pub error: Option<String>,
    /// Grant obtained at launch; computed at report time when absent
    pub granted: Option<EffectiveTimeout>,
}

impl LaneReport {
    pub fn completed(lane: LaneKind, provider: ProviderCandidate, consumed: Duration) -> Self {
        Self {
            lane,
            status: LaneStatus::Completed,
            fallback_used: provider.is_keyless(),
            provider: Some(provider),
            consumed,
            error: None,
            granted: None,
        }
    }

    pub fn failed(
        lane: LaneKind,
        status: LaneStatus,
        error: impl Into<String>,
        consumed: Duration,
    ) -> Self {
        Self {
            lane,
            status,
            provider: None,
            consumed,
            fallback_used: false,
            error: Some(error.into()),
            granted: None,
        }
    }

    pub fn with_provider(mut self, provider: ProviderCandidate) -> Self {
        self.fallback_used |= provider.is_keyless();
        self.provider = Some(provider);
        self
    }

    pub fn with_fallback_used(mut self, used: bool) -> Self {
        self.fallback_used = used;
        self
    }

    pub fn with_granted(mut self, granted: EffectiveTimeout) -> Self {
        self.granted = Some(granted);
        self
    }
}

/// Per-request state shared by the request's lane tasks.
pub struct RequestContext {
    request_id: String,
    ledger: Arc<BudgetLedger>,
    trace: TraceHandle,
    started: Instant,
}

impl RequestContext {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn trace(&self) -> &TraceHandle {
        &self.trace
    }

    pub fn trace_id(&self) -> &str {
        self.trace.trace_id()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Everything recorded for one finished request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub budget: BudgetSummary,
    pub trace: Arc<GlobalTrace>,
}

impl RequestSummary {
    pub fn is_degraded(&self) -> bool {
        self.trace.is_degraded()
    }
}

/// How a provider walk ended without a result.
struct Exhausted {
    status: LaneStatus,
    reason: String,
    last: Option<ProviderCandidate>,
}

/// A provider call that has been started but has not returned.
struct InFlight {
    candidate: ProviderCandidate,
    started: Instant,
    fallback_used: bool,
}

/// Settles a lane whose future is dropped before it returns.
///
/// The orchestrator cancels stragglers by dropping them. Time spent up to
/// the drop is still charged to the ledger, a call in flight counts as a
/// timeout (which also settles a half-open probe), and the trace entry is
/// closed with what was consumed.
struct LaneGuard<'a> {
    coordinator: &'a LaneCoordinator,
    ctx: &'a RequestContext,
    lane: LaneKind,
    id: Option<LaneId>,
    started: Instant,
    in_flight: Option<InFlight>,
    settled: bool,
}

impl LaneGuard<'_> {
    /// Time used by the lane. Nothing is settled on drop afterwards.
    fn settle(&mut self) -> Duration {
        self.settled = true;
        self.started.elapsed()
    }
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let (coordinator, ctx, lane) = (self.coordinator, self.ctx, self.lane);
        let consumed = self.started.elapsed();
        tracing::warn!(
            request_id = %ctx.request_id,
            lane = %lane,
            consumed = ?consumed,
            "Lane cancelled before completion"
        );

        let mut completion = LaneCompletion::failed(LaneStatus::Timeout, "cancelled before completion")
            .with_consumed(consumed);

        if let Some(call) = self.in_flight.take() {
            let InFlight {
                candidate,
                started,
                fallback_used,
            } = call;
            if let Some(transition) = coordinator.breakers.on_failure(lane, &candidate.provider) {
                if let Some(id) = self.id {
                    coordinator.trace_breaker(ctx, id, transition);
                }
            }
            coordinator.metrics.record(
                FallbackEvent::new(lane, &candidate.provider, candidate.source)
                    .with_latency(started.elapsed())
                    .with_fallback_used(fallback_used)
                    .with_trace_id(ctx.trace_id())
                    .with_timeout(),
            );
            completion = completion.with_provider(candidate.provider, candidate.source);
        }

        coordinator.record_usage(ctx, lane, consumed);
        if let Some(id) = self.id {
            coordinator.finalize_trace(ctx, id, completion);
        }
    }
}

/// Wires budget, breakers, metrics and traces for concurrent requests.
///
/// # Example
/// ```rust,ignore
/// let coordinator = LaneCoordinator::from_settings(Settings::load(None)?)?;
/// let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search")?;
/// let outcome = coordinator
///     .run_lane(&ctx, LaneKind::Web, candidates, |candidate, timeout| {
///         search(candidate, timeout)
///     })
///     .await;
/// let summary = coordinator.end(ctx)?;
/// ```
pub struct LaneCoordinator {
    settings: Settings,
    tracker: Arc<BudgetTracker>,
    breakers: Arc<CircuitBreaker>,
    metrics: Arc<FallbackMetrics>,
    recorder: Arc<TraceRecorder>,
    exporter: Option<MetricsExporter>,
}

/// Builder for [`LaneCoordinator`]. Components not supplied are built from
/// the settings.
#[derive(Default)]
pub struct LaneCoordinatorBuilder {
    settings: Option<Settings>,
    tracker: Option<Arc<BudgetTracker>>,
    breakers: Option<Arc<CircuitBreaker>>,
    metrics: Option<Arc<FallbackMetrics>>,
    recorder: Option<Arc<TraceRecorder>>,
    exporter: Option<MetricsExporter>,
}

impl LaneCoordinatorBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn tracker(mut self, tracker: Arc<BudgetTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn breakers(mut self, breakers: Arc<CircuitBreaker>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn metrics(mut self, metrics: Arc<FallbackMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn recorder(mut self, recorder: Arc<TraceRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Export breaker gauges at request end. Also attached to a collector
    /// built here.
    pub fn exporter(mut self, exporter: MetricsExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn build(self) -> Result<LaneCoordinator, CoordinatorError> {
        let settings = self.settings.unwrap_or_default();
        let runtime = &settings.runtime;

        let tracker = match self.tracker {
            Some(tracker) => tracker,
            None => Arc::new(
                BudgetTracker::new(Arc::new(settings.registry()?))
                    .with_strict_override(runtime.strict_budgets),
            ),
        };

        let breakers = self
            .breakers
            .unwrap_or_else(|| Arc::new(CircuitBreaker::new(runtime.circuit_breaker.clone())));

        let metrics = self.metrics.unwrap_or_else(|| {
            let metrics = FallbackMetrics::new(runtime.fallback.clone());
            Arc::new(match &self.exporter {
                Some(exporter) => metrics.with_exporter(exporter.clone()),
                None => metrics,
            })
        });

        let recorder = self.recorder.unwrap_or_else(|| {
            let probe = BreakerEnvironment::new(Arc::clone(&breakers), settings.budgets.version.clone());
            Arc::new(TraceRecorder::new(Arc::new(probe)).with_max_completed(runtime.max_completed_traces))
        });

        Ok(LaneCoordinator {
            settings,
            tracker,
            breakers,
            metrics,
            recorder,
            exporter: self.exporter,
        })
    }
}

impl LaneCoordinator {
    pub fn builder() -> LaneCoordinatorBuilder {
        LaneCoordinatorBuilder::default()
    }

    /// Coordinator with every component built from `settings`.
    pub fn from_settings(settings: Settings) -> Result<Self, CoordinatorError> {
        Self::builder().settings(settings).build()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tracker(&self) -> &Arc<BudgetTracker> {
        &self.tracker
    }

    pub fn breakers(&self) -> &Arc<CircuitBreaker> {
        &self.breakers
    }

    pub fn metrics(&self) -> &Arc<FallbackMetrics> {
        &self.metrics
    }

    pub fn recorder(&self) -> &Arc<TraceRecorder> {
        &self.recorder
    }

    /// Open the budget ledger and trace for a request.
    pub fn begin(
        &self,
        request_id: &str,
        tier: ComplexityTier,
        scenario: &str,
    ) -> Result<RequestContext, CoordinatorError> {
        let ledger = self.tracker.begin(request_id, tier)?;
        let trace = self.recorder.start_global(request_id, scenario);

        tracing::debug!(
            request_id,
            tier = %tier,
            trace_id = %trace.trace_id(),
            "Request started"
        );

        Ok(RequestContext {
            request_id: request_id.to_string(),
            ledger,
            trace,
            started: Instant::now(),
        })
    }

    pub fn effective_timeout(&self, ctx: &RequestContext, lane: LaneKind) -> EffectiveTimeout {
        ctx.ledger.effective_timeout(lane)
    }

    /// Record time to first byte, measured from `begin`.
    pub fn record_first_byte(&self, ctx: &RequestContext) -> bool {
        ctx.ledger.record_first_byte(ctx.elapsed())
    }

    /// Run one lane against its provider candidates.
    ///
    /// Keyed candidates are tried before keyless ones. Every call is bounded
    /// by what is left of the lane's effective timeout; a backoff delay is
    /// only waited when it fits in that time. Dropping the future part-way
    /// settles the lane as a timeout with the time used so far.
    pub async fn run_lane<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        lane: LaneKind,
        candidates: Vec<ProviderCandidate>,
        call: F,
    ) -> LaneOutcome<T>
    where
        F: FnMut(ProviderCandidate, Duration) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let effective = ctx.ledger.effective_timeout(lane);

        if !effective.within_budget {
            let reason = "no budget left for lane";
            tracing::warn!(
                request_id = %ctx.request_id,
                lane = %lane,
                remaining = ?effective.remaining,
                "Skipping lane"
            );
            match ctx.trace.plan_lane(lane, &effective) {
                Ok(id) => self.finalize_trace(ctx, id, LaneCompletion::failed(LaneStatus::Skipped, reason)),
                Err(e) => tracing::warn!(error = %e, "Lane not traced"),
            }
            ctx.trace.flag_degradation(format!("{}_budget_exhausted", lane));
            return LaneOutcome::Degraded {
                status: LaneStatus::Skipped,
                reason: reason.to_string(),
            };
        }

        let id = match ctx.trace.start_lane(lane, &effective) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(trace_id = %ctx.trace_id(), lane = %lane, error = %e, "Lane not traced");
                None
            }
        };

        let ordered = self.order_candidates(lane, candidates);
        let mut guard = LaneGuard {
            coordinator: self,
            ctx,
            lane,
            id,
            started: Instant::now(),
            in_flight: None,
            settled: false,
        };
        let deadline = guard.started + effective.timeout;

        let result = self.walk_providers(&mut guard, &ordered, deadline, call).await;

        let consumed = guard.settle();
        self.record_usage(ctx, lane, consumed);

        match result {
            Ok((value, candidate)) => {
                if let Some(id) = id {
                    let completion = LaneCompletion::completed(&candidate.provider, candidate.source)
                        .with_consumed(consumed);
                    self.finalize_trace(ctx, id, completion);
                }
                LaneOutcome::Completed {
                    value,
                    provider: candidate.provider,
                    source: candidate.source,
                }
            }
            Err(exhausted) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    lane = %lane,
                    status = %exhausted.status,
                    reason = %exhausted.reason,
                    "Lane degraded"
                );
                if let Some(id) = id {
                    let mut completion =
                        LaneCompletion::failed(exhausted.status, exhausted.reason.clone())
                            .with_consumed(consumed);
                    if let Some(last) = exhausted.last {
                        completion = completion.with_provider(last.provider, last.source);
                    }
                    self.finalize_trace(ctx, id, completion);
                }
                LaneOutcome::Degraded {
                    status: exhausted.status,
                    reason: exhausted.reason,
                }
            }
        }
    }

    async fn walk_providers<T, F, Fut>(
        &self,
        guard: &mut LaneGuard<'_>,
        candidates: &[ProviderCandidate],
        deadline: Instant,
        mut call: F,
    ) -> Result<(T, ProviderCandidate), Exhausted>
    where
        F: FnMut(ProviderCandidate, Duration) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let (ctx, lane, id) = (guard.ctx, guard.lane, guard.id);
        let retry = &self.settings.runtime.retry;
        let per_provider = retry.attempts_per_provider.max(1);
        let mut backoff = retry.backoff(candidates.len() * per_provider as usize);

        let mut exhausted = Exhausted {
            status: LaneStatus::Failed,
            reason: "no provider candidates".to_string(),
            last: None,
        };
        let mut previous_error: Option<String> = None;

        for (index, candidate) in candidates.iter().enumerate() {
            for _ in 0..per_provider {
                if Instant::now() >= deadline {
                    exhausted.status = LaneStatus::Timeout;
                    exhausted.reason = "lane deadline reached".to_string();
                    return Err(exhausted);
                }

                let admission = self.breakers.admit(lane, &candidate.provider);
                if let (Some(id), Some(transition)) = (id, admission.transition) {
                    self.trace_breaker(ctx, id, transition);
                }
                if !admission.allowed {
                    let error = ProviderError::CircuitOpen {
                        lane,
                        provider: candidate.provider.clone(),
                    };
                    tracing::debug!(lane = %lane, provider = %candidate.provider, "Circuit open, skipping provider");
                    // Only a lane where every candidate was rejected ends
                    // circuit_open; otherwise the last real error stands.
                    if exhausted.last.is_none() {
                        exhausted.status = LaneStatus::CircuitOpen;
                        exhausted.reason = error.to_string();
                    }
                    break;
                }

                if let Some(error) = previous_error.take() {
                    let wait = backoff.next().unwrap_or_default();
                    let left = deadline.saturating_duration_since(Instant::now());
                    let delay = if wait < left { wait } else { Duration::ZERO };
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if let Some(id) = id {
                        if let Err(e) = ctx.trace.record_retry(id, &candidate.provider, candidate.source, error, delay) {
                            tracing::warn!(trace_id = %ctx.trace_id(), error = %e, "Retry not traced");
                        }
                    }
                }

                let left = deadline.saturating_duration_since(Instant::now());
                let call_started = Instant::now();
                let fallback_used = candidate.is_keyless() || index > 0;
                guard.in_flight = Some(InFlight {
                    candidate: candidate.clone(),
                    started: call_started,
                    fallback_used,
                });
                let result = match tokio::time::timeout(left, call(candidate.clone(), left)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(left)),
                };
                guard.in_flight = None;
                let latency = call_started.elapsed();

                let event = FallbackEvent::new(lane, &candidate.provider, candidate.source)
                    .with_latency(latency)
                    .with_fallback_used(fallback_used)
                    .with_trace_id(ctx.trace_id());

                match result {
                    Ok(value) => {
                        if let Some(transition) = self.breakers.on_success(lane, &candidate.provider) {
                            if let Some(id) = id {
                                self.trace_breaker(ctx, id, transition);
                            }
                        }
                        self.metrics.record(event);
                        return Ok((value, candidate.clone()));
                    }
                    Err(error) => {
                        tracing::debug!(
                            lane = %lane,
                            provider = %candidate.provider,
                            error = %error,
                            "Provider call failed"
                        );
                        exhausted.last = Some(candidate.clone());
                        exhausted.status = if error.is_timeout() {
                            LaneStatus::Timeout
                        } else {
                            LaneStatus::Failed
                        };
                        exhausted.reason = error.to_string();

                        if !error.counts_as_failure() {
                            previous_error = Some(error.to_string());
                            break;
                        }

                        if let Some(transition) = self.breakers.on_failure(lane, &candidate.provider) {
                            if let Some(id) = id {
                                self.trace_breaker(ctx, id, transition);
                            }
                        }
                        self.metrics.record(if error.is_timeout() {
                            event.with_timeout()
                        } else {
                            event.with_error(error.to_string())
                        });
                        previous_error = Some(error.to_string());
                    }
                }
            }
        }

        Err(exhausted)
    }

    /// Record a lane the orchestrator ran itself.
    ///
    /// The report must carry a terminal status; a pending or running lane
    /// is rejected and nothing is recorded.
    pub fn report_lane_result(
        &self,
        ctx: &RequestContext,
        report: LaneReport,
    ) -> Result<UsageCheck, CoordinatorError> {
        let lane = report.lane;
        if !report.status.is_terminal() {
            return Err(CoordinatorError::NonTerminalStatus {
                lane,
                status: report.status,
            });
        }
        let granted = report
            .granted
            .unwrap_or_else(|| ctx.ledger.effective_timeout(lane));

        let id = match ctx.trace.start_lane(lane, &granted) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(trace_id = %ctx.trace_id(), lane = %lane, error = %e, "Lane not traced");
                None
            }
        };

        if let Some(candidate) = &report.provider {
            let transition = match report.status {
                LaneStatus::Completed => self.breakers.on_success(lane, &candidate.provider),
                LaneStatus::Timeout | LaneStatus::Failed => {
                    self.breakers.on_failure(lane, &candidate.provider)
                }
                _ => None,
            };
            if let (Some(id), Some(transition)) = (id, transition) {
                self.trace_breaker(ctx, id, transition);
            }

            let mut event = FallbackEvent::new(lane, &candidate.provider, candidate.source)
                .with_latency(report.consumed)
                .with_fallback_used(report.fallback_used)
                .with_trace_id(ctx.trace_id());
            match report.status {
                LaneStatus::Timeout => event = event.with_timeout(),
                LaneStatus::Failed => {
                    event = event.with_error(report.error.clone().unwrap_or_else(|| "failed".to_string()))
                }
                _ => {}
            }
            if matches!(
                report.status,
                LaneStatus::Completed | LaneStatus::Timeout | LaneStatus::Failed
            ) {
                self.metrics.record(event);
            }
        }

        let check = self.record_usage(ctx, lane, report.consumed);

        if let Some(id) = id {
            let mut completion = LaneCompletion {
                status: report.status,
                provider: None,
                source: None,
                error: report.error,
                consumed: Some(report.consumed),
            };
            if let Some(candidate) = report.provider {
                completion = completion.with_provider(candidate.provider, candidate.source);
            }
            self.finalize_trace(ctx, id, completion);
        }

        Ok(check)
    }

    /// Close the request: budget summary plus the finalized trace.
    pub fn end(&self, ctx: RequestContext) -> Result<RequestSummary, CoordinatorError> {
        let budget = self.tracker.end(&ctx.request_id)?;
        let overall_success = budget.hard_failure.then_some(false);
        let trace = self.recorder.finish_global(&ctx.trace, overall_success)?;

        if let Some(exporter) = &self.exporter {
            self.export_gauges(exporter, &trace.trace_id);
        }

        tracing::info!(
            request_id = %ctx.request_id,
            trace_id = %trace.trace_id,
            utilization = budget.utilization,
            sla_passed = budget.sla_passed,
            degraded = trace.is_degraded(),
            "Request finished"
        );

        Ok(RequestSummary { budget, trace })
    }

    /// Breaker state and provider health gauges, one set per (lane, provider).
    fn export_gauges(&self, exporter: &MetricsExporter, trace_id: &str) {
        let trace_id = Some(trace_id.to_string());

        for breaker in self.breakers.snapshot() {
            let labels = MetricLabels::new(breaker.lane, breaker.provider, None, breaker.state.as_str());
            exporter.emit(
                MetricRecord::gauge("circuit_breaker_state", breaker.state.gauge_value(), labels)
                    .with_trace_id(trace_id.clone()),
            );
        }

        for health in self.metrics.health_summary().providers {
            let labels = MetricLabels::new(health.lane, health.provider, None, health.status.as_str());
            let eligible = if health.auto_demotion_eligible { 1.0 } else { 0.0 };
            for (name, value) in [
                ("provider_health_status", health.status.gauge_value()),
                ("provider_failure_rate", health.failure_rate),
                ("provider_auto_demotion_eligible", eligible),
            ] {
                exporter.emit(
                    MetricRecord::gauge(name, value, labels.clone()).with_trace_id(trace_id.clone()),
                );
            }
        }
    }

    /// Keyed before keyless; with `prefer_healthy`, demotion-eligible
    /// providers go last. Stable otherwise.
    fn order_candidates(
        &self,
        lane: LaneKind,
        mut candidates: Vec<ProviderCandidate>,
    ) -> Vec<ProviderCandidate> {
        if self.settings.runtime.prefer_healthy {
            candidates.sort_by_cached_key(|c| {
                (
                    self.metrics.is_demotion_eligible(lane, &c.provider),
                    c.is_keyless(),
                )
            });
        } else {
            candidates.sort_by_key(ProviderCandidate::is_keyless);
        }
        candidates
    }

    fn record_usage(&self, ctx: &RequestContext, lane: LaneKind, consumed: Duration) -> UsageCheck {
        let check = match ctx.ledger.record_usage(lane, consumed) {
            Ok(check) => check,
            Err(e) => {
                tracing::warn!(lane = %lane, error = %e, "Strict budget exceeded");
                ctx.trace.flag_degradation("budget_exceeded");
                let profile = ctx.ledger.profile();
                UsageCheck {
                    lane_over_allocation: ctx.ledger.lane_consumed(lane)
                        > profile.allocation(lane).unwrap_or_default(),
                    global_over_limit: ctx.ledger.consumed() > profile.global_response_limit,
                }
            }
        };

        if check.lane_over_allocation {
            ctx.trace.flag_degradation(format!("{}_over_budget", lane));
        }
        if check.global_over_limit {
            ctx.trace.flag_degradation("budget_exhausted");
        }
        check
    }

    fn trace_breaker(&self, ctx: &RequestContext, id: LaneId, transition: BreakerTransition) {
        if let Err(e) = ctx.trace.record_breaker_event(id, transition) {
            tracing::warn!(trace_id = %ctx.trace_id(), error = %e, "Breaker event not traced");
        }
    }

    fn finalize_trace(&self, ctx: &RequestContext, id: LaneId, completion: LaneCompletion) {
        if let Err(e) = ctx.trace.complete_lane(id, completion) {
            tracing::warn!(trace_id = %ctx.trace_id(), error = %e, "Lane completion not traced");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.runtime.retry.min_delay = Duration::from_millis(100);
        settings
    }

    fn coordinator(settings: Settings) -> LaneCoordinator {
        LaneCoordinator::from_settings(settings).unwrap()
    }

    fn web_candidates() -> Vec<ProviderCandidate> {
        vec![
            ProviderCandidate::keyless("duckduckgo"),
            ProviderCandidate::keyed("brave"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_candidate_served_first() {
        let coordinator = coordinator(settings());
        let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();

        let outcome = coordinator
            .run_lane(&ctx, LaneKind::Web, web_candidates(), |candidate, _| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, ProviderError>(format!("results from {}", candidate.provider))
            })
            .await;

        assert_eq!(
            outcome,
            LaneOutcome::Completed {
                value: "results from brave".to_string(),
                provider: "brave".to_string(),
                source: ProviderSource::Keyed,
            }
        );
        assert_eq!(ctx.ledger().lane_consumed(LaneKind::Web), Duration::from_millis(300));

        let summary = coordinator.end(ctx).unwrap();
        assert!(!summary.is_degraded());
        assert!(summary.trace.overall_success);
        assert_eq!(summary.trace.lanes[0].status, LaneStatus::Completed);
        assert_eq!(coordinator.metrics().totals().fallback_used, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_falls_back_to_keyless_with_backoff() {
        let coordinator = coordinator(settings());
        let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();

        let outcome = coordinator
            .run_lane(&ctx, LaneKind::Web, web_candidates(), |candidate, _| async move {
                if candidate.provider == "brave" {
                    Err(ProviderError::ApiError {
                        status: 503,
                        message: "unavailable".to_string(),
                    })
                } else {
                    Ok("keyless results")
                }
            })
            .await;

        assert!(outcome.is_completed());
        assert_eq!(outcome.value(), Some(&"keyless results"));

        let trace = ctx.trace().snapshot();
        let retries = &trace.lanes[0].retry_attempts;
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].attempt, 1);
        assert_eq!(retries[0].provider, "duckduckgo");
        assert_eq!(retries[0].delay, Duration::from_millis(100));
        assert!(retries[0].error.contains("503"));

        let stats = coordinator.metrics().stats(Some(LaneKind::Web), None);
        assert_eq!(stats.total, 2);
        let totals = coordinator.metrics().totals();
        assert_eq!(totals.fallback_used, 1);
        assert_eq!(totals.errors, 1);
        coordinator.end(ctx).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_bounded_by_effective_timeout() {
        let coordinator = coordinator(settings());
        let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();

        let outcome = coordinator
            .run_lane(
                &ctx,
                LaneKind::Web,
                vec![ProviderCandidate::keyed("brave")],
                |_, _| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, ProviderError>(())
                },
            )
            .await;

        assert!(matches!(
            outcome,
            LaneOutcome::Degraded {
                status: LaneStatus::Timeout,
                ..
            }
        ));
        let consumed = ctx.ledger().lane_consumed(LaneKind::Web);
        assert!(consumed >= Duration::from_secs(2));
        assert!(consumed < Duration::from_millis(2100));

        let summary = coordinator.end(ctx).unwrap();
        assert!(summary.trace.degradation_flags.contains(&"web_timeout".to_string()));
        assert!(!summary.trace.overall_success);
        assert_eq!(coordinator.metrics().totals().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_provider() {
        let mut settings = settings();
        settings.runtime.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(3600),
        };
        let coordinator = coordinator(settings);
        let brave_calls = Arc::new(AtomicUsize::new(0));

        for request in ["req-1", "req-2"] {
            let ctx = coordinator.begin(request, ComplexityTier::Simple, "search").unwrap();
            let calls = Arc::clone(&brave_calls);
            let outcome = coordinator
                .run_lane(&ctx, LaneKind::Web, web_candidates(), move |candidate, _| {
                    let calls = Arc::clone(&calls);
                    async move {
                        if candidate.provider == "brave" {
                            calls.fetch_add(1, Ordering::SeqCst);
                            return Err(ProviderError::HttpError("connection reset".to_string()));
                        }
                        Ok(candidate.provider)
                    }
                })
                .await;
            assert_eq!(outcome.into_value().as_deref(), Some("duckduckgo"));

            if request == "req-1" {
                let trace = ctx.trace().snapshot();
                let events = &trace.lanes[0].breaker_events;
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].to, CircuitState::Open);
            }
            coordinator.end(ctx).unwrap();
        }

        assert_eq!(brave_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator.breakers().state(LaneKind::Web, "brave").state,
            CircuitState::Open
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_circuits_open_degrades_lane() {
        let mut settings = settings();
        settings.runtime.circuit_breaker.failure_threshold = 1;
        let coordinator = coordinator(settings);
        coordinator.breakers().on_failure(LaneKind::Vector, "qdrant");

        let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();
        let outcome = coordinator
            .run_lane(
                &ctx,
                LaneKind::Vector,
                vec![ProviderCandidate::keyed("qdrant")],
                |_, _| async { Ok::<_, ProviderError>(()) },
            )
            .await;

        assert!(matches!(
            outcome,
            LaneOutcome::Degraded {
                status: LaneStatus::CircuitOpen,
                ..
            }
        ));
        let summary = coordinator.end(ctx).unwrap();
        assert!(summary
            .trace
            .degradation_flags
            .contains(&"vector_circuit_open".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_skips_lane() {
        let coordinator = coordinator(settings());
        let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();

        let check = coordinator.report_lane_result(
            &ctx,
            LaneReport::completed(LaneKind::Llm, ProviderCandidate::keyed("openai"), Duration::from_secs(5)),
        )
        .unwrap();
        assert!(check.lane_over_allocation);
        assert!(!check.global_over_limit);

        let called = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&called);
        let outcome = coordinator
            .run_lane(&ctx, LaneKind::Web, web_candidates(), move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ProviderError>(()) }
            })
            .await;

        assert!(matches!(
            outcome,
            LaneOutcome::Degraded {
                status: LaneStatus::Skipped,
                ..
            }
        ));
        assert_eq!(called.load(Ordering::SeqCst), 0);

        let summary = coordinator.end(ctx).unwrap();
        let flags = &summary.trace.degradation_flags;
        assert!(flags.contains(&"web_budget_exhausted".to_string()));
        assert!(flags.contains(&"llm_over_budget".to_string()));
        assert_eq!(summary.trace.lanes[1].status, LaneStatus::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_overrun_is_hard_failure() {
        let mut settings = settings();
        settings.runtime.strict_budgets = true;
        let coordinator = coordinator(settings);
        let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();

        let check = coordinator.report_lane_result(
            &ctx,
            LaneReport::completed(LaneKind::Web, ProviderCandidate::keyed("brave"), Duration::from_secs(3)),
        )
        .unwrap();
        assert!(check.lane_over_allocation);

        let summary = coordinator.end(ctx).unwrap();
        assert!(summary.budget.hard_failure);
        assert!(!summary.budget.sla_passed);
        assert!(!summary.trace.overall_success);
        let flags = &summary.trace.degradation_flags;
        assert!(flags.contains(&"budget_exceeded".to_string()));
        assert!(flags.contains(&"web_over_budget".to_string()));
        assert!(!flags.contains(&"budget_exhausted".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_terminal_report_rejected() {
        let coordinator = coordinator(settings());
        let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();

        let result = coordinator.report_lane_result(
            &ctx,
            LaneReport::failed(LaneKind::Llm, LaneStatus::Running, "still streaming", Duration::from_secs(1)),
        );
        assert!(matches!(
            result,
            Err(CoordinatorError::NonTerminalStatus {
                lane: LaneKind::Llm,
                status: LaneStatus::Running,
            })
        ));

        assert_eq!(ctx.ledger().consumed(), Duration::ZERO);
        assert!(ctx.trace().snapshot().lanes.is_empty());
        assert_eq!(coordinator.metrics().totals().attempts, 0);
        coordinator.end(ctx).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_lane_is_still_accounted() {
        let mut settings = settings();
        settings.runtime.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::ZERO,
        };
        let coordinator = coordinator(settings);
        // Open, and due for a recovery probe on the next call.
        coordinator.breakers().on_failure(LaneKind::Web, "brave");

        let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();
        let lane = coordinator.run_lane(
            &ctx,
            LaneKind::Web,
            vec![ProviderCandidate::keyed("brave")],
            |_, _| async {
                tokio::time::sleep(Duration::from_millis(1800)).await;
                Ok::<_, ProviderError>(())
            },
        );
        // The orchestrator gives up on the lane before the provider answers.
        assert!(tokio::time::timeout(Duration::from_secs(1), lane).await.is_err());

        assert_eq!(ctx.ledger().lane_consumed(LaneKind::Web), Duration::from_secs(1));

        let breaker = coordinator.breakers().state(LaneKind::Web, "brave");
        assert_eq!(breaker.state, CircuitState::Open);
        assert_eq!(breaker.failure_count, 2);

        let totals = coordinator.metrics().totals();
        assert_eq!(totals.attempts, 1);
        assert_eq!(totals.timeouts, 1);

        let summary = coordinator.end(ctx).unwrap();
        assert_eq!(summary.budget.consumed, Duration::from_secs(1));
        let web = &summary.trace.lanes[0];
        assert_eq!(web.status, LaneStatus::Timeout);
        assert_eq!(web.budget.consumed, Some(Duration::from_secs(1)));
        assert_eq!(web.provider.as_deref(), Some("brave"));
        let transitions: Vec<_> = web.breaker_events.iter().map(|e| e.to).collect();
        assert_eq!(transitions, vec![CircuitState::HalfOpen, CircuitState::Open]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_fallback_keeps_provider_error() {
        let mut settings = settings();
        settings.runtime.circuit_breaker.failure_threshold = 1;
        let coordinator = coordinator(settings);
        coordinator.breakers().on_failure(LaneKind::Web, "duckduckgo");

        let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();
        let outcome = coordinator
            .run_lane(&ctx, LaneKind::Web, web_candidates(), |candidate, _| async move {
                match candidate.source {
                    ProviderSource::Keyed => Err(ProviderError::ApiError {
                        status: 503,
                        message: "unavailable".to_string(),
                    }),
                    ProviderSource::Keyless => Ok(()),
                }
            })
            .await;

        match outcome {
            LaneOutcome::Degraded { status, reason } => {
                assert_eq!(status, LaneStatus::Failed);
                assert!(reason.contains("503"), "reason was {reason}");
            }
            other => panic!("expected degraded lane, got {other:?}"),
        }
        coordinator.end(ctx).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_skipped_when_it_does_not_fit() {
        let mut settings = settings();
        settings.runtime.retry.min_delay = Duration::from_secs(5);
        settings.runtime.retry.max_delay = Duration::from_secs(10);
        let coordinator = coordinator(settings);
        let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();

        let outcome = coordinator
            .run_lane(&ctx, LaneKind::Web, web_candidates(), |candidate, _| async move {
                match candidate.source {
                    ProviderSource::Keyed => Err(ProviderError::AuthError),
                    ProviderSource::Keyless => Ok(()),
                }
            })
            .await;

        assert!(outcome.is_completed());
        let trace = ctx.trace().snapshot();
        assert_eq!(trace.lanes[0].retry_attempts[0].delay, Duration::ZERO);
        assert!(ctx.elapsed() < Duration::from_secs(1));
        coordinator.end(ctx).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefer_healthy_moves_eligible_providers_last() {
        let metrics = Arc::new(FallbackMetrics::default());
        for _ in 0..5 {
            metrics.record(FallbackEvent::new(LaneKind::Web, "brave", ProviderSource::Keyed).with_timeout());
        }

        let mut settings = settings();
        settings.runtime.prefer_healthy = true;
        let coordinator = LaneCoordinator::builder()
            .settings(settings)
            .metrics(metrics)
            .build()
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();
        coordinator
            .run_lane(
                &ctx,
                LaneKind::Web,
                vec![ProviderCandidate::keyed("brave"), ProviderCandidate::keyed("tavily")],
                move |candidate, _| {
                    seen.lock().push(candidate.provider.clone());
                    async { Err::<(), _>(ProviderError::HttpError("down".to_string())) }
                },
            )
            .await;

        assert_eq!(*order.lock(), vec!["tavily".to_string(), "brave".to_string()]);
        coordinator.end(ctx).unwrap();
    }

    #[tokio::test]
    async fn test_begin_twice_fails() {
        let coordinator = coordinator(settings());
        let _ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();
        assert!(matches!(
            coordinator.begin("req-1", ComplexityTier::Simple, "search"),
            Err(CoordinatorError::Budget(BudgetError::AlreadyActive(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_byte_recorded_from_begin() {
        let coordinator = coordinator(settings());
        let ctx = coordinator.begin("req-1", ComplexityTier::Simple, "search").unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(coordinator.record_first_byte(&ctx));
        assert!(!coordinator.record_first_byte(&ctx));

        let summary = coordinator.end(ctx).unwrap();
        assert_eq!(summary.budget.ttfb, Some(Duration::from_millis(800)));
        assert!(summary.budget.ttfb_within);
    }
}
