//! Fallback metrics: every lane/provider attempt, live provider health,
//! and auto-demotion eligibility.
//!
//! This module only computes the demotion flag. Rerouting away from a
//! demoted provider is the coordinator's job.

use chrono::{DateTime, Utc};
use lanekeeper_core::config::duration;
use lanekeeper_core::{LaneKind, ProviderSource};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::metrics::{percentile, MetricLabels, MetricRecord, MetricsExporter};

/// Latency is exchanged as fractional milliseconds.
mod latency_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(super::millis(*latency))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(ms / 1000.0).map_err(serde::de::Error::custom)
    }
}

fn millis(d: Duration) -> f64 {
    d.as_micros() as f64 / 1000.0
}

/// One attempt against one provider. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEvent {
    pub timestamp: DateTime<Utc>,
    pub lane: LaneKind,
    pub provider: String,
    pub source: ProviderSource,
    pub fallback_used: bool,
    pub timeout: bool,
    pub error: Option<String>,
    #[serde(rename = "latency_ms", with = "latency_ms")]
    pub latency: Duration,
    pub trace_id: Option<String>,
}

impl FallbackEvent {
    /// A successful attempt stamped now.
    pub fn new(lane: LaneKind, provider: impl Into<String>, source: ProviderSource) -> Self {
        Self {
            timestamp: Utc::now(),
            lane,
            provider: provider.into(),
            source,
            fallback_used: false,
            timeout: false,
            error: None,
            latency: Duration::ZERO,
            trace_id: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_fallback_used(mut self, used: bool) -> Self {
        self.fallback_used = used;
        self
    }

    pub fn with_timeout(mut self) -> Self {
        self.timeout = true;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Timeouts take precedence: a timed-out call that also carries an
    /// error message counts as a timeout only.
    pub fn is_timeout(&self) -> bool {
        self.timeout
    }

    pub fn is_error(&self) -> bool {
        !self.timeout && self.error.is_some()
    }

    pub fn is_success(&self) -> bool {
        !self.timeout && self.error.is_none()
    }

    fn status(&self) -> &'static str {
        if self.is_timeout() {
            "timeout"
        } else if self.is_error() {
            "error"
        } else {
            "success"
        }
    }
}

/// Collector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Failure rate at or above which a provider is demotion-eligible
    pub auto_demotion_threshold: f64,

    /// Events older than this are pruned from the log
    #[serde(with = "duration")]
    pub retention: Duration,

    /// Window for health aggregates; `None` uses the whole retained log
    #[serde(with = "duration::option")]
    pub health_window: Option<Duration>,

    /// Fraction of the demotion threshold that marks a provider degraded
    pub degraded_ratio: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            auto_demotion_threshold: 0.30,
            retention: Duration::from_secs(24 * 60 * 60),
            health_window: None,
            degraded_ratio: 0.5,
        }
    }
}

/// Attempts split by provider source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Aggregate over a set of events. All zero when there are none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackStats {
    pub total: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub fallback_used: u64,
    pub success_rate: f64,
    pub timeout_rate: f64,
    pub error_rate: f64,
    pub failure_rate: f64,
    pub fallback_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub keyed: SourceStats,
    pub keyless: SourceStats,
}

impl FallbackStats {
    fn from_events<'a>(events: impl IntoIterator<Item = &'a FallbackEvent>) -> Self {
        let mut stats = Self::default();
        let mut latencies = Vec::new();

        for event in events {
            stats.total += 1;
            if event.is_timeout() {
                stats.timeouts += 1;
            } else if event.is_error() {
                stats.errors += 1;
            } else {
                stats.successes += 1;
            }
            if event.fallback_used {
                stats.fallback_used += 1;
            }

            let split = match event.source {
                ProviderSource::Keyed => &mut stats.keyed,
                ProviderSource::Keyless => &mut stats.keyless,
            };
            split.total += 1;
            if event.is_success() {
                split.successes += 1;
            } else {
                split.failures += 1;
            }

            latencies.push(millis(event.latency));
        }

        if stats.total == 0 {
            return stats;
        }

        let total = stats.total as f64;
        stats.success_rate = stats.successes as f64 / total;
        stats.timeout_rate = stats.timeouts as f64 / total;
        stats.error_rate = stats.errors as f64 / total;
        // One division, so the threshold comparison sees exact ratios.
        stats.failure_rate = (stats.timeouts + stats.errors) as f64 / total;
        stats.fallback_rate = stats.fallback_used as f64 / total;
        stats.avg_latency_ms = latencies.iter().sum::<f64>() / total;
        latencies.sort_by(f64::total_cmp);
        stats.p95_latency_ms = percentile(&latencies, 95.0);

        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Gauge encoding: 0 healthy, 1 degraded, 2 unhealthy.
    pub fn gauge_value(self) -> f64 {
        match self {
            Self::Healthy => 0.0,
            Self::Degraded => 1.0,
            Self::Unhealthy => 2.0,
        }
    }
}

/// Windowed health of one (lane, provider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub lane: LaneKind,
    pub provider: String,
    pub total: u64,
    pub success_rate: f64,
    pub timeout_rate: f64,
    pub error_rate: f64,
    pub failure_rate: f64,
    pub avg_latency_ms: f64,
    pub auto_demotion_eligible: bool,
    pub status: HealthStatus,
}

/// Health of every provider seen in the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub generated_at: DateTime<Utc>,
    #[serde(with = "duration::option")]
    pub window: Option<Duration>,
    pub auto_demotion_threshold: f64,
    pub providers: Vec<ProviderHealth>,
}

impl HealthSummary {
    pub fn unhealthy(&self) -> impl Iterator<Item = &ProviderHealth> {
        self.providers
            .iter()
            .filter(|p| p.status == HealthStatus::Unhealthy)
    }

    pub fn degraded(&self) -> impl Iterator<Item = &ProviderHealth> {
        self.providers
            .iter()
            .filter(|p| p.status == HealthStatus::Degraded)
    }
}

/// All-time counters, unaffected by pruning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativeCounts {
    pub attempts: u64,
    pub fallback_used: u64,
    pub timeouts: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Inner {
    events: VecDeque<FallbackEvent>,
    totals: CumulativeCounts,
}

/// Process-wide collector shared by every request.
pub struct FallbackMetrics {
    config: FallbackConfig,
    inner: RwLock<Inner>,
    exporter: Option<MetricsExporter>,
}

fn cutoff(age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
}

impl FallbackMetrics {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
            exporter: None,
        }
    }

    /// Rebuild a collector from an exported event log.
    pub fn from_events(
        config: FallbackConfig,
        events: impl IntoIterator<Item = FallbackEvent>,
    ) -> Self {
        let metrics = Self::new(config);
        {
            let mut inner = metrics.inner.write();
            for event in events {
                Self::count(&mut inner.totals, &event);
                inner.events.push_back(event);
            }
        }
        metrics
    }

    /// Emit counters and latency samples through `exporter` on every record.
    pub fn with_exporter(mut self, exporter: MetricsExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    fn count(totals: &mut CumulativeCounts, event: &FallbackEvent) {
        totals.attempts += 1;
        if event.fallback_used {
            totals.fallback_used += 1;
        }
        if event.is_timeout() {
            totals.timeouts += 1;
        } else if event.is_error() {
            totals.errors += 1;
        }
    }

    /// Append an event. Never blocks on export.
    pub fn record(&self, event: FallbackEvent) {
        if let Some(exporter) = &self.exporter {
            self.export(exporter, &event);
        }

        let horizon = cutoff(self.config.retention);
        let mut inner = self.inner.write();
        Self::count(&mut inner.totals, &event);
        inner.events.push_back(event);

        if let Some(horizon) = horizon {
            while inner
                .events
                .front()
                .is_some_and(|oldest| oldest.timestamp < horizon)
            {
                inner.events.pop_front();
            }
        }
    }

    fn export(&self, exporter: &MetricsExporter, event: &FallbackEvent) {
        let labels = MetricLabels::new(
            event.lane,
            event.provider.clone(),
            Some(event.source),
            event.status(),
        );
        let trace_id = event.trace_id.clone();

        exporter.emit(
            MetricRecord::counter("lane_attempts_total", labels.clone())
                .with_trace_id(trace_id.clone()),
        );
        if event.fallback_used {
            exporter.emit(
                MetricRecord::counter("fallback_used_total", labels.clone())
                    .with_trace_id(trace_id.clone()),
            );
        }
        if event.is_timeout() {
            exporter.emit(
                MetricRecord::counter("provider_timeouts_total", labels.clone())
                    .with_trace_id(trace_id.clone()),
            );
        } else if event.is_error() {
            exporter.emit(
                MetricRecord::counter("provider_failures_total", labels.clone())
                    .with_trace_id(trace_id.clone()),
            );
        }
        exporter.emit(
            MetricRecord::histogram(
                "provider_latency_ms",
                millis(event.latency),
                labels,
            )
            .with_trace_id(trace_id),
        );
    }

    /// Copy of matching events, taken under the read lock.
    fn snapshot(
        &self,
        since: Option<DateTime<Utc>>,
        lane: Option<LaneKind>,
        provider: Option<&str>,
    ) -> Vec<FallbackEvent> {
        self.inner
            .read()
            .events
            .iter()
            .filter(|e| since.map_or(true, |t| e.timestamp >= t))
            .filter(|e| lane.map_or(true, |l| e.lane == l))
            .filter(|e| provider.map_or(true, |p| e.provider == p))
            .cloned()
            .collect()
    }

    /// Aggregate over the retained log, optionally filtered.
    pub fn stats(&self, lane: Option<LaneKind>, provider: Option<&str>) -> FallbackStats {
        let events = self.snapshot(None, lane, provider);
        FallbackStats::from_events(&events)
    }

    fn window_start(&self) -> Option<DateTime<Utc>> {
        self.config.health_window.and_then(cutoff)
    }

    fn health_from(
        &self,
        lane: LaneKind,
        provider: String,
        events: &[&FallbackEvent],
    ) -> ProviderHealth {
        let stats = FallbackStats::from_events(events.iter().copied());
        let threshold = self.config.auto_demotion_threshold;
        let eligible = stats.total > 0 && stats.failure_rate >= threshold;

        let status = if eligible {
            HealthStatus::Unhealthy
        } else if stats.total > 0 && stats.failure_rate >= threshold * self.config.degraded_ratio {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ProviderHealth {
            lane,
            provider,
            total: stats.total,
            success_rate: stats.success_rate,
            timeout_rate: stats.timeout_rate,
            error_rate: stats.error_rate,
            failure_rate: stats.failure_rate,
            avg_latency_ms: stats.avg_latency_ms,
            auto_demotion_eligible: eligible,
            status,
        }
    }

    /// Health of one (lane, provider) over the health window.
    pub fn provider_health(&self, lane: LaneKind, provider: &str) -> Option<ProviderHealth> {
        let events = self.snapshot(self.window_start(), Some(lane), Some(provider));
        if events.is_empty() {
            return None;
        }
        let refs: Vec<&FallbackEvent> = events.iter().collect();
        Some(self.health_from(lane, provider.to_string(), &refs))
    }

    /// Health of every provider in the window, sorted by (lane, provider).
    pub fn health_summary(&self) -> HealthSummary {
        let events = self.snapshot(self.window_start(), None, None);

        let mut grouped: BTreeMap<(LaneKind, &str), Vec<&FallbackEvent>> = BTreeMap::new();
        for event in &events {
            grouped
                .entry((event.lane, event.provider.as_str()))
                .or_default()
                .push(event);
        }

        let providers = grouped
            .into_iter()
            .map(|((lane, provider), group)| self.health_from(lane, provider.to_string(), &group))
            .collect();

        HealthSummary {
            generated_at: Utc::now(),
            window: self.config.health_window,
            auto_demotion_threshold: self.config.auto_demotion_threshold,
            providers,
        }
    }

    /// Providers whose failure rate reached the demotion threshold.
    pub fn demotion_candidates(&self) -> Vec<ProviderHealth> {
        self.health_summary()
            .providers
            .into_iter()
            .filter(|p| p.auto_demotion_eligible)
            .collect()
    }

    pub fn is_demotion_eligible(&self, lane: LaneKind, provider: &str) -> bool {
        self.provider_health(lane, provider)
            .is_some_and(|h| h.auto_demotion_eligible)
    }

    /// Snapshot of the retained log.
    pub fn events(&self) -> Vec<FallbackEvent> {
        self.inner.read().events.iter().cloned().collect()
    }

    pub fn totals(&self) -> CumulativeCounts {
        self.inner.read().totals
    }

    /// Drop events older than `max_age`; returns how many were removed.
    ///
    /// Aggregates are computed on copies, so pruning never disturbs one in
    /// progress. Cumulative counters are kept.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let Some(horizon) = cutoff(max_age) else {
            return 0;
        };

        let mut inner = self.inner.write();
        let before = inner.events.len();
        inner.events.retain(|e| e.timestamp >= horizon);
        let removed = before - inner.events.len();

        if removed > 0 {
            tracing::debug!(removed, "Pruned fallback events");
        }
        removed
    }
}

impl Default for FallbackMetrics {
    fn default() -> Self {
        Self::new(FallbackConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{spawn_exporter, ExportConfig, ExportError, MetricsSink};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn web(provider: &str) -> FallbackEvent {
        FallbackEvent::new(LaneKind::Web, provider, ProviderSource::Keyed)
            .with_latency(Duration::from_millis(100))
    }

    #[test]
    fn test_timeout_heavy_provider_is_demotion_eligible() {
        let metrics = FallbackMetrics::default();
        for i in 0..10 {
            let event = if i < 4 { web("provider_x").with_timeout() } else { web("provider_x") };
            metrics.record(event);
        }

        let health = metrics.provider_health(LaneKind::Web, "provider_x").unwrap();
        assert_eq!(health.total, 10);
        assert_eq!(health.failure_rate, 0.4);
        assert!(health.auto_demotion_eligible);
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_threshold_boundary_is_eligible() {
        let metrics = FallbackMetrics::default();
        for i in 0..10 {
            let event = match i {
                0 | 1 => web("brave").with_timeout(),
                2 => web("brave").with_error("HTTP 502"),
                _ => web("brave"),
            };
            metrics.record(event);
        }

        let stats = metrics.stats(Some(LaneKind::Web), Some("brave"));
        assert_eq!(stats.failure_rate, 0.3);
        assert!(metrics.is_demotion_eligible(LaneKind::Web, "brave"));
    }

    #[test]
    fn test_below_threshold_is_degraded_not_eligible() {
        let metrics = FallbackMetrics::default();
        for i in 0..10 {
            let event = if i < 2 { web("tavily").with_error("reset") } else { web("tavily") };
            metrics.record(event);
        }

        let health = metrics.provider_health(LaneKind::Web, "tavily").unwrap();
        assert!(!health.auto_demotion_eligible);
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_empty_stats_are_neutral() {
        let metrics = FallbackMetrics::default();
        let stats = metrics.stats(Some(LaneKind::Video), None);
        assert_eq!(stats, FallbackStats::default());
        assert!(metrics.provider_health(LaneKind::Video, "youtube_data").is_none());
        assert!(metrics.health_summary().providers.is_empty());
    }

    #[test]
    fn test_timeout_with_error_counts_once() {
        let metrics = FallbackMetrics::default();
        metrics.record(web("brave").with_timeout().with_error("deadline elapsed"));

        let stats = metrics.stats(None, None);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.failure_rate, 1.0);
    }

    #[test]
    fn test_source_split_and_fallback_rate() {
        let metrics = FallbackMetrics::default();
        metrics.record(web("brave").with_error("401"));
        metrics.record(
            FallbackEvent::new(LaneKind::Web, "duckduckgo", ProviderSource::Keyless)
                .with_fallback_used(true)
                .with_latency(Duration::from_millis(300)),
        );

        let stats = metrics.stats(Some(LaneKind::Web), None);
        assert_eq!(stats.keyed.failures, 1);
        assert_eq!(stats.keyless.successes, 1);
        assert_eq!(stats.fallback_rate, 0.5);
        assert_eq!(stats.avg_latency_ms, 200.0);
        assert_eq!(stats.p95_latency_ms, 300.0);
    }

    #[test]
    fn test_health_summary_sorted() {
        let metrics = FallbackMetrics::default();
        metrics.record(FallbackEvent::new(LaneKind::Vector, "qdrant", ProviderSource::Keyed));
        metrics.record(web("tavily"));
        metrics.record(web("brave"));

        let summary = metrics.health_summary();
        let keys: Vec<(LaneKind, &str)> = summary
            .providers
            .iter()
            .map(|p| (p.lane, p.provider.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (LaneKind::Web, "brave"),
                (LaneKind::Web, "tavily"),
                (LaneKind::Vector, "qdrant"),
            ]
        );
    }

    #[test]
    fn test_health_window_ignores_old_events() {
        let config = FallbackConfig {
            health_window: Some(Duration::from_secs(300)),
            ..Default::default()
        };
        let old = Utc::now() - chrono::Duration::minutes(30);
        let metrics = FallbackMetrics::from_events(
            config,
            (0..5).map(|_| web("brave").with_timeout().with_timestamp(old)),
        );
        metrics.record(web("brave"));

        let health = metrics.provider_health(LaneKind::Web, "brave").unwrap();
        assert_eq!(health.total, 1);
        assert!(!health.auto_demotion_eligible);
        // The unwindowed aggregate still sees everything.
        assert_eq!(metrics.stats(None, None).total, 6);
    }

    #[test]
    fn test_cleanup_prunes_by_age_and_keeps_totals() {
        let old = Utc::now() - chrono::Duration::hours(2);
        let metrics = FallbackMetrics::from_events(
            FallbackConfig::default(),
            vec![
                web("brave").with_timestamp(old),
                web("brave").with_timestamp(old).with_timeout(),
                web("brave"),
            ],
        );

        assert_eq!(metrics.cleanup(Duration::from_secs(3600)), 2);
        assert_eq!(metrics.events().len(), 1);
        assert_eq!(metrics.totals().attempts, 3);
        assert_eq!(metrics.totals().timeouts, 1);
    }

    #[test]
    fn test_event_json_uses_millis() {
        let event = web("brave").with_latency(Duration::from_millis(1250));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["latency_ms"], 1250.0);
        assert_eq!(json["source"], "keyed");

        let back: FallbackEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.latency, Duration::from_millis(1250));
    }

    #[derive(Default)]
    struct CollectingSink {
        names: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MetricsSink for CollectingSink {
        async fn export(&self, batch: Vec<MetricRecord>) -> Result<(), ExportError> {
            self.names
                .lock()
                .extend(batch.into_iter().map(|r| r.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_record_emits_counters_and_latency() {
        let sink = Arc::new(CollectingSink::default());
        let (exporter, handle) = spawn_exporter(sink.clone(), ExportConfig::default());
        let metrics = FallbackMetrics::default().with_exporter(exporter);

        metrics.record(
            FallbackEvent::new(LaneKind::Web, "searxng", ProviderSource::Keyless)
                .with_fallback_used(true)
                .with_timeout()
                .with_trace_id("t-1"),
        );
        drop(metrics);
        handle.await.unwrap();

        let names = sink.names.lock().clone();
        assert_eq!(
            names,
            vec![
                "lane_attempts_total",
                "fallback_used_total",
                "provider_timeouts_total",
                "provider_latency_ms",
            ]
        );
    }
}
