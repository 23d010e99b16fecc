//! Buffered export of counters, gauges and histograms.
//!
//! Request-path code only ever calls [`MetricsExporter::emit`], which is a
//! non-blocking `try_send` into a bounded channel. A background task drains
//! the channel in batches and hands them to a [`MetricsSink`]. When the
//! sink falls behind, records are dropped and counted rather than stalling
//! the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lanekeeper_core::config::duration;
use lanekeeper_core::{LaneKind, ProviderSource};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Errors from a metrics sink.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Metrics sink failed: {0}")]
    Sink(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// Labels carried by every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricLabels {
    pub lane: LaneKind,
    pub provider: String,
    pub source: Option<ProviderSource>,
    pub status: String,
}

impl MetricLabels {
    pub fn new(
        lane: LaneKind,
        provider: impl Into<String>,
        source: Option<ProviderSource>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            lane,
            provider: provider.into(),
            source,
            status: status.into(),
        }
    }
}

/// One observation bound for the external sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub kind: MetricKind,
    pub name: String,
    pub value: f64,
    pub labels: MetricLabels,
    pub trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MetricRecord {
    fn new(kind: MetricKind, name: &str, value: f64, labels: MetricLabels) -> Self {
        Self {
            kind,
            name: name.to_string(),
            value,
            labels,
            trace_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn counter(name: &str, labels: MetricLabels) -> Self {
        Self::new(MetricKind::Counter, name, 1.0, labels)
    }

    pub fn gauge(name: &str, value: f64, labels: MetricLabels) -> Self {
        Self::new(MetricKind::Gauge, name, value, labels)
    }

    pub fn histogram(name: &str, value: f64, labels: MetricLabels) -> Self {
        Self::new(MetricKind::Histogram, name, value, labels)
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }
}

/// Destination for exported batches.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Deliver one batch. Failures are logged by the exporter and the
    /// batch is discarded.
    async fn export(&self, batch: Vec<MetricRecord>) -> Result<(), ExportError>;
}

/// Sink that writes batches to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl MetricsSink for TracingSink {
    async fn export(&self, batch: Vec<MetricRecord>) -> Result<(), ExportError> {
        tracing::debug!(records = batch.len(), "Exporting metrics batch");
        for record in &batch {
            tracing::trace!(
                kind = ?record.kind,
                name = %record.name,
                value = record.value,
                lane = %record.labels.lane,
                provider = %record.labels.provider,
                status = %record.labels.status,
                trace_id = record.trace_id.as_deref().unwrap_or(""),
                "metric"
            );
        }
        Ok(())
    }
}

/// Exporter tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Bounded channel capacity between request path and exporter task
    pub channel_capacity: usize,

    /// Records per sink call
    pub batch_size: usize,

    /// Flush a partial batch after this long
    #[serde(with = "duration")]
    pub flush_interval: Duration,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4096,
            batch_size: 256,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Non-blocking handle for emitting records. Cheap to clone.
#[derive(Clone)]
pub struct MetricsExporter {
    tx: mpsc::Sender<MetricRecord>,
    dropped: Arc<AtomicU64>,
}

impl MetricsExporter {
    /// Queue a record. Returns false (and counts a drop) when the buffer is
    /// full or the exporter task has stopped.
    pub fn emit(&self, record: MetricRecord) -> bool {
        if self.tx.try_send(record).is_ok() {
            return true;
        }

        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % 1000 == 0 {
            tracing::warn!(dropped, "Metrics buffer full, dropping records");
        }
        false
    }

    /// Records dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Start the background exporter task.
///
/// The task ends once every [`MetricsExporter`] clone is dropped, after
/// flushing what is still buffered.
pub fn spawn_exporter(
    sink: Arc<dyn MetricsSink>,
    config: ExportConfig,
) -> (MetricsExporter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(config.channel_capacity.max(1));
    let batch_size = config.batch_size.max(1);
    let flush_interval = config.flush_interval;

    let handle = tokio::spawn(async move {
        let mut buffer: Vec<MetricRecord> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(record) => {
                        buffer.push(record);
                        if buffer.len() >= batch_size {
                            flush(sink.as_ref(), &mut buffer).await;
                        }
                    }
                    None => {
                        flush(sink.as_ref(), &mut buffer).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    flush(sink.as_ref(), &mut buffer).await;
                }
            }
        }

        tracing::debug!("Metrics exporter stopped");
    });

    (
        MetricsExporter {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        handle,
    )
}

/// Nearest-rank percentile of an ascending slice; 0 when empty.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

async fn flush(sink: &dyn MetricsSink, buffer: &mut Vec<MetricRecord>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let size = batch.len();
    if let Err(e) = sink.export(batch).await {
        tracing::warn!(error = %e, records = size, "Metrics export failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        batches: Mutex<Vec<Vec<MetricRecord>>>,
    }

    #[async_trait]
    impl MetricsSink for CollectingSink {
        async fn export(&self, batch: Vec<MetricRecord>) -> Result<(), ExportError> {
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    fn labels() -> MetricLabels {
        MetricLabels::new(LaneKind::Web, "brave", Some(ProviderSource::Keyed), "success")
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_by_size_and_flushes_on_close() {
        let sink = Arc::new(CollectingSink::default());
        let config = ExportConfig {
            channel_capacity: 64,
            batch_size: 3,
            flush_interval: Duration::from_secs(60),
        };
        let (exporter, handle) = spawn_exporter(sink.clone(), config);

        for _ in 0..7 {
            assert!(exporter.emit(MetricRecord::counter("lane_attempts_total", labels())));
        }
        drop(exporter);
        handle.await.unwrap();

        let sizes: Vec<usize> = sink.batches.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 7);
        assert!(sizes.iter().all(|&n| n <= 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushed_on_interval() {
        let sink = Arc::new(CollectingSink::default());
        let config = ExportConfig {
            channel_capacity: 64,
            batch_size: 100,
            flush_interval: Duration::from_millis(500),
        };
        let (exporter, _handle) = spawn_exporter(sink.clone(), config);

        exporter.emit(
            MetricRecord::histogram("lane_latency_ms", 120.0, labels())
                .with_trace_id(Some("trace-1".to_string())),
        );
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].trace_id.as_deref(), Some("trace-1"));
        assert_eq!(batches[0][0].kind, MetricKind::Histogram);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_instead_of_blocking() {
        let sink = Arc::new(CollectingSink::default());
        let config = ExportConfig {
            channel_capacity: 2,
            batch_size: 100,
            flush_interval: Duration::from_secs(60),
        };
        let (exporter, _handle) = spawn_exporter(sink, config);

        // No await between emits: the exporter task cannot drain in between.
        let accepted = (0..5)
            .filter(|_| exporter.emit(MetricRecord::counter("fallback_used_total", labels())))
            .count();

        assert_eq!(accepted, 2);
        assert_eq!(exporter.dropped(), 3);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values: Vec<f64> = (1..=20).map(f64::from).collect();
        assert_eq!(percentile(&values, 50.0), 10.0);
        assert_eq!(percentile(&values, 95.0), 19.0);
        assert_eq!(percentile(&values, 100.0), 20.0);
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&[], 95.0), 0.0);
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_batches() {
        let sink = TracingSink;
        let batch = vec![MetricRecord::gauge("breaker_state", 1.0, labels())];
        assert!(sink.export(batch).await.is_ok());
    }
}
