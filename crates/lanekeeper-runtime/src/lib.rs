//! # lanekeeper-runtime
//!
//! Request-path machinery for multi-lane retrieval under one deadline.
//!
//! `lanekeeper-core` says how much time each lane may take. This crate
//! enforces it while requests are in flight:
//!
//! - **Budget Tracker**: per-request ledgers handing each lane
//!   `min(allocation, remaining)` and recording what it used
//! - **Circuit Breaker**: one breaker per (lane, provider), shared by all
//!   requests
//! - **Fallback Metrics**: keyed vs keyless outcomes, provider health and
//!   auto-demotion eligibility
//! - **Trace Recorder**: causal per-request traces over a frozen
//!   environment snapshot
//! - **Key Validator / CI Gates**: pre-deployment checks
//!
//! The [`LaneCoordinator`] wires the request-path pieces together. None of
//! them spawn lane tasks: scheduling and cancellation stay with the
//! orchestrator.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanekeeper_runtime::{LaneCoordinator, ProviderCandidate, Settings};
//! use lanekeeper_core::{ComplexityTier, LaneKind};
//!
//! let coordinator = LaneCoordinator::from_settings(Settings::load(None)?)?;
//! let ctx = coordinator.begin("req-42", ComplexityTier::Simple, "web_search")?;
//!
//! let outcome = coordinator
//!     .run_lane(
//!         &ctx,
//!         LaneKind::Web,
//!         vec![ProviderCandidate::keyed("brave"), ProviderCandidate::keyless("duckduckgo")],
//!         |candidate, timeout| client.search(candidate, query, timeout),
//!     )
//!     .await;
//!
//! let summary = coordinator.end(ctx)?;
//! println!("degraded: {}", summary.is_degraded());
//! ```

pub mod config;
pub mod coordinator;
pub mod gates;
pub mod metrics;
pub mod providers;
pub mod resilience;
pub mod trace;

pub use config::{RuntimeSettings, Settings, SettingsError};
pub use coordinator::{
    CoordinatorError, LaneCoordinator, LaneCoordinatorBuilder, LaneOutcome, LaneReport,
    RequestContext, RequestSummary, RetryConfig,
};
pub use gates::{load_health_events, GateError, GateReport, GateResult, GateRunner, GateSeverity};
pub use metrics::{
    spawn_exporter, ExportConfig, ExportError, MetricKind, MetricLabels, MetricRecord,
    MetricsExporter, MetricsSink, TracingSink,
};
pub use providers::{
    ApiCredential, CredentialLookup, KeyValidationReport, KeyValidator, ProviderCandidate,
    ProviderError, ProviderKeyRequirement,
};
pub use resilience::{
    BudgetExceededError, BudgetLedger, BudgetSummary, BudgetTracker, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, EffectiveTimeout, FallbackConfig, FallbackEvent,
    FallbackMetrics, HealthStatus,
};
pub use trace::{GlobalTrace, LaneStatus, TraceHandle, TraceRecorder};
