//! Resilience patterns for lanekeeper-runtime.
//!
//! This module provides:
//! - Per-request time budgets with effective lane timeouts
//! - Circuit breakers per (lane, provider)
//! - Fallback metrics, provider health and auto-demotion

mod budget;
mod circuit_breaker;
mod fallback;

pub use budget::{
    BudgetError, BudgetExceededError, BudgetLedger, BudgetScope, BudgetSummary, BudgetTracker,
    BudgetViolation, EffectiveTimeout, LaneUsage, TimeBudget, UsageCheck, CRITICAL_FRACTION,
    WARNING_FRACTION,
};
pub use circuit_breaker::{
    Admission, BreakerSnapshot, BreakerState, BreakerTransition, CircuitBreaker,
    CircuitBreakerConfig, CircuitState,
};
pub use fallback::{
    CumulativeCounts, FallbackConfig, FallbackEvent, FallbackMetrics, FallbackStats,
    HealthStatus, HealthSummary, ProviderHealth, SourceStats,
};
