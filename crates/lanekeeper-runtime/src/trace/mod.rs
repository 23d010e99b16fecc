//! Causal traces of request execution.
//!
//! One [`GlobalTrace`] per request records every lane execution, retry,
//! breaker transition and budget grant, in call order, against an
//! environment snapshot frozen when the request started. That lets a later
//! audit tell "the world changed" apart from "the request misbehaved".

mod recorder;
mod types;

pub use recorder::{
    BreakerEnvironment, EnvironmentProbe, StaticEnvironment, TraceError, TraceHandle,
    TraceRecorder, DEFAULT_MAX_COMPLETED,
};
pub use types::{
    CircuitBreakerEvent, EnvironmentSnapshot, GlobalTrace, LaneBudgetSnapshot, LaneCompletion,
    LaneId, LaneStatus, LaneTrace, RetryAttempt, TraceSummary,
};
