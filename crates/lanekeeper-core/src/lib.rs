//! # lanekeeper-core
//!
//! Deterministic budget configuration for multi-lane retrieval requests.
//!
//! A request fans out across several concurrent lanes (web, vector,
//! knowledge graph, LLM synthesis, ...) under one wall-clock deadline that
//! depends on the query's complexity tier. This crate owns the static side
//! of that problem:
//!
//! 1. **Typed profiles**: one [`BudgetProfile`] per [`ComplexityTier`],
//!    validated against an embedded JSON Schema and then semantically
//! 2. **Registry**: read-only (tier, lane) → allocation lookup
//! 3. **Compliance**: pre-deployment check that a lane's budgets fit the
//!    latency of the providers that may serve it
//!
//! Nothing here performs I/O after loading or touches shared mutable
//! state; the request-path machinery lives in `lanekeeper-runtime`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanekeeper_core::{BudgetRegistry, ComplexityTier, LaneKind};
//!
//! let registry = BudgetRegistry::with_defaults();
//! let llm = registry.allocation(ComplexityTier::Simple, LaneKind::Llm)?;
//! assert_eq!(llm, std::time::Duration::from_secs(3));
//! ```

pub mod compliance;
pub mod config;
pub mod registry;
pub mod types;

// Re-export main types at crate root
pub use compliance::{validate_budget_compliance, ComplianceFinding, ComplianceReport};
pub use config::{BudgetConfig, BudgetProfile, ConfigError, ProviderLatencyProfile};
pub use registry::BudgetRegistry;
pub use types::{
    is_valid_provider_id, ComplexityTier, LaneKind, ProviderSource, ValidationVerdict,
};
