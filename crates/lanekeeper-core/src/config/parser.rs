//! Budget configuration parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::duration;
use super::schema::validate_budget_schema;
use crate::types::{is_valid_provider_id, ComplexityTier, LaneKind};

/// Errors that can occur when loading or querying budget configuration.
///
/// These are startup failures; nothing on the request path recovers them.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    SchemaError(Vec<String>),

    #[error("Unknown complexity tier: {0}")]
    UnknownTier(String),

    #[error("No budget profile for tier '{0}'")]
    MissingTier(ComplexityTier),

    #[error("No allocation for lane '{lane}' in tier '{tier}'")]
    MissingAllocation { tier: ComplexityTier, lane: LaneKind },

    #[error("Allocation {allocation:?} for lane '{lane}' exceeds global limit {limit:?} in tier '{tier}'")]
    AllocationExceedsLimit {
        tier: ComplexityTier,
        lane: LaneKind,
        allocation: Duration,
        limit: Duration,
    },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

fn default_tolerance() -> f64 {
    0.1
}

/// Time budget for one complexity tier.
///
/// Lane allocations are not required to sum to the global limit: lanes run
/// concurrently and race the same deadline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetProfile {
    /// Wall-clock limit for the whole response
    #[serde(with = "duration")]
    pub global_response_limit: Duration,

    /// Limit for the first byte of the response
    #[serde(with = "duration")]
    pub ttfb_limit: Duration,

    /// Per-lane allocations
    #[serde(with = "duration::map")]
    pub allocations: BTreeMap<LaneKind, Duration>,

    /// Fraction over a limit still counted as within SLA (0.0 - 1.0)
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Raise instead of report when a budget is exceeded
    #[serde(default)]
    pub strict: bool,
}

/// Upper bound on any tier's global limit. Lane allocations and the TTFB
/// limit are bounded by the global limit in turn.
pub const MAX_RESPONSE_LIMIT: Duration = Duration::from_secs(600);

impl BudgetProfile {
    /// Allocation for a lane, if the profile has one.
    pub fn allocation(&self, lane: LaneKind) -> Option<Duration> {
        self.allocations.get(&lane).copied()
    }

    /// Time held back for orchestration overhead.
    pub fn reserve(&self) -> Duration {
        self.allocation(LaneKind::OrchestratorReserve)
            .unwrap_or_default()
    }

    /// A limit widened by the profile's tolerance. Saturates at
    /// `Duration::MAX`.
    pub fn with_tolerance(&self, limit: Duration) -> Duration {
        Duration::try_from_secs_f64(limit.as_secs_f64() * (1.0 + self.tolerance))
            .unwrap_or(Duration::MAX)
    }

    fn build(global_ms: u64, ttfb_ms: u64, allocations: &[(LaneKind, u64)]) -> Self {
        Self {
            global_response_limit: Duration::from_millis(global_ms),
            ttfb_limit: Duration::from_millis(ttfb_ms),
            allocations: allocations
                .iter()
                .map(|(lane, ms)| (*lane, Duration::from_millis(*ms)))
                .collect(),
            tolerance: default_tolerance(),
            strict: false,
        }
    }

    fn validate(&self, tier: ComplexityTier) -> Result<(), ConfigError> {
        if self.global_response_limit.is_zero() {
            return Err(ConfigError::ValidationError(format!(
                "tier '{}': global_response_limit must be positive",
                tier
            )));
        }

        if self.global_response_limit > MAX_RESPONSE_LIMIT {
            return Err(ConfigError::ValidationError(format!(
                "tier '{}': global_response_limit {:?} exceeds {:?}",
                tier, self.global_response_limit, MAX_RESPONSE_LIMIT
            )));
        }

        if self.ttfb_limit > self.global_response_limit {
            return Err(ConfigError::ValidationError(format!(
                "tier '{}': ttfb_limit {:?} exceeds global_response_limit {:?}",
                tier, self.ttfb_limit, self.global_response_limit
            )));
        }

        if !(0.0..=1.0).contains(&self.tolerance) {
            return Err(ConfigError::ValidationError(format!(
                "tier '{}': tolerance {} must be within [0, 1]",
                tier, self.tolerance
            )));
        }

        if self.allocations.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "tier '{}': no lane allocations",
                tier
            )));
        }

        for (lane, allocation) in &self.allocations {
            if *allocation > self.global_response_limit {
                return Err(ConfigError::AllocationExceedsLimit {
                    tier,
                    lane: *lane,
                    allocation: *allocation,
                    limit: self.global_response_limit,
                });
            }
        }

        Ok(())
    }
}

/// Known latency characteristics of one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderLatencyProfile {
    /// Observed p95 latency
    #[serde(with = "duration")]
    pub p95_latency: Duration,

    /// Lanes this provider can serve
    pub lanes: Vec<LaneKind>,

    /// Public provider that needs no credentials
    #[serde(default)]
    pub keyless: bool,
}

/// The full budget document: one profile per tier plus provider latencies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetConfig {
    /// Version of this budget document
    pub version: String,

    /// Profile per complexity tier
    pub tiers: BTreeMap<ComplexityTier, BudgetProfile>,

    /// Provider latency table used by static compliance checks
    #[serde(default)]
    pub provider_latency: BTreeMap<String, ProviderLatencyProfile>,
}

impl BudgetConfig {
    /// Parse a budget document from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(serde_json::to_value(value)?)
    }

    /// Parse a budget document from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Parse a budget document from a file, picking the format by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Schema-check, deserialize and validate an already-parsed document.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        validate_budget_schema(&value).map_err(ConfigError::SchemaError)?;
        let config: BudgetConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Profile for a tier.
    pub fn profile(&self, tier: ComplexityTier) -> Option<&BudgetProfile> {
        self.tiers.get(&tier)
    }

    /// Validate the document's semantics.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for tier in ComplexityTier::ALL {
            let profile = self.tiers.get(&tier).ok_or(ConfigError::MissingTier(tier))?;
            profile.validate(tier)?;
        }

        for (provider, latency) in &self.provider_latency {
            if !is_valid_provider_id(provider) {
                return Err(ConfigError::ValidationError(format!(
                    "invalid provider id '{}'",
                    provider
                )));
            }
            if latency.lanes.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "provider '{}' serves no lanes",
                    provider
                )));
            }
        }

        Ok(())
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        use LaneKind::*;

        let tiers = BTreeMap::from([
            (
                ComplexityTier::Simple,
                BudgetProfile::build(
                    5_000,
                    1_500,
                    &[
                        (Llm, 3_000),
                        (Web, 2_000),
                        (Vector, 1_500),
                        (KnowledgeGraph, 1_500),
                        (Keyword, 1_000),
                        (Fusion, 500),
                        (OrchestratorReserve, 500),
                        (Preflight, 500),
                    ],
                ),
            ),
            (
                ComplexityTier::Technical,
                BudgetProfile::build(
                    8_000,
                    2_000,
                    &[
                        (Llm, 5_000),
                        (Web, 3_000),
                        (Vector, 2_500),
                        (KnowledgeGraph, 2_500),
                        (Keyword, 1_500),
                        (Fusion, 1_000),
                        (OrchestratorReserve, 750),
                        (Preflight, 750),
                    ],
                ),
            ),
            (
                ComplexityTier::Research,
                BudgetProfile::build(
                    15_000,
                    3_000,
                    &[
                        (Llm, 10_000),
                        (Web, 6_000),
                        (Vector, 4_000),
                        (KnowledgeGraph, 5_000),
                        (Keyword, 2_000),
                        (Fusion, 2_000),
                        (OrchestratorReserve, 1_000),
                        (Preflight, 1_000),
                    ],
                ),
            ),
            (
                ComplexityTier::Multimedia,
                BudgetProfile::build(
                    12_000,
                    2_500,
                    &[
                        (Llm, 6_000),
                        (Web, 4_000),
                        (Vector, 3_000),
                        (Video, 8_000),
                        (Keyword, 1_500),
                        (Fusion, 1_500),
                        (OrchestratorReserve, 1_000),
                        (Preflight, 1_000),
                    ],
                ),
            ),
        ]);

        let provider_latency = [
            ("duckduckgo", 1_800, vec![Web], true),
            ("searxng", 1_900, vec![Web], true),
            ("brave", 900, vec![Web], false),
            ("tavily", 1_200, vec![Web], false),
            ("qdrant", 400, vec![Vector], false),
            ("local_faiss", 250, vec![Vector], true),
            ("neo4j", 700, vec![KnowledgeGraph], false),
            ("wikidata", 1_400, vec![KnowledgeGraph], true),
            ("elasticsearch", 300, vec![Keyword], false),
            ("bm25_local", 150, vec![Keyword], true),
            ("youtube_data", 1_500, vec![Video], false),
            ("youtube_transcript", 3_500, vec![Video], true),
            ("openai", 2_500, vec![Llm, Preflight], false),
            ("anthropic", 2_800, vec![Llm, Preflight], false),
        ]
        .into_iter()
        .map(|(id, ms, lanes, keyless)| {
            (
                id.to_string(),
                ProviderLatencyProfile {
                    p95_latency: Duration::from_millis(ms),
                    lanes,
                    keyless,
                },
            )
        })
        .collect();

        Self {
            version: "1.0".to_string(),
            tiers,
            provider_latency,
        }
    }
}
