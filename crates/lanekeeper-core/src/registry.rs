//! Static (tier, lane) → allocation lookup, loaded once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BudgetConfig, BudgetProfile, ConfigError};
use crate::types::{ComplexityTier, LaneKind};

/// Read-only registry of budget profiles.
///
/// Profiles are handed out behind `Arc` so per-request ledgers can hold a
/// reference without copying the allocation table.
#[derive(Debug, Clone)]
pub struct BudgetRegistry {
    version: String,
    profiles: BTreeMap<ComplexityTier, Arc<BudgetProfile>>,
}

impl BudgetRegistry {
    /// Build a registry from a validated configuration.
    pub fn from_config(config: &BudgetConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let profiles = config
            .tiers
            .iter()
            .map(|(tier, profile)| (*tier, Arc::new(profile.clone())))
            .collect();

        tracing::debug!(version = %config.version, "Budget registry loaded");

        Ok(Self {
            version: config.version.clone(),
            profiles,
        })
    }

    /// Registry over the built-in profiles.
    pub fn with_defaults() -> Self {
        let config = BudgetConfig::default();
        let profiles = config
            .tiers
            .into_iter()
            .map(|(tier, profile)| (tier, Arc::new(profile)))
            .collect();

        Self {
            version: config.version,
            profiles,
        }
    }

    /// Profile for a tier.
    pub fn get_profile(&self, tier: ComplexityTier) -> Result<Arc<BudgetProfile>, ConfigError> {
        self.profiles
            .get(&tier)
            .cloned()
            .ok_or(ConfigError::MissingTier(tier))
    }

    /// Profile for a tier given by name.
    pub fn get_profile_by_name(&self, tier: &str) -> Result<Arc<BudgetProfile>, ConfigError> {
        let tier = tier
            .parse::<ComplexityTier>()
            .map_err(|_| ConfigError::UnknownTier(tier.to_string()))?;
        self.get_profile(tier)
    }

    /// Allocation for a lane in a tier.
    pub fn allocation(&self, tier: ComplexityTier, lane: LaneKind) -> Result<Duration, ConfigError> {
        self.get_profile(tier)?
            .allocation(lane)
            .ok_or(ConfigError::MissingAllocation { tier, lane })
    }

    /// Tiers with a profile, in order.
    pub fn tiers(&self) -> impl Iterator<Item = ComplexityTier> + '_ {
        self.profiles.keys().copied()
    }

    /// Version of the loaded budget document.
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl Default for BudgetRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
