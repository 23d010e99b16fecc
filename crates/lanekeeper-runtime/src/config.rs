//! Runtime settings: the budget document plus the knobs of the request-path
//! subsystems, overridable from the environment.
//!
//! ```yaml
//! budgets:
//!   version: "2025.1"
//!   tiers: { ... }
//! runtime:
//!   circuit_breaker:
//!     failure_threshold: 3
//!     recovery_timeout: 30s
//!   fallback:
//!     auto_demotion_threshold: 0.3
//!   retry:
//!     attempts_per_provider: 2
//!     min_delay: 50ms
//!   keyless_fallback_enabled: true
//! ```
//!
//! Environment variables (applied after the file):
//! - `LANEKEEPER_BREAKER_FAILURE_THRESHOLD`: consecutive failures to open
//! - `LANEKEEPER_BREAKER_RECOVERY_TIMEOUT`: e.g. "30s"
//! - `LANEKEEPER_AUTO_DEMOTION_THRESHOLD`: failure rate in (0, 1]
//! - `LANEKEEPER_KEYLESS_FALLBACK_ENABLED`: "true"/"false"/"1"/"0"
//! - `LANEKEEPER_STRICT_BUDGETS`: treat every tier profile as strict

use lanekeeper_core::{BudgetConfig, BudgetRegistry, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::coordinator::RetryConfig;
use crate::metrics::ExportConfig;
use crate::providers::{default_requirements, ProviderKeyRequirement};
use crate::resilience::{CircuitBreakerConfig, FallbackConfig};
use crate::trace::DEFAULT_MAX_COMPLETED;

pub const ENV_BREAKER_FAILURE_THRESHOLD: &str = "LANEKEEPER_BREAKER_FAILURE_THRESHOLD";
pub const ENV_BREAKER_RECOVERY_TIMEOUT: &str = "LANEKEEPER_BREAKER_RECOVERY_TIMEOUT";
pub const ENV_AUTO_DEMOTION_THRESHOLD: &str = "LANEKEEPER_AUTO_DEMOTION_THRESHOLD";
pub const ENV_KEYLESS_FALLBACK_ENABLED: &str = "LANEKEEPER_KEYLESS_FALLBACK_ENABLED";
pub const ENV_STRICT_BUDGETS: &str = "LANEKEEPER_STRICT_BUDGETS";

/// Errors from loading settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid value '{value}' for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid runtime setting: {0}")]
    Invalid(String),
}

fn default_true() -> bool {
    true
}

fn default_max_completed() -> usize {
    DEFAULT_MAX_COMPLETED
}

/// The `runtime` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default = "default_true")]
    pub keyless_fallback_enabled: bool,

    /// Treat every tier profile as strict
    #[serde(default)]
    pub strict_budgets: bool,

    /// Move demotion-eligible providers to the end of a lane's candidates
    #[serde(default)]
    pub prefer_healthy: bool,

    #[serde(default = "default_max_completed")]
    pub max_completed_traces: usize,

    /// Provider key requirements; built-in ones when absent
    #[serde(default)]
    pub key_requirements: Option<Vec<ProviderKeyRequirement>>,

    /// Explicit provider credentials, consulted before the environment
    #[serde(default, skip_serializing)]
    pub credentials: BTreeMap<String, String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            fallback: FallbackConfig::default(),
            export: ExportConfig::default(),
            retry: RetryConfig::default(),
            keyless_fallback_enabled: true,
            strict_budgets: false,
            prefer_healthy: false,
            max_completed_traces: DEFAULT_MAX_COMPLETED,
            key_requirements: None,
            credentials: BTreeMap::new(),
        }
    }
}

impl RuntimeSettings {
    pub fn requirements(&self) -> Vec<ProviderKeyRequirement> {
        self.key_requirements
            .clone()
            .unwrap_or_else(default_requirements)
    }
}

/// Complete settings document.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct Settings {
    pub budgets: BudgetConfig,
    pub runtime: RuntimeSettings,
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidEnv {
            var,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

impl Settings {
    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, SettingsError> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(serde_json::to_value(value)?)
    }

    /// Parse settings from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Parse settings from a file, picking the format by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Settings from `path` (or built-in defaults), then environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    fn from_value(mut value: serde_json::Value) -> Result<Self, SettingsError> {
        let budgets = match value.get_mut("budgets").map(serde_json::Value::take) {
            Some(budgets) if !budgets.is_null() => BudgetConfig::from_value(budgets)?,
            _ => BudgetConfig::default(),
        };
        let runtime = match value.get_mut("runtime").map(serde_json::Value::take) {
            Some(runtime) if !runtime.is_null() => serde_json::from_value(runtime)?,
            _ => RuntimeSettings::default(),
        };

        let settings = Self { budgets, runtime };
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `LANEKEEPER_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), SettingsError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from any variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BREAKER_FAILURE_THRESHOLD) {
            self.runtime.circuit_breaker.failure_threshold =
                value.trim().parse().map_err(|e: std::num::ParseIntError| {
                    SettingsError::InvalidEnv {
                        var: ENV_BREAKER_FAILURE_THRESHOLD,
                        value: value.clone(),
                        reason: e.to_string(),
                    }
                })?;
        }

        if let Some(value) = lookup(ENV_BREAKER_RECOVERY_TIMEOUT) {
            self.runtime.circuit_breaker.recovery_timeout = humantime::parse_duration(value.trim())
                .map_err(|e| SettingsError::InvalidEnv {
                    var: ENV_BREAKER_RECOVERY_TIMEOUT,
                    value: value.clone(),
                    reason: e.to_string(),
                })?;
        }

        if let Some(value) = lookup(ENV_AUTO_DEMOTION_THRESHOLD) {
            self.runtime.fallback.auto_demotion_threshold =
                value.trim().parse().map_err(|e: std::num::ParseFloatError| {
                    SettingsError::InvalidEnv {
                        var: ENV_AUTO_DEMOTION_THRESHOLD,
                        value: value.clone(),
                        reason: e.to_string(),
                    }
                })?;
        }

        if let Some(value) = lookup(ENV_KEYLESS_FALLBACK_ENABLED) {
            self.runtime.keyless_fallback_enabled =
                parse_bool(ENV_KEYLESS_FALLBACK_ENABLED, &value)?;
        }

        if let Some(value) = lookup(ENV_STRICT_BUDGETS) {
            self.runtime.strict_budgets = parse_bool(ENV_STRICT_BUDGETS, &value)?;
        }

        self.validate()
    }

    /// Range checks on the runtime section.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let runtime = &self.runtime;

        if runtime.circuit_breaker.failure_threshold == 0 {
            return Err(SettingsError::Invalid(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }

        let threshold = runtime.fallback.auto_demotion_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(SettingsError::Invalid(format!(
                "fallback.auto_demotion_threshold {} must be within (0, 1]",
                threshold
            )));
        }

        if !(0.0..=1.0).contains(&runtime.fallback.degraded_ratio) {
            return Err(SettingsError::Invalid(format!(
                "fallback.degraded_ratio {} must be within [0, 1]",
                runtime.fallback.degraded_ratio
            )));
        }

        if runtime.export.batch_size == 0 || runtime.export.channel_capacity == 0 {
            return Err(SettingsError::Invalid(
                "export.batch_size and export.channel_capacity must be positive".to_string(),
            ));
        }

        if runtime.retry.attempts_per_provider == 0 {
            return Err(SettingsError::Invalid(
                "retry.attempts_per_provider must be at least 1".to_string(),
            ));
        }

        if runtime.retry.min_delay > runtime.retry.max_delay {
            return Err(SettingsError::Invalid(
                "retry.min_delay must not exceed retry.max_delay".to_string(),
            ));
        }

        Ok(())
    }

    /// Budget registry over the `budgets` section.
    pub fn registry(&self) -> Result<BudgetRegistry, ConfigError> {
        BudgetRegistry::from_config(&self.budgets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanekeeper_core::ComplexityTier;
    use std::time::Duration;

    const SETTINGS: &str = r#"
budgets:
  version: "2025.1"
  tiers:
    simple:
      global_response_limit: 4s
      ttfb_limit: 1s
      allocations:
        llm: 3s
        web: 2s
    technical:
      global_response_limit: 8s
      ttfb_limit: 2s
      allocations:
        llm: 5s
    research:
      global_response_limit: 15s
      ttfb_limit: 3s
      allocations:
        llm: 10s
    multimedia:
      global_response_limit: 12s
      ttfb_limit: 2500ms
      allocations:
        video: 8s
runtime:
  circuit_breaker:
    failure_threshold: 5
    recovery_timeout: 45s
  fallback:
    auto_demotion_threshold: 0.25
    health_window: 15m
  keyless_fallback_enabled: false
  credentials:
    brave: sk-test
"#;

    #[test]
    fn test_parse_full_document() {
        let settings = Settings::from_yaml(SETTINGS).unwrap();

        assert_eq!(settings.budgets.version, "2025.1");
        let simple = settings.budgets.profile(ComplexityTier::Simple).unwrap();
        assert_eq!(simple.global_response_limit, Duration::from_secs(4));

        assert_eq!(settings.runtime.circuit_breaker.failure_threshold, 5);
        assert_eq!(
            settings.runtime.circuit_breaker.recovery_timeout,
            Duration::from_secs(45)
        );
        assert_eq!(settings.runtime.fallback.auto_demotion_threshold, 0.25);
        assert_eq!(
            settings.runtime.fallback.health_window,
            Some(Duration::from_secs(900))
        );
        // Unset fields keep their defaults.
        assert_eq!(settings.runtime.fallback.degraded_ratio, 0.5);
        assert!(!settings.runtime.keyless_fallback_enabled);
        assert_eq!(settings.runtime.credentials["brave"], "sk-test");
        assert_eq!(settings.runtime.requirements().len(), 6);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let settings = Settings::from_yaml("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.registry().is_ok());
    }

    #[test]
    fn test_invalid_budgets_fail_fast() {
        let yaml = r#"
budgets:
  version: "1"
  tiers:
    simple:
      global_response_limit: 5s
"#;
        assert!(matches!(
            Settings::from_yaml(yaml),
            Err(SettingsError::Config(ConfigError::SchemaError(_)))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        let vars = BTreeMap::from([
            (ENV_BREAKER_FAILURE_THRESHOLD, "2"),
            (ENV_BREAKER_RECOVERY_TIMEOUT, "1m 30s"),
            (ENV_AUTO_DEMOTION_THRESHOLD, "0.5"),
            (ENV_KEYLESS_FALLBACK_ENABLED, "off"),
            (ENV_STRICT_BUDGETS, "1"),
        ]);

        settings
            .apply_overrides(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.runtime.circuit_breaker.failure_threshold, 2);
        assert_eq!(
            settings.runtime.circuit_breaker.recovery_timeout,
            Duration::from_secs(90)
        );
        assert_eq!(settings.runtime.fallback.auto_demotion_threshold, 0.5);
        assert!(!settings.runtime.keyless_fallback_enabled);
        assert!(settings.runtime.strict_budgets);
    }

    #[test]
    fn test_bad_env_value_rejected() {
        let mut settings = Settings::default();
        let err = settings
            .apply_overrides(|var| (var == ENV_KEYLESS_FALLBACK_ENABLED).then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            SettingsError::InvalidEnv {
                var: ENV_KEYLESS_FALLBACK_ENABLED,
                ..
            }
        ));

        let err = settings
            .apply_overrides(|var| (var == ENV_AUTO_DEMOTION_THRESHOLD).then(|| "1.5".to_string()))
            .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));
    }

    #[test]
    fn test_credentials_never_serialized() {
        let settings = Settings::from_yaml(SETTINGS).unwrap();
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("sk-test"));
    }
}
