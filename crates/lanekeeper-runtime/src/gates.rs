//! CI gates: certify deployability from key validation, the budget
//! registry, keyless budget compliance and current provider health.
//!
//! Invoked out-of-band by release tooling. A gate with `error` severity
//! blocks deployment when it fails; a `warning` gate never does.

use chrono::{DateTime, Utc};
use lanekeeper_core::{
    validate_budget_compliance, BudgetRegistry, ConfigError, LaneKind, ValidationVerdict,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Settings, SettingsError};
use crate::providers::{ConfiguredCredentials, CredentialLookup, KeyValidator};
use crate::resilience::{FallbackEvent, FallbackMetrics, HealthStatus};

/// Errors that stop the gate from running at all.
#[derive(Error, Debug)]
pub enum GateError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to read health snapshot: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse health snapshot: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateSeverity {
    Error,
    Warning,
}

/// Outcome of one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub severity: GateSeverity,
    pub status: ValidationVerdict,
    pub messages: Vec<String>,
}

impl GateResult {
    fn new(name: &str, severity: GateSeverity) -> Self {
        Self {
            name: name.to_string(),
            severity,
            status: ValidationVerdict::Pass,
            messages: Vec::new(),
        }
    }

    /// Contribution to the overall status: a failing warning gate only warns.
    pub fn effective_status(&self) -> ValidationVerdict {
        match (self.severity, self.status) {
            (GateSeverity::Warning, ValidationVerdict::Fail) => ValidationVerdict::Warn,
            (_, status) => status,
        }
    }

    pub fn blocks_deployment(&self) -> bool {
        self.effective_status() == ValidationVerdict::Fail
    }
}

/// Machine-readable report for release tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub overall_status: ValidationVerdict,
    pub per_lane_status: BTreeMap<LaneKind, ValidationVerdict>,
    pub gates: Vec<GateResult>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl GateReport {
    /// Process exit code: 0 pass/warn, 1 fail (or warn when strict).
    pub fn exit_code(&self, strict: bool) -> i32 {
        self.overall_status.exit_code(strict)
    }
}

/// Read a health snapshot: a JSON array of exported fallback events.
pub fn load_health_events(path: impl AsRef<Path>) -> Result<Vec<FallbackEvent>, GateError> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn merge_lane(map: &mut BTreeMap<LaneKind, ValidationVerdict>, lane: LaneKind, status: ValidationVerdict) {
    map.entry(lane)
        .and_modify(|existing| *existing = (*existing).max(status))
        .or_insert(status);
}

/// Composes the individual gates into one report.
pub struct GateRunner {
    settings: Settings,
    credentials: Box<dyn CredentialLookup>,
    health: Option<Arc<FallbackMetrics>>,
}

impl GateRunner {
    /// Runner using the settings' credential map and the environment.
    pub fn new(settings: Settings) -> Self {
        let credentials = ConfiguredCredentials::new(settings.runtime.credentials.clone());
        Self {
            settings,
            credentials: Box::new(credentials),
            health: None,
        }
    }

    pub fn with_credentials(mut self, credentials: impl CredentialLookup + 'static) -> Self {
        self.credentials = Box::new(credentials);
        self
    }

    /// Include the provider health gate, fed from live or loaded metrics.
    pub fn with_health(mut self, metrics: Arc<FallbackMetrics>) -> Self {
        self.health = Some(metrics);
        self
    }

    /// Run every gate.
    pub fn run(&self) -> GateReport {
        let mut per_lane_status = BTreeMap::new();
        let mut recommendations = Vec::new();

        let gates = vec![
            self.check_provider_keys(&mut per_lane_status, &mut recommendations),
            self.check_budget_registry(),
            self.check_keyless_compliance(&mut per_lane_status),
            self.check_provider_health(&mut per_lane_status, &mut recommendations),
        ];

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for gate in &gates {
            let target = match gate.effective_status() {
                ValidationVerdict::Fail => &mut errors,
                ValidationVerdict::Warn => &mut warnings,
                ValidationVerdict::Pass => continue,
            };
            target.extend(gate.messages.iter().map(|m| format!("[{}] {}", gate.name, m)));
        }

        let overall_status = ValidationVerdict::worst(gates.iter().map(GateResult::effective_status));
        tracing::info!(status = %overall_status, errors = errors.len(), warnings = warnings.len(), "CI gates evaluated");

        GateReport {
            overall_status,
            per_lane_status,
            gates,
            errors,
            warnings,
            recommendations,
            generated_at: Utc::now(),
        }
    }

    fn check_provider_keys(
        &self,
        per_lane: &mut BTreeMap<LaneKind, ValidationVerdict>,
        recommendations: &mut Vec<String>,
    ) -> GateResult {
        let mut gate = GateResult::new("provider_keys", GateSeverity::Error);
        let report = KeyValidator::new(self.settings.runtime.requirements())
            .with_keyless_fallback(self.settings.runtime.keyless_fallback_enabled)
            .validate(self.credentials.as_ref());

        for (lane, status) in &report.per_lane_status {
            merge_lane(per_lane, *lane, *status);
        }
        gate.status = report.overall_status;
        gate.messages.extend(report.errors);
        gate.messages.extend(report.warnings);
        recommendations.extend(report.recommendations);
        gate
    }

    fn check_budget_registry(&self) -> GateResult {
        let mut gate = GateResult::new("budget_registry", GateSeverity::Error);
        match BudgetRegistry::from_config(&self.settings.budgets) {
            Ok(registry) => {
                gate.messages.push(format!(
                    "{} tiers loaded from budget document '{}'",
                    registry.tiers().count(),
                    registry.version()
                ));
            }
            Err(e) => {
                gate.status = ValidationVerdict::Fail;
                gate.messages.push(e.to_string());
            }
        }
        gate
    }

    /// Only lanes that can actually fall back to keyless providers are
    /// checked.
    fn check_keyless_compliance(
        &self,
        per_lane: &mut BTreeMap<LaneKind, ValidationVerdict>,
    ) -> GateResult {
        let mut gate = GateResult::new("keyless_budget_compliance", GateSeverity::Warning);
        if !self.settings.runtime.keyless_fallback_enabled {
            gate.messages.push("keyless fallback disabled; skipped".to_string());
            return gate;
        }

        let mut verdicts = Vec::new();
        for req in self.settings.runtime.requirements() {
            if req.fallback_provider_ids.is_empty() {
                continue;
            }
            let report = validate_budget_compliance(&self.settings.budgets, req.lane, true);
            // Warning gate: its failures never fail a lane outright.
            merge_lane(per_lane, req.lane, report.verdict.min(ValidationVerdict::Warn));
            gate.messages.extend(report.findings.iter().map(|f| f.message.clone()));
            verdicts.push(report.verdict);
        }
        gate.status = ValidationVerdict::worst(verdicts);
        gate
    }

    fn check_provider_health(
        &self,
        per_lane: &mut BTreeMap<LaneKind, ValidationVerdict>,
        recommendations: &mut Vec<String>,
    ) -> GateResult {
        let mut gate = GateResult::new("provider_health", GateSeverity::Error);
        let Some(metrics) = &self.health else {
            gate.messages.push("no health data supplied; skipped".to_string());
            return gate;
        };

        let summary = metrics.health_summary();
        let mut verdicts = Vec::new();
        for health in &summary.providers {
            let status = match health.status {
                HealthStatus::Healthy => continue,
                HealthStatus::Degraded => ValidationVerdict::Warn,
                HealthStatus::Unhealthy => ValidationVerdict::Fail,
            };
            gate.messages.push(format!(
                "{} provider '{}' on lane '{}': failure rate {:.0}% over {} calls",
                health.status.as_str(),
                health.provider,
                health.lane,
                health.failure_rate * 100.0,
                health.total
            ));
            if health.auto_demotion_eligible {
                recommendations.push(format!(
                    "Investigate '{}' on lane '{}' before deploying; it is eligible for auto-demotion",
                    health.provider, health.lane
                ));
            }
            merge_lane(per_lane, health.lane, status);
            verdicts.push(status);
        }
        gate.status = ValidationVerdict::worst(verdicts);
        gate
    }
}
