//! Pre-deployment check that a lane's budgets fit its providers' latency.
//!
//! This is a static check over configuration. It never runs on the
//! request path.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::BudgetConfig;
use crate::types::{ComplexityTier, LaneKind, ValidationVerdict};

/// One observation from a compliance check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplianceFinding {
    pub tier: Option<ComplexityTier>,
    pub provider: Option<String>,
    pub verdict: ValidationVerdict,
    pub message: String,
}

/// Result of checking one lane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplianceReport {
    pub lane: LaneKind,
    pub keyless_only: bool,
    pub verdict: ValidationVerdict,
    /// Providers considered
    pub providers: Vec<String>,
    /// Non-passing findings only
    pub findings: Vec<ComplianceFinding>,
}

impl ComplianceReport {
    pub fn errors(&self) -> impl Iterator<Item = &ComplianceFinding> {
        self.findings
            .iter()
            .filter(|f| f.verdict == ValidationVerdict::Fail)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ComplianceFinding> {
        self.findings
            .iter()
            .filter(|f| f.verdict == ValidationVerdict::Warn)
    }
}

/// Check a lane's per-provider and end-to-end budgets against known latency.
///
/// Every candidate provider must fit: fallback order is not latency-aware,
/// so any of them may end up serving the lane.
///
/// Per tier that allocates the lane:
/// - provider p95 ≤ allocation → pass
/// - p95 ≤ allocation × (1 + tolerance) → warn
/// - otherwise → fail
/// - p95 + fusion + reserve > global limit → fail
pub fn validate_budget_compliance(
    config: &BudgetConfig,
    lane: LaneKind,
    keyless_only: bool,
) -> ComplianceReport {
    let candidates: Vec<(&String, Duration)> = config
        .provider_latency
        .iter()
        .filter(|(_, p)| p.lanes.contains(&lane) && (p.keyless || !keyless_only))
        .map(|(id, p)| (id, p.p95_latency))
        .collect();

    let mut findings = Vec::new();

    if candidates.is_empty() {
        findings.push(ComplianceFinding {
            tier: None,
            provider: None,
            verdict: ValidationVerdict::Fail,
            message: format!(
                "no {}provider with known latency serves lane '{}'",
                if keyless_only { "keyless " } else { "" },
                lane
            ),
        });
    }

    let mut allocated_anywhere = false;

    for (tier, profile) in &config.tiers {
        let Some(allocation) = profile.allocation(lane) else {
            continue;
        };
        allocated_anywhere = true;

        let downstream = profile
            .allocation(LaneKind::Fusion)
            .unwrap_or_default()
            .saturating_add(profile.reserve());

        for (provider, p95) in &candidates {
            if *p95 > allocation {
                let tolerated = profile.with_tolerance(allocation);
                let verdict = if *p95 <= tolerated {
                    ValidationVerdict::Warn
                } else {
                    ValidationVerdict::Fail
                };
                findings.push(ComplianceFinding {
                    tier: Some(*tier),
                    provider: Some((*provider).clone()),
                    verdict,
                    message: format!(
                        "p95 latency {:?} exceeds {} allocation {:?} (tolerated up to {:?})",
                        p95, lane, allocation, tolerated
                    ),
                });
            }

            let end_to_end = p95.saturating_add(downstream);
            if end_to_end > profile.global_response_limit {
                findings.push(ComplianceFinding {
                    tier: Some(*tier),
                    provider: Some((*provider).clone()),
                    verdict: ValidationVerdict::Fail,
                    message: format!(
                        "p95 latency {:?} plus fusion and reserve {:?} exceeds global limit {:?}",
                        p95, downstream, profile.global_response_limit
                    ),
                });
            }
        }
    }

    if !allocated_anywhere {
        findings.push(ComplianceFinding {
            tier: None,
            provider: None,
            verdict: ValidationVerdict::Warn,
            message: format!("lane '{}' has no allocation in any tier", lane),
        });
    }

    let verdict = ValidationVerdict::worst(findings.iter().map(|f| f.verdict));

    ComplianceReport {
        lane,
        keyless_only,
        verdict,
        providers: candidates.iter().map(|(id, _)| (*id).clone()).collect(),
        findings,
    }
}
