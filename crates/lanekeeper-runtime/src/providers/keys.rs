//! Provider key validation: does every lane have a usable credential, or
//! at least a keyless fallback?
//!
//! Runs at CI time only. Nothing on the request path consults it.

use lanekeeper_core::{LaneKind, ValidationVerdict};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::secrets::{env_var_for, ApiCredential, CredentialSource};

/// Which providers can serve a lane with and without credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderKeyRequirement {
    pub lane: LaneKind,

    /// Keyed providers; one configured credential is enough
    #[serde(default)]
    pub required_provider_ids: Vec<String>,

    /// Keyless providers usable when no credential is present
    #[serde(default)]
    pub fallback_provider_ids: Vec<String>,

    #[serde(default)]
    pub description: String,
}

impl ProviderKeyRequirement {
    pub fn new(lane: LaneKind, required: &[&str], fallbacks: &[&str], description: &str) -> Self {
        Self {
            lane,
            required_provider_ids: required.iter().map(|s| s.to_string()).collect(),
            fallback_provider_ids: fallbacks.iter().map(|s| s.to_string()).collect(),
            description: description.to_string(),
        }
    }
}

/// Built-in requirements for the provider-backed lanes.
pub fn default_requirements() -> Vec<ProviderKeyRequirement> {
    vec![
        ProviderKeyRequirement::new(
            LaneKind::Llm,
            &["openai", "anthropic"],
            &[],
            "LLM synthesis and pre-flight refinement",
        ),
        ProviderKeyRequirement::new(
            LaneKind::Web,
            &["brave", "tavily"],
            &["duckduckgo", "searxng"],
            "Web search",
        ),
        ProviderKeyRequirement::new(
            LaneKind::Vector,
            &["qdrant"],
            &["local_faiss"],
            "Vector similarity search",
        ),
        ProviderKeyRequirement::new(
            LaneKind::KnowledgeGraph,
            &["neo4j"],
            &["wikidata"],
            "Knowledge graph lookup",
        ),
        ProviderKeyRequirement::new(
            LaneKind::Keyword,
            &["elasticsearch"],
            &["bm25_local"],
            "Keyword search",
        ),
        ProviderKeyRequirement::new(
            LaneKind::Video,
            &["youtube_data"],
            &["youtube_transcript"],
            "Video and transcript lookup",
        ),
    ]
}

#[derive(Deserialize)]
struct RequirementsDocument {
    requirements: Vec<ProviderKeyRequirement>,
}

/// Parse a `requirements:` list from YAML.
pub fn requirements_from_yaml(yaml: &str) -> Result<Vec<ProviderKeyRequirement>, serde_yaml::Error> {
    serde_yaml::from_str::<RequirementsDocument>(yaml).map(|doc| doc.requirements)
}

/// Resolves whether a provider has a credential.
pub trait CredentialLookup: Send + Sync {
    fn lookup(&self, provider: &str) -> Option<ApiCredential>;

    /// Present and non-blank.
    fn is_configured(&self, provider: &str) -> bool {
        self.lookup(provider).is_some_and(|cred| !cred.is_empty())
    }
}

/// Credentials from the settings document, then `<PROVIDER_ID>_API_KEY`.
#[derive(Default)]
pub struct ConfiguredCredentials {
    configured: BTreeMap<String, SecretString>,
}

impl ConfiguredCredentials {
    pub fn new(configured: BTreeMap<String, String>) -> Self {
        Self {
            configured: configured
                .into_iter()
                .map(|(provider, value)| (provider, SecretString::from(value)))
                .collect(),
        }
    }

    /// Environment only.
    pub fn from_env() -> Self {
        Self::default()
    }
}

impl CredentialLookup for ConfiguredCredentials {
    fn lookup(&self, provider: &str) -> Option<ApiCredential> {
        if let Some(value) = self.configured.get(provider) {
            return Some(ApiCredential::new(
                value.expose_secret(),
                CredentialSource::Config,
                provider,
            ));
        }
        ApiCredential::from_env(provider).ok()
    }
}

/// Fixed set of "configured" providers, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    present: BTreeSet<String>,
}

impl StaticCredentials {
    pub fn new<I, S>(providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            present: providers.into_iter().map(Into::into).collect(),
        }
    }
}

impl CredentialLookup for StaticCredentials {
    fn lookup(&self, provider: &str) -> Option<ApiCredential> {
        self.present
            .contains(provider)
            .then(|| ApiCredential::new("static", CredentialSource::Programmatic, provider))
    }
}

/// Per-lane outcome with the providers behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneKeyDetail {
    pub lane: LaneKind,
    pub status: ValidationVerdict,
    pub configured: Vec<String>,
    pub missing: Vec<String>,
    pub fallbacks: Vec<String>,
    pub description: String,
}

/// Machine-readable validation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValidationReport {
    pub overall_status: ValidationVerdict,
    pub per_lane_status: BTreeMap<LaneKind, ValidationVerdict>,
    pub keyless_fallback_enabled: bool,
    pub details: Vec<LaneKeyDetail>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Checks requirements against a credential source.
pub struct KeyValidator {
    requirements: Vec<ProviderKeyRequirement>,
    keyless_fallback_enabled: bool,
}

impl KeyValidator {
    pub fn new(requirements: Vec<ProviderKeyRequirement>) -> Self {
        Self {
            requirements,
            keyless_fallback_enabled: true,
        }
    }

    pub fn with_keyless_fallback(mut self, enabled: bool) -> Self {
        self.keyless_fallback_enabled = enabled;
        self
    }

    pub fn requirements(&self) -> &[ProviderKeyRequirement] {
        &self.requirements
    }

    /// Per lane: a configured key passes; otherwise an enabled keyless
    /// fallback warns; otherwise the lane fails.
    pub fn validate(&self, credentials: &dyn CredentialLookup) -> KeyValidationReport {
        let mut per_lane_status: BTreeMap<LaneKind, ValidationVerdict> = BTreeMap::new();
        let mut details = Vec::with_capacity(self.requirements.len());
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut recommendations = Vec::new();

        for req in &self.requirements {
            let (configured, missing): (Vec<String>, Vec<String>) = req
                .required_provider_ids
                .iter()
                .cloned()
                .partition(|provider| credentials.is_configured(provider));
            let has_fallback = !req.fallback_provider_ids.is_empty();
            let env_hint = missing
                .iter()
                .map(|p| env_var_for(p))
                .collect::<Vec<_>>()
                .join(" or ");

            let status = if !configured.is_empty() {
                ValidationVerdict::Pass
            } else if self.keyless_fallback_enabled && has_fallback {
                warnings.push(format!(
                    "Lane '{}' has no configured credentials; serving from keyless fallback ({})",
                    req.lane,
                    req.fallback_provider_ids.join(", ")
                ));
                recommendations.push(format!(
                    "Set {} to restore keyed results on lane '{}'",
                    env_hint, req.lane
                ));
                ValidationVerdict::Warn
            } else {
                errors.push(format!(
                    "Lane '{}' has no configured credentials and no usable keyless fallback",
                    req.lane
                ));
                if has_fallback {
                    recommendations.push(format!(
                        "Enable keyless fallback or set {} for lane '{}'",
                        env_hint, req.lane
                    ));
                } else if !env_hint.is_empty() {
                    recommendations.push(format!("Set {} for lane '{}'", env_hint, req.lane));
                }
                ValidationVerdict::Fail
            };

            tracing::debug!(lane = %req.lane, status = %status, configured = configured.len(), "Lane key check");

            per_lane_status
                .entry(req.lane)
                .and_modify(|existing| *existing = (*existing).max(status))
                .or_insert(status);

            details.push(LaneKeyDetail {
                lane: req.lane,
                status,
                configured,
                missing,
                fallbacks: req.fallback_provider_ids.clone(),
                description: req.description.clone(),
            });
        }

        KeyValidationReport {
            overall_status: ValidationVerdict::worst(per_lane_status.values().copied()),
            per_lane_status,
            keyless_fallback_enabled: self.keyless_fallback_enabled,
            details,
            errors,
            warnings,
            recommendations,
        }
    }
}

impl Default for KeyValidator {
    fn default() -> Self {
        Self::new(default_requirements())
    }
}
