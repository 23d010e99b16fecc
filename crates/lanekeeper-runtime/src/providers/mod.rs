//! Provider-facing types for lanekeeper-runtime.
//!
//! The network clients that call search, vector, graph and LLM APIs live
//! outside this crate. They plug in as closures returning
//! `Result<T, ProviderError>`, and are described to the coordinator as
//! ordered [`ProviderCandidate`]s.
//!
//! ## Security
//!
//! Credentials go through the [`secrets`] module. See [`ApiCredential`].

use lanekeeper_core::{LaneKind, ProviderSource};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

mod keys;
pub mod secrets;

pub use keys::{
    default_requirements, requirements_from_yaml, ConfiguredCredentials, CredentialLookup,
    KeyValidationReport, KeyValidator, LaneKeyDetail, ProviderKeyRequirement, StaticCredentials,
};
pub use secrets::{env_var_for, ApiCredential, CredentialSource};

/// Errors from a single provider call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Authentication failed")]
    AuthError,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Circuit open for {provider} on lane {lane}")]
    CircuitOpen { lane: LaneKind, provider: String },

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether a breaker should count this against the provider.
    ///
    /// Configuration mistakes and rejected-by-breaker calls say nothing
    /// about the provider's health.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::NotConfigured(_) | Self::CircuitOpen { .. })
    }
}

/// One provider the coordinator may try for a lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderCandidate {
    pub provider: String,
    pub source: ProviderSource,
}

impl ProviderCandidate {
    pub fn keyed(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            source: ProviderSource::Keyed,
        }
    }

    pub fn keyless(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            source: ProviderSource::Keyless,
        }
    }

    pub fn is_keyless(&self) -> bool {
        self.source == ProviderSource::Keyless
    }
}

impl fmt::Display for ProviderCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.provider, self.source)
    }
}
