//! Secure credential handling for provider API keys.
//!
//! Credentials are wrapped in [`SecretString`] as soon as they are read, so
//! they cannot show up in `Debug`/`Display` output, logs or gate reports.
//! Only their presence matters to the validator; the value is exposed
//! explicitly at the point of use.
//!
//! ```ignore
//! use lanekeeper_runtime::providers::ApiCredential;
//!
//! // Config map first, then BRAVE_API_KEY
//! let cred = ApiCredential::from_config_or_env(&configured, "brave")?;
//! request.header("x-api-key", cred.expose());
//! ```

use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::fmt;

use super::ProviderError;

/// Environment variable holding a provider's key: `<PROVIDER_ID>_API_KEY`.
pub fn env_var_for(provider: &str) -> String {
    format!("{}_API_KEY", provider.to_uppercase().replace('-', "_"))
}

/// Where a credential was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Loaded from the settings document
    Config,
    /// `<PROVIDER_ID>_API_KEY`
    Environment,
    /// Injected by the embedding application or a test
    Programmatic,
}

impl CredentialSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Environment => "environment",
            Self::Programmatic => "programmatic",
        }
    }
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A securely-stored API credential for one provider.
pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
    provider: String,
}

impl ApiCredential {
    /// Wrap a value. It cannot be logged after this point.
    pub fn new(
        value: impl Into<String>,
        source: CredentialSource,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            provider: provider.into(),
        }
    }

    /// Load a provider's key from its environment variable.
    pub fn from_env(provider: &str) -> Result<Self, ProviderError> {
        let env_var = env_var_for(provider);
        std::env::var(&env_var)
            .map(|v| Self::new(v, CredentialSource::Environment, provider))
            .map_err(|_| {
                ProviderError::NotConfigured(format!(
                    "{} key not set: configure '{}' environment variable",
                    provider, env_var
                ))
            })
    }

    /// Load a provider's key from the configured map, falling back to the
    /// environment.
    pub fn from_config_or_env(
        configured: &BTreeMap<String, String>,
        provider: &str,
    ) -> Result<Self, ProviderError> {
        if let Some(value) = configured.get(provider) {
            return Ok(Self::new(value.as_str(), CredentialSource::Config, provider));
        }

        if let Ok(value) = std::env::var(env_var_for(provider)) {
            return Ok(Self::new(value, CredentialSource::Environment, provider));
        }

        Err(ProviderError::NotConfigured(format!(
            "{} key required: set credentials.{} in config or {} environment variable",
            provider,
            provider,
            env_var_for(provider)
        )))
    }

    /// Expose the value for use in an API call. Never store the result.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    /// Blank values count as not configured.
    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().trim().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("provider", &self.provider)
            .finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} key from {} [REDACTED]", self.provider, self.source)
    }
}
