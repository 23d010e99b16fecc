//! Budget configuration parsing and validation.
//!
//! Budget documents are structured data validated against JSON Schema
//! and then checked semantically. This module handles parsing YAML/JSON
//! documents and rejecting anything inconsistent before it reaches the
//! request path.

mod parser;
mod schema;

pub use parser::{
    BudgetConfig, BudgetProfile, ConfigError, ProviderLatencyProfile, MAX_RESPONSE_LIMIT,
};
pub use schema::validate_budget_schema;

/// Serde adapters for human-readable durations ("5s", "1500ms").
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }

    /// Same encoding for `Option<Duration>`.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|text| humantime::parse_duration(&text).map_err(serde::de::Error::custom))
                .transpose()
        }
    }

    /// Same encoding for the values of an ordered map.
    pub mod map {
        use serde::ser::SerializeMap;
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use std::collections::BTreeMap;
        use std::time::Duration;

        pub fn serialize<K, S>(map: &BTreeMap<K, Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            K: Serialize,
            S: Serializer,
        {
            let mut out = serializer.serialize_map(Some(map.len()))?;
            for (key, value) in map {
                out.serialize_entry(key, &humantime::format_duration(*value).to_string())?;
            }
            out.end()
        }

        pub fn deserialize<'de, K, D>(deserializer: D) -> Result<BTreeMap<K, Duration>, D::Error>
        where
            K: Deserialize<'de> + Ord,
            D: Deserializer<'de>,
        {
            BTreeMap::<K, String>::deserialize(deserializer)?
                .into_iter()
                .map(|(key, text)| {
                    humantime::parse_duration(&text)
                        .map(|d| (key, d))
                        .map_err(serde::de::Error::custom)
                })
                .collect()
        }
    }
}
