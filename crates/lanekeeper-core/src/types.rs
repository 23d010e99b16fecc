//! Domain enums shared by every lanekeeper crate.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

lazy_static! {
    /// Provider identifiers: lowercase, start with a letter, `_`/`-` allowed.
    static ref PROVIDER_ID_PATTERN: Regex = Regex::new(r"^[a-z][a-z0-9_-]{0,63}$").unwrap();
}

/// Check whether a provider identifier is well formed.
pub fn is_valid_provider_id(id: &str) -> bool {
    PROVIDER_ID_PATTERN.is_match(id)
}

/// Query difficulty classification. Selects a budget profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Technical,
    Research,
    Multimedia,
}

impl ComplexityTier {
    pub const ALL: [ComplexityTier; 4] = [
        ComplexityTier::Simple,
        ComplexityTier::Technical,
        ComplexityTier::Research,
        ComplexityTier::Multimedia,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Technical => "technical",
            Self::Research => "research",
            Self::Multimedia => "multimedia",
        }
    }
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplexityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str() == s)
            .ok_or_else(|| format!("unknown complexity tier: '{}'", s))
    }
}

/// One independent retrieval or generation sub-task within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneKind {
    Llm,
    Web,
    Vector,
    KnowledgeGraph,
    Keyword,
    Video,
    Fusion,
    OrchestratorReserve,
    Preflight,
}

impl LaneKind {
    pub const ALL: [LaneKind; 9] = [
        LaneKind::Llm,
        LaneKind::Web,
        LaneKind::Vector,
        LaneKind::KnowledgeGraph,
        LaneKind::Keyword,
        LaneKind::Video,
        LaneKind::Fusion,
        LaneKind::OrchestratorReserve,
        LaneKind::Preflight,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Web => "web",
            Self::Vector => "vector",
            Self::KnowledgeGraph => "knowledge_graph",
            Self::Keyword => "keyword",
            Self::Video => "video",
            Self::Fusion => "fusion",
            Self::OrchestratorReserve => "orchestrator_reserve",
            Self::Preflight => "preflight",
        }
    }

    /// Lanes that call third-party providers (and so need credentials).
    pub fn is_provider_backed(self) -> bool {
        !matches!(
            self,
            Self::Fusion | Self::OrchestratorReserve | Self::Preflight
        )
    }
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LaneKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|lane| lane.as_str() == s)
            .ok_or_else(|| format!("unknown lane: '{}'", s))
    }
}

/// Whether a provider call used authenticated credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSource {
    Keyed,
    Keyless,
}

impl ProviderSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keyed => "keyed",
            Self::Keyless => "keyless",
        }
    }
}

impl fmt::Display for ProviderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a static check. Ordered so `max` yields the worst verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationVerdict {
    #[default]
    Pass,
    Warn,
    Fail,
}

impl ValidationVerdict {
    /// Worst verdict of a set; `Pass` when the set is empty.
    pub fn worst<I: IntoIterator<Item = ValidationVerdict>>(verdicts: I) -> Self {
        verdicts.into_iter().max().unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }

    /// Process exit code for a gate run: 0 pass or warn, 1 fail. With
    /// `strict`, a warning also exits 1.
    pub fn exit_code(self, strict: bool) -> i32 {
        match self {
            Self::Pass => 0,
            Self::Warn if strict => 1,
            Self::Warn => 0,
            Self::Fail => 1,
        }
    }
}

impl fmt::Display for ValidationVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_round_trips_through_str() {
        for lane in LaneKind::ALL {
            assert_eq!(lane.as_str().parse::<LaneKind>().unwrap(), lane);
        }
        assert!("carrier_pigeon".parse::<LaneKind>().is_err());
    }

    #[test]
    fn test_tier_serde_uses_snake_case() {
        let json = serde_json::to_string(&ComplexityTier::Multimedia).unwrap();
        assert_eq!(json, "\"multimedia\"");
        let lane: LaneKind = serde_json::from_str("\"knowledge_graph\"").unwrap();
        assert_eq!(lane, LaneKind::KnowledgeGraph);
    }

    #[test]
    fn test_worst_verdict() {
        use ValidationVerdict::*;
        assert_eq!(ValidationVerdict::worst([Pass, Warn, Pass]), Warn);
        assert_eq!(ValidationVerdict::worst([Warn, Fail]), Fail);
        assert_eq!(ValidationVerdict::worst(Vec::new()), Pass);
    }

    #[test]
    fn test_exit_code_follows_strictness() {
        assert_eq!(ValidationVerdict::Pass.exit_code(true), 0);
        assert_eq!(ValidationVerdict::Warn.exit_code(false), 0);
        assert_eq!(ValidationVerdict::Warn.exit_code(true), 1);
        assert_eq!(ValidationVerdict::Fail.exit_code(false), 1);
    }

    #[test]
    fn test_provider_id_format() {
        assert!(is_valid_provider_id("duckduckgo"));
        assert!(is_valid_provider_id("youtube_transcript-public"));
        assert!(!is_valid_provider_id("Brave"));
        assert!(!is_valid_provider_id("9lives"));
        assert!(!is_valid_provider_id(""));
    }

    #[test]
    fn test_support_lanes_are_not_provider_backed() {
        assert!(LaneKind::Web.is_provider_backed());
        assert!(!LaneKind::Fusion.is_provider_backed());
        assert!(!LaneKind::OrchestratorReserve.is_provider_backed());
    }
}
