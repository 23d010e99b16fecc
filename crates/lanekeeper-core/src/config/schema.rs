//! JSON Schema validation for budget documents.
//!
//! Budget documents are validated against `schema/budget_config.schema.json`
//! before they are deserialized, so a typo in a lane name or a malformed
//! duration is reported with its location instead of a serde message.

use std::sync::OnceLock;

/// Embedded budget schema (loaded at compile time).
const BUDGET_SCHEMA_JSON: &str = include_str!("../../schema/budget_config.schema.json");

/// Compiled JSON Schema validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

fn get_validator() -> Result<&'static jsonschema::Validator, String> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = serde_json::from_str(BUDGET_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;

        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result.as_ref().map_err(Clone::clone)
}

/// Validate a budget document against the schema.
///
/// Returns every violation, each suffixed with its instance path.
pub fn validate_budget_schema(config_json: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e])?;

    let errors: Vec<String> = validator
        .iter_errors(config_json)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_profile() -> serde_json::Value {
        serde_json::json!({
            "global_response_limit": "5s",
            "ttfb_limit": "1500ms",
            "allocations": { "llm": "3s" }
        })
    }

    #[test]
    fn test_valid_document_passes_schema() {
        let value = serde_json::json!({
            "version": "1.0",
            "tiers": { "simple": minimal_profile() }
        });
        assert!(validate_budget_schema(&value).is_ok());
    }

    #[test]
    fn test_missing_version_fails() {
        let value = serde_json::json!({ "tiers": {} });
        let errors = validate_budget_schema(&value).unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_unknown_tier_fails() {
        let value = serde_json::json!({
            "version": "1.0",
            "tiers": { "legendary": minimal_profile() }
        });
        assert!(validate_budget_schema(&value).is_err());
    }

    #[test]
    fn test_numeric_duration_fails() {
        let mut profile = minimal_profile();
        profile["global_response_limit"] = serde_json::json!(5);
        let value = serde_json::json!({
            "version": "1.0",
            "tiers": { "simple": profile }
        });
        assert!(validate_budget_schema(&value).is_err());
    }

    #[test]
    fn test_tolerance_out_of_range_fails() {
        let mut profile = minimal_profile();
        profile["tolerance"] = serde_json::json!(1.5);
        let value = serde_json::json!({
            "version": "1.0",
            "tiers": { "simple": profile }
        });
        assert!(validate_budget_schema(&value).is_err());
    }

    #[test]
    fn test_additional_properties_fail() {
        let value = serde_json::json!({
            "version": "1.0",
            "tiers": {},
            "unknown_field": "should fail"
        });
        assert!(validate_budget_schema(&value).is_err());
    }

    #[test]
    fn test_compound_duration_passes() {
        let mut profile = minimal_profile();
        profile["ttfb_limit"] = serde_json::json!("1s 500ms");
        let value = serde_json::json!({
            "version": "1.0",
            "tiers": { "simple": profile }
        });
        assert!(validate_budget_schema(&value).is_ok());
    }
}
