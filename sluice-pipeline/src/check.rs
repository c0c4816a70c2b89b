//! Config checks
//!
//! Small validators run against a stage's config before its constructor
//! sees it. Wrap a constructor with [`checked_processor`] or
//! [`checked_filter`] to attach them:
//!
//! ```ignore
//! registry.register_processor(
//!     "echo",
//!     checked_processor(echo, vec![allowed_fields(&["message", "repeat", "level"])]),
//! )?;
//! ```
//!
//! A failing check surfaces as [`PipelineError::InvalidConfig`] naming the
//! action, the same as a constructor error.
//!
//! [`checked_processor`]: crate::registry::checked_processor
//! [`checked_filter`]: crate::registry::checked_filter
//! [`PipelineError::InvalidConfig`]: crate::error::PipelineError::InvalidConfig

use serde_json::Map;
use serde_json::Value as JsonValue;
use std::sync::LazyLock;

use crate::registry::WHEN_KEY;

/// Validates a stage config, returning the reason it was rejected
pub type ConfigCheck = Box<dyn Fn(&JsonValue) -> Result<(), String> + Send + Sync>;

/// Every listed field must be present
pub fn require_fields(fields: &[&str]) -> ConfigCheck {
    let fields = owned(fields);
    Box::new(move |config: &JsonValue| {
        let object = as_object(config)?;
        let missing: Vec<&str> = fields
            .iter()
            .filter(|field| !object.contains_key(field.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing {} option", missing.join(", ")))
        }
    })
}

/// Only the listed fields may be present. `when` is always allowed.
pub fn allowed_fields(fields: &[&str]) -> ConfigCheck {
    let fields = owned(fields);
    Box::new(move |config: &JsonValue| {
        let object = as_object(config)?;
        let unexpected: Vec<&str> = object
            .keys()
            .filter(|key| *key != WHEN_KEY && !fields.contains(*key))
            .map(String::as_str)
            .collect();
        if unexpected.is_empty() {
            Ok(())
        } else {
            Err(format!("unexpected {} option", unexpected.join(", ")))
        }
    })
}

/// Exactly one of the listed fields must be present
pub fn mutually_exclusive_required_fields(fields: &[&str]) -> ConfigCheck {
    let fields = owned(fields);
    Box::new(move |config: &JsonValue| {
        let object = as_object(config)?;
        let present: Vec<&str> = fields
            .iter()
            .filter(|field| object.contains_key(field.as_str()))
            .map(String::as_str)
            .collect();
        match present.as_slice() {
            [_] => Ok(()),
            [] => Err(format!("missing option, select one from {}", fields.join(", "))),
            [first, second, ..] => Err(format!("field {first} and {second} are mutually exclusive")),
        }
    })
}

/// Runs `checks` in order and reports the first failure
pub(crate) fn run_checks(checks: &[ConfigCheck], config: &JsonValue) -> anyhow::Result<()> {
    for check in checks {
        check(config).map_err(anyhow::Error::msg)?;
    }
    Ok(())
}

fn owned(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|field| field.to_string()).collect()
}

fn as_object(config: &JsonValue) -> Result<&Map<String, JsonValue>, String> {
    static EMPTY: LazyLock<Map<String, JsonValue>> = LazyLock::new(Map::new);
    match config {
        JsonValue::Object(object) => Ok(object),
        JsonValue::Null => Ok(&*EMPTY),
        _ => Err("configuration must be an object".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_fields() {
        let check = require_fields(&["host", "port"]);
        assert!(check(&json!({"host": "a", "port": 1, "extra": true})).is_ok());
        assert_eq!(check(&json!({"host": "a"})).unwrap_err(), "missing port option");
        assert_eq!(check(&JsonValue::Null).unwrap_err(), "missing host, port option");
        assert_eq!(check(&json!(["host"])).unwrap_err(), "configuration must be an object");
    }

    #[test]
    fn test_allowed_fields() {
        let check = allowed_fields(&["message", "repeat"]);
        assert!(check(&json!({"message": "hi"})).is_ok());
        assert!(check(&json!({})).is_ok());
        assert!(check(&JsonValue::Null).is_ok());
        assert!(check(&json!({"message": "hi", "when": {"exists": ["x"]}})).is_ok());
        assert_eq!(check(&json!({"mesage": "hi"})).unwrap_err(), "unexpected mesage option");
    }

    #[test]
    fn test_mutually_exclusive_required_fields() {
        let check = mutually_exclusive_required_fields(&["file", "inline"]);
        assert!(check(&json!({"file": "a.json"})).is_ok());
        assert!(check(&json!({"inline": {}})).is_ok());
        assert_eq!(
            check(&json!({"file": "a.json", "inline": {}})).unwrap_err(),
            "field file and inline are mutually exclusive"
        );
        assert_eq!(check(&json!({})).unwrap_err(), "missing option, select one from file, inline");
    }

    #[test]
    fn test_first_failing_check_wins() {
        let checks = vec![require_fields(&["a"]), allowed_fields(&["a"])];
        assert!(run_checks(&checks, &json!({"a": 1})).is_ok());

        let err = run_checks(&checks, &json!({"b": 1})).unwrap_err();
        assert_eq!(err.to_string(), "missing a option");
    }
}
