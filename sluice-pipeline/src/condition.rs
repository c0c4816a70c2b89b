//! Conditions for `when` and `if` sections
//!
//! A condition is a JSON object keyed by operator:
//!
//! ```json
//! {"equals": {"request.method": "GET"}}
//! {"and": [{"exists": ["user"]}, {"not": {"prefix": {"path": "/_"}}}]}
//! {"range": {"response.status": {"gte": 500}}}
//! ```
//!
//! Fields are looked up through [`ConditionTarget`]. A missing field makes
//! every operator but `not` evaluate to false.

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::error::{PipelineError, Result};

/// Anything conditions can be evaluated against
pub trait ConditionTarget {
    fn get_value(&self, field: &str) -> Option<JsonValue>;
}

/// Numeric bounds of a `range` check
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bounds {
    pub gt: Option<f64>,
    pub gte: Option<f64>,
    pub lt: Option<f64>,
    pub lte: Option<f64>,
}

impl Bounds {
    fn contains(&self, value: f64) -> bool {
        self.gt.is_none_or(|bound| value > bound)
            && self.gte.is_none_or(|bound| value >= bound)
            && self.lt.is_none_or(|bound| value < bound)
            && self.lte.is_none_or(|bound| value <= bound)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equals(Vec<(String, JsonValue)>),
    Contains(Vec<(String, String)>),
    Prefix(Vec<(String, String)>),
    Suffix(Vec<(String, String)>),
    Exists(Vec<String>),
    In(Vec<(String, Vec<JsonValue>)>),
    Range(Vec<(String, Bounds)>),
    Length(Vec<(String, usize)>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// Parses a condition section. Several operators in one object are
    /// combined with `and`.
    pub fn parse(config: &JsonValue) -> Result<Self> {
        let object = config
            .as_object()
            .ok_or_else(|| PipelineError::Condition(format!("expected an object, got {config}")))?;

        let mut parsed = object
            .iter()
            .map(|(operator, args)| Self::parse_operator(operator, args))
            .collect::<Result<Vec<_>>>()?;

        match parsed.len() {
            0 => Err(PipelineError::Condition("missing condition config".to_string())),
            1 => Ok(parsed.remove(0)),
            _ => Ok(Self::And(parsed)),
        }
    }

    fn parse_operator(operator: &str, args: &JsonValue) -> Result<Self> {
        match operator {
            "equals" => Ok(Self::Equals(fields(operator, args, |v| Some(v.clone()))?)),
            "contains" => Ok(Self::Contains(fields(operator, args, as_string)?)),
            "prefix" => Ok(Self::Prefix(fields(operator, args, as_string)?)),
            "suffix" => Ok(Self::Suffix(fields(operator, args, as_string)?)),
            "in" => Ok(Self::In(fields(operator, args, |v| v.as_array().cloned())?)),
            "length" => Ok(Self::Length(fields(operator, args, |v| {
                v.as_u64().map(|n| n as usize)
            })?)),
            "range" => Ok(Self::Range(fields(operator, args, parse_bounds)?)),
            "exists" => {
                let names = args
                    .as_array()
                    .ok_or_else(|| invalid(operator, "expected a list of field names"))?;
                names
                    .iter()
                    .map(|name| {
                        name.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| invalid(operator, "field names must be strings"))
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(Self::Exists)
            }
            "and" | "or" => {
                let items = args
                    .as_array()
                    .filter(|items| !items.is_empty())
                    .ok_or_else(|| invalid(operator, "expected a non-empty list of conditions"))?;
                let conditions = items.iter().map(Self::parse).collect::<Result<Vec<_>>>()?;
                Ok(if operator == "and" {
                    Self::And(conditions)
                } else {
                    Self::Or(conditions)
                })
            }
            "not" => Ok(Self::Not(Box::new(Self::parse(args)?))),
            other => Err(PipelineError::Condition(format!(
                "unknown condition operator '{other}'"
            ))),
        }
    }

    /// Evaluates the condition
    pub fn check(&self, target: &dyn ConditionTarget) -> bool {
        match self {
            Self::Equals(fields) => fields.iter().all(|(field, expected)| {
                target
                    .get_value(field)
                    .is_some_and(|actual| values_equal(&actual, expected))
            }),
            Self::Contains(fields) => fields.iter().all(|(field, needle)| {
                target.get_value(field).is_some_and(|actual| match &actual {
                    JsonValue::String(text) => text.contains(needle.as_str()),
                    JsonValue::Array(items) => items
                        .iter()
                        .any(|item| values_equal(item, &JsonValue::String(needle.clone()))),
                    _ => false,
                })
            }),
            Self::Prefix(fields) => fields.iter().all(|(field, prefix)| {
                string_value(target, field).is_some_and(|text| text.starts_with(prefix.as_str()))
            }),
            Self::Suffix(fields) => fields.iter().all(|(field, suffix)| {
                string_value(target, field).is_some_and(|text| text.ends_with(suffix.as_str()))
            }),
            Self::Exists(names) => names.iter().all(|name| target.get_value(name).is_some()),
            Self::In(fields) => fields.iter().all(|(field, candidates)| {
                target.get_value(field).is_some_and(|actual| {
                    candidates
                        .iter()
                        .any(|candidate| values_equal(&actual, candidate))
                })
            }),
            Self::Range(fields) => fields.iter().all(|(field, bounds)| {
                target
                    .get_value(field)
                    .and_then(|actual| as_number(&actual))
                    .is_some_and(|value| bounds.contains(value))
            }),
            Self::Length(fields) => fields.iter().all(|(field, expected)| {
                target
                    .get_value(field)
                    .and_then(|actual| match actual {
                        JsonValue::String(text) => Some(text.chars().count()),
                        JsonValue::Array(items) => Some(items.len()),
                        JsonValue::Object(map) => Some(map.len()),
                        _ => None,
                    })
                    .is_some_and(|len| len == *expected)
            }),
            Self::And(conditions) => conditions.iter().all(|c| c.check(target)),
            Self::Or(conditions) => conditions.iter().any(|c| c.check(target)),
            Self::Not(condition) => !condition.check(target),
        }
    }
}

fn invalid(operator: &str, reason: &str) -> PipelineError {
    PipelineError::Condition(format!("{operator}: {reason}"))
}

fn fields<T>(
    operator: &str,
    args: &JsonValue,
    convert: impl Fn(&JsonValue) -> Option<T>,
) -> Result<Vec<(String, T)>> {
    let object = args
        .as_object()
        .filter(|object| !object.is_empty())
        .ok_or_else(|| invalid(operator, "expected a map of field to value"))?;

    object
        .iter()
        .map(|(field, value)| {
            convert(value)
                .map(|converted| (field.clone(), converted))
                .ok_or_else(|| invalid(operator, &format!("unsupported value for field '{field}'")))
        })
        .collect()
}

fn as_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(text) => Some(text.clone()),
        JsonValue::Number(number) => Some(number.to_string()),
        JsonValue::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(number) => number.as_f64(),
        JsonValue::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn parse_bounds(value: &JsonValue) -> Option<Bounds> {
    let object = value.as_object()?;
    let mut bounds = Bounds::default();
    for (key, bound) in object {
        let bound = as_number(bound)?;
        match key.as_str() {
            "gt" => bounds.gt = Some(bound),
            "gte" => bounds.gte = Some(bound),
            "lt" => bounds.lt = Some(bound),
            "lte" => bounds.lte = Some(bound),
            _ => return None,
        }
    }
    Some(bounds)
}

fn string_value(target: &dyn ConditionTarget, field: &str) -> Option<String> {
    target.get_value(field).as_ref().and_then(as_string)
}

/// Loose scalar equality: numbers compare by value, strings match the
/// textual form of numbers and booleans.
fn values_equal(actual: &JsonValue, expected: &JsonValue) -> bool {
    match (actual, expected) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64() == b.as_f64(),
        (JsonValue::String(text), other @ (JsonValue::Number(_) | JsonValue::Bool(_)))
        | (other @ (JsonValue::Number(_) | JsonValue::Bool(_)), JsonValue::String(text)) => {
            as_string(other).is_some_and(|other| other == *text)
        }
        _ => actual == expected,
    }
}

/// Looks `field` up in a parameter map.
///
/// The full key wins; otherwise the first dot-separated segment names the
/// parameter and the rest walks into its JSON value.
pub(crate) fn lookup_path(parameters: &BTreeMap<String, JsonValue>, field: &str) -> Option<JsonValue> {
    if let Some(value) = parameters.get(field) {
        return Some(value.clone());
    }

    let mut segments = field.split('.');
    let mut current = parameters.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}
