//! Pipeline definition types

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;

/// One declarative chain entry: an action name mapped to its config,
/// optionally next to a reserved `when` (or `if`/`then`/`else`) section.
pub type ChainEntry = serde_json::Map<String, JsonValue>;

/// Delay between runs of a `keep_running` pipeline when none is configured
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Singleton lock TTL when `max_running_in_ms` is not configured
pub const DEFAULT_MAX_RUNNING: Duration = Duration::from_secs(60);

/// Pipeline definition
///
/// Immutable once loaded. A reload replaces definitions wholesale, and
/// [`PipelineDefinition::same_as`] decides whether a running pipeline has
/// to be rebuilt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub auto_start: bool,

    #[serde(default)]
    pub keep_running: bool,

    #[serde(default)]
    pub retry_delay_in_ms: u64,

    #[serde(default)]
    pub singleton: bool,

    #[serde(default)]
    pub max_running_in_ms: u64,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default, rename = "processor")]
    pub processors: Vec<ChainEntry>,

    #[serde(default)]
    pub labels: HashMap<String, JsonValue>,

    /// Created at runtime rather than loaded from the definitions file.
    /// Transient pipelines survive a reload untouched.
    #[serde(skip)]
    pub transient: bool,
}

/// Lifecycle logging switch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl PipelineDefinition {
    /// Creates an enabled definition with no stages
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: None,
            auto_start: false,
            keep_running: false,
            retry_delay_in_ms: 0,
            singleton: false,
            max_running_in_ms: 0,
            logging: LoggingConfig::default(),
            processors: Vec::new(),
            labels: HashMap::new(),
            transient: false,
        }
    }

    /// Appends a chain entry
    pub fn with_processor(mut self, entry: JsonValue) -> Self {
        if let JsonValue::Object(map) = entry {
            self.processors.push(map);
        }
        self
    }

    /// A missing `enabled` flag means enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Delay between two runs of a `keep_running` pipeline
    pub fn retry_delay(&self) -> Duration {
        if self.retry_delay_in_ms == 0 {
            DEFAULT_RETRY_DELAY
        } else {
            Duration::from_millis(self.retry_delay_in_ms)
        }
    }

    /// TTL used for the singleton lock
    pub fn max_running_duration(&self) -> Duration {
        if self.max_running_in_ms == 0 {
            DEFAULT_MAX_RUNNING
        } else {
            Duration::from_millis(self.max_running_in_ms)
        }
    }

    /// Structural equality used by hot reload.
    ///
    /// Labels and the transient flag do not force a rebuild. Chain entries are
    /// compared as JSON values, so key order inside an entry is irrelevant.
    pub fn same_as(&self, other: &PipelineDefinition) -> bool {
        self.name == other.name
            && self.is_enabled() == other.is_enabled()
            && self.auto_start == other.auto_start
            && self.keep_running == other.keep_running
            && self.retry_delay() == other.retry_delay()
            && self.singleton == other.singleton
            && self.max_running_duration() == other.max_running_duration()
            && self.logging == other.logging
            && self.processors == other.processors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_from_minimal_json() {
        let def: PipelineDefinition = serde_json::from_value(json!({
            "name": "ingest",
            "processor": [{"echo": {"message": "hi"}}]
        }))
        .unwrap();

        assert!(def.is_enabled());
        assert!(!def.auto_start);
        assert_eq!(def.retry_delay(), Duration::from_millis(1000));
        assert_eq!(def.max_running_duration(), Duration::from_secs(60));
        assert_eq!(def.processors.len(), 1);
        assert!(!def.transient);
    }

    #[test]
    fn test_disabled() {
        let def: PipelineDefinition =
            serde_json::from_value(json!({"name": "x", "enabled": false})).unwrap();
        assert!(!def.is_enabled());
    }

    #[test]
    fn test_same_as_ignores_key_order_and_labels() {
        let a: PipelineDefinition = serde_json::from_value(json!({
            "name": "a",
            "keep_running": true,
            "processor": [{"echo": {"message": "hi", "repeat": 2}}],
            "labels": {"team": "search"}
        }))
        .unwrap();
        let b: PipelineDefinition = serde_json::from_value(json!({
            "name": "a",
            "keep_running": true,
            "processor": [{"echo": {"repeat": 2, "message": "hi"}}]
        }))
        .unwrap();

        assert!(a.same_as(&b));
    }

    #[test]
    fn test_same_as_detects_changes() {
        let a = PipelineDefinition::new("a").with_processor(json!({"echo": {"message": "1"}}));
        let b = PipelineDefinition::new("a").with_processor(json!({"echo": {"message": "2"}}));
        assert!(!a.same_as(&b));

        let mut c = a.clone();
        c.retry_delay_in_ms = 1000;
        // zero falls back to the same default delay
        assert!(a.same_as(&c));

        c.keep_running = true;
        assert!(!a.same_as(&c));
    }
}
