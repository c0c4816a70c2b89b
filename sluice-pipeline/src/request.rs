//! Request-scoped context for filter chains

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::condition::{ConditionTarget, lookup_path};

/// State carried through one pass of a [`crate::Filters`] chain
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    parameters: BTreeMap<String, JsonValue>,
    flow: Vec<String>,
    finished: bool,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: JsonValue) {
        self.parameters.insert(key.into(), value);
    }

    pub fn get_param(&self, key: &str) -> Option<JsonValue> {
        lookup_path(&self.parameters, key)
    }

    pub fn add_flow_process(&mut self, name: impl Into<String>) {
        self.flow.push(name.into());
    }

    pub fn flow_process(&self) -> &[String] {
        &self.flow
    }

    /// Stops the remaining filters of the chain
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn should_continue(&self) -> bool {
        !self.finished
    }
}

impl ConditionTarget for RequestContext {
    fn get_value(&self, field: &str) -> Option<JsonValue> {
        self.get_param(field)
    }
}
