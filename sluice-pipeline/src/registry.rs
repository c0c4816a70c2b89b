//! Stage registry
//!
//! Maps action names to stage constructors and resolves declarative chain
//! entries into stages. A registry is an ordinary owned value: build one at
//! startup, register every plugin, then hand it to whoever builds chains.
//!
//! A chain entry carries exactly one action key:
//!
//! ```json
//! {"echo": {"message": "hello"}, "when": {"exists": ["user"]}}
//! ```
//!
//! Names are dot-separated namespaces. `{"elastic": {"bulk": {...}}}`
//! resolves to `elastic.bulk` when no `elastic` action exists.
//! An entry with an `if` key becomes a branch over its `then` and `else`
//! lists.

use serde_json::Value as JsonValue;
use sluice_core::domain::definition::ChainEntry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::chain::{Filters, Processors};
use crate::check::{ConfigCheck, run_checks};
use crate::condition::Condition;
use crate::conditional::{IfThenElseFilter, IfThenElseProcessor, WhenFilter, WhenProcessor};
use crate::error::{PipelineError, Result};
use crate::processor::{Filter, Processor};

/// Reserved key holding a stage's condition
pub const WHEN_KEY: &str = "when";

const IF_KEY: &str = "if";
const THEN_KEY: &str = "then";
const ELSE_KEY: &str = "else";

/// Builds a processor from its config. The registry is passed along so
/// composite stages can resolve nested chains.
pub type ProcessorConstructor =
    Arc<dyn Fn(&JsonValue, &Registry) -> anyhow::Result<Arc<dyn Processor>> + Send + Sync>;

/// Builds a filter from its config
pub type FilterConstructor =
    Arc<dyn Fn(&JsonValue, &Registry) -> anyhow::Result<Arc<dyn Filter>> + Send + Sync>;

/// Wraps a processor constructor so `checks` run against the config first
pub fn checked_processor<F>(
    constructor: F,
    checks: Vec<ConfigCheck>,
) -> impl Fn(&JsonValue, &Registry) -> anyhow::Result<Arc<dyn Processor>> + Send + Sync + 'static
where
    F: Fn(&JsonValue, &Registry) -> anyhow::Result<Arc<dyn Processor>> + Send + Sync + 'static,
{
    move |config: &JsonValue, registry: &Registry| {
        run_checks(&checks, config)?;
        constructor(config, registry)
    }
}

/// Wraps a filter constructor so `checks` run against the config first
pub fn checked_filter<F>(
    constructor: F,
    checks: Vec<ConfigCheck>,
) -> impl Fn(&JsonValue, &Registry) -> anyhow::Result<Arc<dyn Filter>> + Send + Sync + 'static
where
    F: Fn(&JsonValue, &Registry) -> anyhow::Result<Arc<dyn Filter>> + Send + Sync + 'static,
{
    move |config: &JsonValue, registry: &Registry| {
        run_checks(&checks, config)?;
        constructor(config, registry)
    }
}

/// Catalog of stage constructors
#[derive(Clone, Default)]
pub struct Registry {
    processors: HashMap<String, ProcessorConstructor>,
    filters: HashMap<String, FilterConstructor>,
}

/// Registration handle scoped to a name prefix
pub struct Namespace<'a> {
    registry: &'a mut Registry,
    prefix: String,
}

/// An action located in a chain entry
struct Action<'a> {
    name: String,
    config: &'a JsonValue,
    when: Option<&'a JsonValue>,
}

impl Registry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a processor constructor
    ///
    /// # Errors
    /// `DuplicateName` if `name` is already bound, `InvalidName` for empty
    /// names or empty namespace segments
    pub fn register_processor<F>(&mut self, name: &str, constructor: F) -> Result<()>
    where
        F: Fn(&JsonValue, &Registry) -> anyhow::Result<Arc<dyn Processor>> + Send + Sync + 'static,
    {
        validate_name(name)?;
        if self.processors.contains_key(name) {
            return Err(PipelineError::DuplicateName(name.to_string()));
        }
        self.processors.insert(name.to_string(), Arc::new(constructor));
        debug!("Registered processor {}", name);
        Ok(())
    }

    /// Registers a filter constructor
    pub fn register_filter<F>(&mut self, name: &str, constructor: F) -> Result<()>
    where
        F: Fn(&JsonValue, &Registry) -> anyhow::Result<Arc<dyn Filter>> + Send + Sync + 'static,
    {
        validate_name(name)?;
        if self.filters.contains_key(name) {
            return Err(PipelineError::DuplicateName(name.to_string()));
        }
        self.filters.insert(name.to_string(), Arc::new(constructor));
        debug!("Registered filter {}", name);
        Ok(())
    }

    /// Returns a handle registering under `prefix.`
    pub fn namespace(&mut self, prefix: &str) -> Namespace<'_> {
        Namespace {
            registry: self,
            prefix: prefix.to_string(),
        }
    }

    pub fn has_processor(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    /// Sorted processor names
    pub fn processor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted filter names
    pub fn filter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.filters.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolves one chain entry into a processor
    pub fn resolve_processor(&self, entry: &ChainEntry) -> Result<Arc<dyn Processor>> {
        if let Some(condition) = entry.get(IF_KEY) {
            let condition = Condition::parse(condition)?;
            let then = self.build_processors(&branch(entry, THEN_KEY)?)?;
            let otherwise = self.build_processors(&branch(entry, ELSE_KEY)?)?;
            return Ok(Arc::new(IfThenElseProcessor::new(condition, then, otherwise)));
        }

        let action = locate(entry, |name| self.processors.contains_key(name))?;
        let constructor = self.processors.get(&action.name).ok_or_else(|| {
            PipelineError::UnknownProcessor {
                name: action.name.clone(),
                valid: self.processor_names(),
            }
        })?;

        let config = strip_when(action.config);
        let stage = constructor(&config, self)
            .map_err(|e| PipelineError::invalid_config(&action.name, format!("{e:#}")))?;

        match action.when {
            Some(when) => Ok(Arc::new(WhenProcessor::new(stage, Condition::parse(when)?))),
            None => Ok(stage),
        }
    }

    /// Resolves one chain entry into a filter
    pub fn resolve_filter(&self, entry: &ChainEntry) -> Result<Arc<dyn Filter>> {
        if let Some(condition) = entry.get(IF_KEY) {
            let condition = Condition::parse(condition)?;
            let then = self.build_filters(&branch(entry, THEN_KEY)?)?;
            let otherwise = self.build_filters(&branch(entry, ELSE_KEY)?)?;
            return Ok(Arc::new(IfThenElseFilter::new(condition, then, otherwise)));
        }

        let action = locate(entry, |name| self.filters.contains_key(name))?;
        let constructor = self.filters.get(&action.name).ok_or_else(|| {
            PipelineError::UnknownProcessor {
                name: action.name.clone(),
                valid: self.filter_names(),
            }
        })?;

        let config = strip_when(action.config);
        let stage = constructor(&config, self)
            .map_err(|e| PipelineError::invalid_config(&action.name, format!("{e:#}")))?;

        match action.when {
            Some(when) => Ok(Arc::new(WhenFilter::new(stage, Condition::parse(when)?))),
            None => Ok(stage),
        }
    }

    /// Builds a processor chain. The first bad entry fails the whole chain.
    pub fn build_processors(&self, entries: &[ChainEntry]) -> Result<Processors> {
        entries
            .iter()
            .map(|entry| self.resolve_processor(entry))
            .collect::<Result<Vec<_>>>()
            .map(Processors::new)
    }

    /// Builds a filter chain
    pub fn build_filters(&self, entries: &[ChainEntry]) -> Result<Filters> {
        entries
            .iter()
            .map(|entry| self.resolve_filter(entry))
            .collect::<Result<Vec<_>>>()
            .map(Filters::new)
    }
}

impl Namespace<'_> {
    fn qualify(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }

    pub fn register_processor<F>(&mut self, name: &str, constructor: F) -> Result<()>
    where
        F: Fn(&JsonValue, &Registry) -> anyhow::Result<Arc<dyn Processor>> + Send + Sync + 'static,
    {
        let name = self.qualify(name);
        self.registry.register_processor(&name, constructor)
    }

    pub fn register_filter<F>(&mut self, name: &str, constructor: F) -> Result<()>
    where
        F: Fn(&JsonValue, &Registry) -> anyhow::Result<Arc<dyn Filter>> + Send + Sync + 'static,
    {
        let name = self.qualify(name);
        self.registry.register_filter(&name, constructor)
    }

    /// Nested namespace, e.g. `a` then `b` registers under `a.b.`
    pub fn namespace(&mut self, child: &str) -> Namespace<'_> {
        let prefix = self.qualify(child);
        Namespace {
            registry: &mut *self.registry,
            prefix,
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.split('.').any(str::is_empty) {
        return Err(PipelineError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Finds the single action of an entry, descending into nested namespaces
/// when the flat name is not registered.
fn locate<'a>(entry: &'a ChainEntry, is_registered: impl Fn(&str) -> bool) -> Result<Action<'a>> {
    let actions: Vec<&String> = entry.keys().filter(|key| *key != WHEN_KEY).collect();

    let (name, mut config) = match actions.as_slice() {
        [] => return Err(PipelineError::NoActionConfigured),
        [name] => ((*name).clone(), &entry[name.as_str()]),
        many => {
            return Err(PipelineError::AmbiguousAction {
                count: many.len(),
                actions: many.iter().map(|name| (*name).clone()).collect(),
            });
        }
    };

    let mut name = name;
    while !is_registered(&name) {
        let Some(object) = config.as_object() else {
            break;
        };
        let mut children = object.iter().filter(|(key, _)| *key != WHEN_KEY);
        let (Some((child, child_config)), None) = (children.next(), children.next()) else {
            break;
        };
        if !child_config.is_object() {
            break;
        }
        name = format!("{name}.{child}");
        config = child_config;
    }

    let when = entry
        .get(WHEN_KEY)
        .or_else(|| config.as_object().and_then(|object| object.get(WHEN_KEY)));

    Ok(Action { name, config, when })
}

/// Copy of `config` without an embedded `when` section
fn strip_when(config: &JsonValue) -> JsonValue {
    match config {
        JsonValue::Object(object) if object.contains_key(WHEN_KEY) => {
            let mut object = object.clone();
            object.remove(WHEN_KEY);
            JsonValue::Object(object)
        }
        other => other.clone(),
    }
}

/// Reads the `then`/`else` list of an `if` entry; a missing list is empty
fn branch(entry: &ChainEntry, key: &str) -> Result<Vec<ChainEntry>> {
    let Some(value) = entry.get(key) else {
        return Ok(Vec::new());
    };
    let items = value
        .as_array()
        .ok_or_else(|| PipelineError::invalid_config(IF_KEY, format!("'{key}' must be a list")))?;

    items
        .iter()
        .map(|item| {
            item.as_object().cloned().ok_or_else(|| {
                PipelineError::invalid_config(IF_KEY, format!("'{key}' entries must be objects"))
            })
        })
        .collect()
}
