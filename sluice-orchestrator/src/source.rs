//! Definition sources

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use sluice_core::domain::definition::PipelineDefinition;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Where pipeline definitions come from
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Reads the full definition set
    async fn load(&self) -> anyhow::Result<Vec<PipelineDefinition>>;

    /// Marker that changes whenever the definitions may have changed
    async fn version(&self) -> anyhow::Result<Option<SystemTime>>;
}

/// Top level of a definitions file
#[derive(Deserialize)]
#[serde(untagged)]
enum DefinitionsFile {
    List(Vec<PipelineDefinition>),
    Section { pipeline: Vec<PipelineDefinition> },
}

/// Definitions stored in a JSON file.
///
/// Accepts either a bare array or `{"pipeline": [...]}`.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parses a definitions document, rejecting duplicate names
pub fn parse_definitions(content: &str) -> anyhow::Result<Vec<PipelineDefinition>> {
    let definitions = match serde_json::from_str(content)? {
        DefinitionsFile::List(list) => list,
        DefinitionsFile::Section { pipeline } => pipeline,
    };

    let mut names = HashSet::new();
    for definition in &definitions {
        if definition.name.is_empty() {
            anyhow::bail!("pipeline name cannot be empty");
        }
        if !names.insert(definition.name.as_str()) {
            anyhow::bail!("pipeline {} is defined more than once", definition.name);
        }
    }

    Ok(definitions)
}

#[async_trait]
impl DefinitionSource for JsonFileSource {
    async fn load(&self) -> anyhow::Result<Vec<PipelineDefinition>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        parse_definitions(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    async fn version(&self) -> anyhow::Result<Option<SystemTime>> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => Ok(Some(metadata.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", self.path.display())),
        }
    }
}
