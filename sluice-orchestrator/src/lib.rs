//! Sluice Orchestrator
//!
//! Runs many named pipelines side by side inside a host process. Each
//! pipeline gets a dedicated supervising task that drives its context
//! through the lifecycle, retries failed runs, and enforces singleton
//! execution through a [`DistributedLock`].
//!
//! Definitions come from a [`DefinitionSource`]; the [`ConfigWatcher`] polls
//! it and hot-reloads the [`PipelineModule`] when it changes.

pub mod config;
pub mod error;
pub mod lock;
pub mod module;
pub mod source;
pub mod watcher;

pub use config::ModuleConfig;
pub use error::{OrchestratorError, Result};
pub use lock::{DistributedLock, InMemoryLock};
pub use module::{PipelineModule, ReloadReport};
pub use source::{DefinitionSource, JsonFileSource};
pub use watcher::ConfigWatcher;
