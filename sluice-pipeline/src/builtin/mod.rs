//! Built-in processors

mod dag;
mod echo;

pub use dag::{DagConfig, DagProcessor};
pub use echo::{EchoConfig, EchoProcessor};

use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::check::{allowed_fields, require_fields};
use crate::error::Result;
use crate::processor::Processor;
use crate::registry::{Registry, checked_processor};

/// Registers `dag` and `echo`
pub fn register_builtins(registry: &mut Registry) -> Result<()> {
    registry.register_processor(
        "dag",
        checked_processor(
            |config: &JsonValue, registry: &Registry| -> anyhow::Result<Arc<dyn Processor>> {
                Ok(Arc::new(DagProcessor::from_config(config, registry)?))
            },
            vec![
                require_fields(&["parallel"]),
                allowed_fields(&["mode", "parallel", "join", "end", "on_failure", "pool"]),
            ],
        ),
    )?;
    registry.register_processor(
        "echo",
        checked_processor(
            |config: &JsonValue, _: &Registry| -> anyhow::Result<Arc<dyn Processor>> {
                Ok(Arc::new(EchoProcessor::from_config(config)?))
            },
            vec![allowed_fields(&["message", "repeat", "level"])],
        ),
    )?;
    Ok(())
}
