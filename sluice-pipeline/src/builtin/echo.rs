//! `echo` processor: logs a message

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::processor::Processor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EchoLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EchoConfig {
    #[serde(default)]
    pub message: String,

    #[serde(default = "default_repeat")]
    pub repeat: usize,

    #[serde(default)]
    pub level: EchoLevel,
}

fn default_repeat() -> usize {
    1
}

pub struct EchoProcessor {
    config: EchoConfig,
}

impl EchoProcessor {
    pub fn from_config(config: &JsonValue) -> anyhow::Result<Self> {
        let config: EchoConfig = serde_json::from_value(config.clone())
            .context("failed to parse the configuration of echo processor")?;
        Ok(Self { config })
    }
}

#[async_trait]
impl Processor for EchoProcessor {
    fn name(&self) -> &str {
        "echo"
    }

    async fn process(&self, ctx: &Context) -> anyhow::Result<()> {
        for _ in 0..self.config.repeat {
            if ctx.is_canceled() {
                break;
            }
            match self.config.level {
                EchoLevel::Debug => debug!("[{}] {}", ctx.name(), self.config.message),
                EchoLevel::Info => info!("[{}] {}", ctx.name(), self.config.message),
                EchoLevel::Warn => warn!("[{}] {}", ctx.name(), self.config.message),
                EchoLevel::Error => error!("[{}] {}", ctx.name(), self.config.message),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::register_builtins;
    use crate::error::PipelineError;
    use crate::registry::Registry;
    use serde_json::json;
    use sluice_core::domain::definition::PipelineDefinition;

    #[test]
    fn test_config_defaults() {
        let echo = EchoProcessor::from_config(&json!({"message": "hi"})).unwrap();
        assert_eq!(echo.config.repeat, 1);
        assert_eq!(echo.config.level, EchoLevel::Info);

        let loud = EchoProcessor::from_config(&json!({"level": "error"})).unwrap();
        assert_eq!(loud.config.level, EchoLevel::Error);

        assert!(EchoProcessor::from_config(&json!({"repeat": "many"})).is_err());
    }

    #[test]
    fn test_misspelled_option_is_rejected() {
        let mut registry = Registry::new();
        register_builtins(&mut registry).unwrap();
        let entry = json!({"echo": {"mesage": "x"}}).as_object().cloned().unwrap();

        let err = registry.resolve_processor(&entry).err().unwrap();
        assert_eq!(err, PipelineError::invalid_config("echo", "unexpected mesage option"));
    }

    #[tokio::test]
    async fn test_echo_stops_on_cancel() {
        let echo = EchoProcessor::from_config(&json!({"message": "hi", "repeat": 3})).unwrap();
        let ctx = Context::acquire(PipelineDefinition::new("echo"));
        ctx.cancel_task();
        echo.process(&ctx).await.unwrap();
    }
}
