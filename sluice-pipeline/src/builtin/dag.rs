//! `dag` processor: fan-out/fan-in over nested chain entries
//!
//! ```json
//! {"dag": {
//!     "mode": "wait_all",
//!     "parallel": [{"echo": {"message": "a"}}, {"echo": {"message": "b"}}],
//!     "join": [{"echo": {"message": "after all"}}],
//!     "end": [{"echo": {"message": "parallel part done"}}],
//!     "pool": {"size": 4}
//! }}
//! ```

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sluice_core::domain::definition::ChainEntry;
use sluice_pool::PoolConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::context::Context;
use crate::dag::{Dag, JoinMode};
use crate::processor::Processor;
use crate::registry::Registry;

/// How long `close` waits for tasks left running by `first_win`
const DETACHED_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DagConfig {
    #[serde(default)]
    pub mode: JoinMode,

    /// Run concurrently
    #[serde(default)]
    pub parallel: Vec<ChainEntry>,

    /// Run in order once the parallel part has joined
    #[serde(default)]
    pub join: Vec<ChainEntry>,

    /// Completion hooks of the parallel part
    #[serde(default)]
    pub end: Vec<ChainEntry>,

    /// Runs when a parallel task fails or panics
    #[serde(default)]
    pub on_failure: Vec<ChainEntry>,

    /// Dedicated worker pool for the parallel part
    #[serde(default)]
    pub pool: Option<PoolConfig>,
}

pub struct DagProcessor {
    dag: Dag,
}

impl DagProcessor {
    pub fn from_config(config: &JsonValue, registry: &Registry) -> anyhow::Result<Self> {
        let config: DagConfig = serde_json::from_value(config.clone())
            .context("failed to unpack the configuration of dag processor")?;

        if config.parallel.is_empty() {
            anyhow::bail!("parallel is not set");
        }

        let resolve = |entries: &[ChainEntry]| -> anyhow::Result<Vec<Arc<dyn Processor>>> {
            entries
                .iter()
                .map(|entry| registry.resolve_processor(entry).map_err(anyhow::Error::from))
                .collect()
        };

        let parallel = resolve(&config.parallel)?;
        let join = resolve(&config.join)?;
        let end = resolve(&config.end)?;
        let on_failure = registry.build_processors(&config.on_failure)?;

        let mut dag = Dag::new().with_mode(config.mode);
        if let Some(pool) = &config.pool {
            // the pool spawns its scavenger on construction
            if tokio::runtime::Handle::try_current().is_err() {
                anyhow::bail!("pool requires a running Tokio runtime");
            }
            dag = dag.with_pool(pool.build()?);
        }

        dag.spawns(parallel).on_complete(end);
        if !on_failure.is_empty() {
            dag.on_failure(Arc::new(on_failure));
        }
        if !join.is_empty() {
            dag.pipeline(join);
        }

        Ok(Self { dag })
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }
}

#[async_trait]
impl Processor for DagProcessor {
    fn name(&self) -> &str {
        "dag"
    }

    async fn process(&self, ctx: &Context) -> anyhow::Result<()> {
        self.dag.run(ctx).await?;
        debug!("dag of {} finished", ctx.name());
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        if !self.dag.detached().wait_idle(DETACHED_DRAIN_TIMEOUT).await {
            warn!(
                "Closing dag with {} detached task(s) still running",
                self.dag.detached().in_flight()
            );
        }
        if let Some(pool) = self.dag.pool() {
            pool.release();
        }
        self.dag.close().await;
        Ok(())
    }
}
