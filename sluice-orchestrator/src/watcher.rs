//! Definitions watcher
//!
//! Polls the [`DefinitionSource`] version every `interval` and hot-reloads
//! the module when it changes. A definitions file that fails to parse is
//! logged and retried on the next tick; the running pipelines are kept.

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::module::{PipelineModule, ReloadReport};
use crate::source::DefinitionSource;

pub struct ConfigWatcher {
    source: Arc<dyn DefinitionSource>,
    module: PipelineModule,
    interval: Duration,
    last_version: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Creates a watcher that considers the current source version as
    /// already applied
    pub async fn new(
        source: Arc<dyn DefinitionSource>,
        module: PipelineModule,
        interval: Duration,
    ) -> Self {
        let last_version = match source.version().await {
            Ok(version) => version,
            Err(e) => {
                warn!("Failed to read definitions version: {:#}", e);
                None
            }
        };
        Self {
            source,
            module,
            interval,
            last_version,
        }
    }

    /// Checks the source once, reloading the module when it changed
    pub async fn poll_once(&mut self) -> anyhow::Result<Option<ReloadReport>> {
        let version = self.source.version().await?;
        if version == self.last_version {
            return Ok(None);
        }

        if version.is_none() {
            warn!("Pipeline definitions disappeared, keeping the running pipelines");
            self.last_version = None;
            return Ok(None);
        }

        let definitions = self.source.load().await?;
        self.last_version = version;
        info!("Pipeline definitions changed, reloading {} definition(s)", definitions.len());

        Ok(Some(self.module.reload(definitions).await))
    }

    /// Polls until `token` is cancelled
    pub async fn run(mut self, token: CancellationToken) {
        info!("Watching pipeline definitions every {:?}", self.interval);

        let mut ticker = time::interval(self.interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => match self.poll_once().await {
                    Ok(Some(report)) => debug!("Reload report: {:?}", report),
                    Ok(None) => trace!("Pipeline definitions unchanged"),
                    Err(e) => error!("Failed to reload pipeline definitions: {:#}", e),
                },
            }
        }

        debug!("Definitions watcher stopped");
    }
}
