//! Pipeline module
//!
//! Owns the named pipelines of a process. Every pipeline is a [`Context`]
//! plus a [`Processors`] chain driven by one supervising task:
//!
//! - `STARTING`: take the singleton lock if needed, run the chain, record
//!   the outcome as `FINISHED` or `FAILED`
//! - `FINISHED` / `FAILED`: wait `retry_delay` and start again when
//!   `keep_running`, otherwise settle in `STOPPED`
//! - `STOPPED`: park on the pause gate until started or deleted
//! - `STOPPING`: settle in `STOPPED`, or go back to `STARTING` when the
//!   pipeline was started again while the stop was in flight
//!
//! Operator calls (`start_task`, `stop_task`, `delete_task`) only flip
//! context state; the supervising task does the work. Hot reload and
//! shutdown stop pipelines cooperatively and wait for their loops to exit,
//! bounded by a timeout.

use sluice_core::domain::definition::PipelineDefinition;
use sluice_core::domain::state::RunningState;
use sluice_core::dto::status::PipelineStatus;
use sluice_pipeline::{Context, Processors, Registry};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ModuleConfig;
use crate::error::{OrchestratorError, Result};
use crate::lock::DistributedLock;

/// Poll period while waiting for supervising loops to exit
const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a hot reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Removed or changed pipelines that were stopped and deleted
    pub stopped: Vec<String>,
    /// New or changed pipelines that were created
    pub created: Vec<String>,
    /// Definitions whose chain could not be built
    pub failed: Vec<String>,
}

impl ReloadReport {
    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty() && self.created.is_empty() && self.failed.is_empty()
    }
}

struct Slot {
    definition: PipelineDefinition,
    /// `None` while the chain is being built
    context: Option<Context>,
}

/// Lifecycle manager for many named pipelines
#[derive(Clone)]
pub struct PipelineModule {
    inner: Arc<ModuleInner>,
}

struct ModuleInner {
    config: ModuleConfig,
    registry: Registry,
    lock: Arc<dyn DistributedLock>,
    slots: Mutex<HashMap<String, Slot>>,
    shutdown: CancellationToken,
}

impl PipelineModule {
    pub fn new(config: ModuleConfig, registry: Registry, lock: Arc<dyn DistributedLock>) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                config,
                registry,
                lock,
                slots: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.inner.config
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates every definition, stopping at the first chain that fails to
    /// build. Returns how many pipelines were created.
    pub fn start(&self, definitions: Vec<PipelineDefinition>) -> Result<usize> {
        let mut created = 0;
        for definition in definitions {
            if self.create_pipeline(definition)? {
                created += 1;
            }
        }
        info!("Pipeline module started with {} pipeline(s)", created);
        Ok(created)
    }

    /// Builds the chain of `definition` and spawns its supervising task.
    ///
    /// Disabled definitions and names that already exist are skipped and
    /// reported as `Ok(false)`.
    pub fn create_pipeline(&self, definition: PipelineDefinition) -> Result<bool> {
        if self.inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        if !definition.is_enabled() {
            debug!("Pipeline {} is disabled", definition.name);
            return Ok(false);
        }

        let name = definition.name.clone();
        match self.slots().entry(name.clone()) {
            Entry::Occupied(_) => {
                debug!("Pipeline {} already exists", name);
                return Ok(false);
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot {
                    definition: definition.clone(),
                    context: None,
                });
            }
        }

        let chain = match self.inner.registry.build_processors(&definition.processors) {
            Ok(chain) => Arc::new(chain),
            Err(e) => {
                self.slots().remove(&name);
                error!("Failed to build pipeline {}: {}", name, e);
                return Err(e.into());
            }
        };

        let auto_start = definition.auto_start;
        let stages = chain.len();
        let ctx = Context::acquire(definition);
        {
            let mut slots = self.slots();
            match slots.get_mut(&name) {
                Some(slot) if slot.context.is_none() => slot.context = Some(ctx.clone()),
                _ => {
                    debug!("Pipeline {} was deleted while being created", name);
                    ctx.release();
                    tokio::spawn(async move { chain.close().await });
                    return Ok(false);
                }
            }
        }

        if auto_start {
            ctx.starting();
        }

        let supervisor = Supervisor {
            ctx,
            chain,
            lock: Arc::clone(&self.inner.lock),
            node_id: self.inner.config.node_id.clone(),
            lock_domain: self.inner.config.lock_domain.clone(),
            shutdown: self.inner.shutdown.clone(),
            holds_lock: false,
        };
        tokio::spawn(supervisor.run());

        info!("Created pipeline {} ({} stage(s))", name, stages);
        Ok(true)
    }

    /// Creates a pipeline that hot reload leaves alone
    pub fn create_transient(&self, mut definition: PipelineDefinition) -> Result<bool> {
        definition.transient = true;
        self.create_pipeline(definition)
    }

    /// Context of a live pipeline
    pub fn context(&self, name: &str) -> Result<Context> {
        self.slots()
            .get(name)
            .and_then(|slot| slot.context.clone())
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots().contains_key(name)
    }

    /// Starts (or restarts) a pipeline and wakes its supervising task
    pub fn start_task(&self, name: &str) -> Result<()> {
        let ctx = self.context(name)?;
        if ctx.is_exit() {
            ctx.restart();
        }
        if ctx.running_state() != RunningState::Started {
            ctx.starting();
        }
        ctx.resume();
        info!("Started pipeline {}", name);
        Ok(())
    }

    /// Asks a pipeline to stop. Stages observe the cancellation
    /// cooperatively; the pipeline will not restart by itself.
    pub fn stop_task(&self, name: &str) -> Result<()> {
        let ctx = self.context(name)?;
        ctx.exit();
        ctx.stopping();
        ctx.cancel_task();
        info!("Stopping pipeline {}", name);
        Ok(())
    }

    /// Removes a pipeline and releases its context. Unknown names are
    /// ignored.
    pub fn delete_task(&self, name: &str) {
        if let Some(ctx) = self.take(name) {
            ctx.release();
            info!("Deleted pipeline {}", name);
        }
    }

    /// Deletes a pipeline that is not running
    pub fn delete_pipeline(&self, name: &str) -> Result<()> {
        let ctx = self.context(name)?;
        if ctx.running_state().is_active() {
            return Err(OrchestratorError::StillRunning(name.to_string()));
        }
        self.delete_task(name);
        Ok(())
    }

    fn take(&self, name: &str) -> Option<Context> {
        self.slots().remove(name).and_then(|slot| slot.context)
    }

    /// Status snapshots of every live pipeline, sorted by name
    pub fn list_pipelines(&self) -> Vec<PipelineStatus> {
        let contexts: Vec<Context> = self
            .slots()
            .values()
            .filter_map(|slot| slot.context.clone())
            .collect();

        let mut statuses: Vec<PipelineStatus> = contexts.iter().map(Context::status).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn get_pipeline(&self, name: &str) -> Result<PipelineStatus> {
        self.context(name).map(|ctx| ctx.status())
    }

    /// Reconciles the live pipelines with a fresh definition set.
    ///
    /// Removed and changed pipelines are stopped and deleted first, then the
    /// new and changed ones are created. Transient pipelines are never
    /// touched, and unchanged ones keep their context.
    pub async fn reload(&self, definitions: Vec<PipelineDefinition>) -> ReloadReport {
        let wanted: HashMap<String, PipelineDefinition> = definitions
            .into_iter()
            .filter(|definition| definition.is_enabled())
            .map(|definition| (definition.name.clone(), definition))
            .collect();

        let (mut retired, mut additions) = {
            let slots = self.slots();

            let retired: Vec<String> = slots
                .iter()
                .filter(|(_, slot)| !slot.definition.transient)
                .filter(|(name, slot)| match wanted.get(name.as_str()) {
                    Some(definition) => !definition.same_as(&slot.definition),
                    None => true,
                })
                .map(|(name, _)| name.clone())
                .collect();

            let additions: Vec<PipelineDefinition> = wanted
                .values()
                .filter(|definition| {
                    !slots.contains_key(&definition.name) || retired.contains(&definition.name)
                })
                .cloned()
                .collect();

            (retired, additions)
        };

        let mut report = ReloadReport::default();
        if retired.is_empty() && additions.is_empty() {
            debug!("Pipeline definitions unchanged");
            return report;
        }

        retired.sort();
        additions.sort_by(|a, b| a.name.cmp(&b.name));
        info!(
            "Reloading pipelines: {} to stop, {} to create",
            retired.len(),
            additions.len()
        );

        let pending = self.retire(&retired, self.inner.config.reload_timeout).await;
        if !pending.is_empty() {
            error!(
                "Pipelines {} did not stop within {:?}, continuing reload",
                pending.join(", "),
                self.inner.config.reload_timeout
            );
        }
        report.stopped = retired;

        for definition in additions {
            let name = definition.name.clone();
            match self.create_pipeline(definition) {
                Ok(true) => report.created.push(name),
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to create pipeline {} during reload: {}", name, e);
                    report.failed.push(name);
                }
            }
        }

        info!(
            "Reload done: stopped [{}], created [{}], failed [{}]",
            report.stopped.join(", "),
            report.created.join(", "),
            report.failed.join(", ")
        );
        report
    }

    /// Stops every pipeline and waits for the supervising tasks to exit,
    /// bounded by `shutdown_timeout`
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.cancel();

        let names: Vec<String> = self.slots().keys().cloned().collect();
        info!("Shutting down {} pipeline(s)", names.len());

        let pending = self.retire(&names, self.inner.config.shutdown_timeout).await;
        if pending.is_empty() {
            info!("Pipeline module stopped");
            Ok(())
        } else {
            error!(
                "Pipelines {} did not stop within {:?}",
                pending.join(", "),
                self.inner.config.shutdown_timeout
            );
            Err(OrchestratorError::ShutdownTimeout(pending))
        }
    }

    /// Stops, deletes and waits for the given pipelines. Returns the names
    /// whose loops were still running at the deadline.
    async fn retire(&self, names: &[String], timeout: Duration) -> Vec<String> {
        let mut contexts = Vec::with_capacity(names.len());
        for name in names {
            if self.stop_task(name).is_err() {
                trace!("Pipeline {} has no context yet", name);
            }
            if let Some(ctx) = self.take(name) {
                ctx.release();
                contexts.push(ctx);
            }
        }
        wait_loops_released(&contexts, timeout).await
    }
}

async fn wait_loops_released(contexts: &[Context], timeout: Duration) -> Vec<String> {
    let deadline = Instant::now() + timeout;
    loop {
        let pending: Vec<String> = contexts
            .iter()
            .filter(|ctx| !ctx.is_loop_released())
            .map(|ctx| ctx.name().to_string())
            .collect();

        if pending.is_empty() || Instant::now() >= deadline {
            return pending;
        }
        time::sleep(RELEASE_POLL_INTERVAL).await;
    }
}

/// Supervising task of one pipeline
struct Supervisor {
    ctx: Context,
    chain: Arc<Processors>,
    lock: Arc<dyn DistributedLock>,
    node_id: String,
    lock_domain: String,
    shutdown: CancellationToken,
    holds_lock: bool,
}

impl Supervisor {
    async fn run(mut self) {
        let ctx = self.ctx.clone();
        debug!("Supervising pipeline {}", ctx.name());

        while !self.shutdown.is_cancelled() && !ctx.is_released() {
            match ctx.running_state() {
                RunningState::Starting => self.run_once().await,
                RunningState::Finished | RunningState::Failed => self.after_run().await,
                RunningState::Stopped => {
                    ctx.pause_if(RunningState::Stopped).await;
                }
                RunningState::Stopping => {
                    debug!("Pipeline {} was stopped before its run began", ctx.name());
                    self.settle_stop();
                }
                RunningState::Started => {
                    error!(
                        "Supervising loop of pipeline {} observed STARTED outside a run",
                        ctx.name()
                    );
                    ctx.failed("supervising loop observed an unexpected STARTED state");
                }
            }
        }

        self.chain.close().await;
        if self.holds_lock {
            if let Err(e) = self
                .lock
                .release(&self.lock_domain, ctx.name(), &self.node_id)
                .await
            {
                warn!("Failed to release lock of pipeline {}: {}", ctx.name(), e);
            }
        }
        ctx.set_loop_released();
        debug!("Supervising loop of pipeline {} exited", ctx.name());
    }

    async fn run_once(&mut self) {
        let ctx = self.ctx.clone();

        if ctx.definition().singleton && !self.acquire_lock().await {
            ctx.finished();
            return;
        }

        ctx.reset_context();
        ctx.started();
        if ctx.running_state() != RunningState::Started {
            // stopped between STARTING and STARTED
            return;
        }

        let renewal = self.holds_lock.then(|| self.spawn_renewal());
        let result = self.chain.process_guarded(&ctx).await;
        if let Some((token, handle)) = renewal {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Lock renewal of pipeline {} panicked: {}", ctx.name(), e);
            }
        }

        match result {
            Err(e) if ctx.running_state() == RunningState::Stopping => {
                debug!("Pipeline {} stopped: {:#}", ctx.name(), e);
                self.settle_stop();
            }
            Err(e) => {
                warn!("Pipeline {} failed: {:#}", ctx.name(), e);
                ctx.failed(e);
            }
            Ok(()) => match ctx.running_state() {
                RunningState::Stopping => self.settle_stop(),
                RunningState::Started => ctx.finished(),
                _ => {}
            },
        }
    }

    /// Completes a stop. A start requested while the stop was in flight
    /// clears the exit flag, in which case the pipeline goes straight back
    /// to STARTING.
    fn settle_stop(&self) {
        let ctx = &self.ctx;
        ctx.stopped();
        if !ctx.is_exit() {
            info!("Pipeline {} restarts after stop", ctx.name());
            ctx.starting();
        }
    }

    async fn after_run(&self) {
        let ctx = &self.ctx;
        let definition = ctx.definition();

        if definition.keep_running && !ctx.is_exit() {
            let delay = definition.retry_delay();
            debug!("Pipeline {} runs again in {:?}", ctx.name(), delay);
            tokio::select! {
                _ = time::sleep(delay) => {
                    if !ctx.is_exit() {
                        ctx.starting();
                    }
                }
                _ = ctx.wait_released() => {}
                _ = self.shutdown.cancelled() => {}
            }
        } else {
            ctx.stopped();
        }
    }

    /// Takes or renews the singleton lock. Losing it to another node is
    /// not an error.
    async fn acquire_lock(&mut self) -> bool {
        let ttl = self.ctx.definition().max_running_duration();
        match self
            .lock
            .hold(&self.lock_domain, self.ctx.name(), &self.node_id, ttl, true)
            .await
        {
            Ok(true) => {
                if !self.holds_lock {
                    info!("Pipeline {} acquired its singleton lock", self.ctx.name());
                }
                self.holds_lock = true;
                true
            }
            Ok(false) => {
                debug!("Pipeline {} is running on another node", self.ctx.name());
                self.holds_lock = false;
                false
            }
            Err(e) => {
                warn!("Failed to acquire lock of pipeline {}: {}", self.ctx.name(), e);
                false
            }
        }
    }

    /// Keeps the singleton lease alive while a run lasts
    fn spawn_renewal(&self) -> (CancellationToken, JoinHandle<()>) {
        let token = self.shutdown.child_token();
        let stop = token.clone();
        let lock = Arc::clone(&self.lock);
        let domain = self.lock_domain.clone();
        let key = self.ctx.name().to_string();
        let holder = self.node_id.clone();
        let ttl = self.ctx.definition().max_running_duration();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(ttl / 2);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match lock.hold(&domain, &key, &holder, ttl, true).await {
                            Ok(true) => trace!("Renewed lock of pipeline {}", key),
                            Ok(false) => {
                                warn!("Pipeline {} lost its singleton lock", key);
                                break;
                            }
                            Err(e) => warn!("Failed to renew lock of pipeline {}: {}", key, e),
                        }
                    }
                }
            }
        });

        (token, handle)
    }
}
