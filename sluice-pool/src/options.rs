//! Pool options

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PoolError, Result};
use crate::pool::Pool;

/// Receives the message of a panic trapped in a worker
pub type PanicHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Runtime options of a [`Pool`]
#[derive(Clone, Default)]
pub struct PoolOptions {
    /// Scavenger period and idle lifetime of a worker. Zero means default.
    pub expiry_duration: Duration,

    /// Allocate the idle queue up front. Requires a bounded pool.
    pub pre_alloc: bool,

    /// Maximum number of submitters allowed to wait. Zero means no limit.
    pub max_blocking_tasks: usize,

    /// Fail with [`PoolError::Overload`] instead of waiting for a worker
    pub nonblocking: bool,

    /// Called when a task panics. Without one the panic is logged.
    pub panic_handler: Option<PanicHandler>,
}

impl PoolOptions {
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry_duration = expiry;
        self
    }

    pub fn with_pre_alloc(mut self, pre_alloc: bool) -> Self {
        self.pre_alloc = pre_alloc;
        self
    }

    pub fn with_max_blocking_tasks(mut self, max: usize) -> Self {
        self.max_blocking_tasks = max;
        self
    }

    pub fn with_nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    pub fn with_panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.panic_handler = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("expiry_duration", &self.expiry_duration)
            .field("pre_alloc", &self.pre_alloc)
            .field("max_blocking_tasks", &self.max_blocking_tasks)
            .field("nonblocking", &self.nonblocking)
            .field("panic_handler", &self.panic_handler.is_some())
            .finish()
    }
}

/// Declarative pool settings, as found in a processor config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Capacity; zero or negative means unbounded
    #[serde(default)]
    pub size: isize,

    #[serde(default)]
    pub expiry_in_ms: i64,

    #[serde(default)]
    pub pre_alloc: bool,

    #[serde(default)]
    pub max_blocking_tasks: usize,

    #[serde(default)]
    pub nonblocking: bool,
}

impl PoolConfig {
    /// Converts the settings into options
    pub fn options(&self) -> Result<PoolOptions> {
        if self.expiry_in_ms < 0 {
            return Err(PoolError::InvalidPoolExpiry);
        }
        Ok(PoolOptions::default()
            .with_expiry(Duration::from_millis(self.expiry_in_ms as u64))
            .with_pre_alloc(self.pre_alloc)
            .with_max_blocking_tasks(self.max_blocking_tasks)
            .with_nonblocking(self.nonblocking))
    }

    /// Builds a pool from these settings. Must be called inside a Tokio runtime.
    pub fn build(&self) -> Result<Pool> {
        Pool::new(self.size, self.options()?)
    }
}
