//! Sluice worker pool
//!
//! A capacity-bounded, dynamically sized set of reusable workers. Workers are
//! spawned on demand up to the pool capacity, parked in an idle queue between
//! tasks and evicted by a periodic scavenger once idle longer than the expiry
//! duration.
//!
//! Submitters that find no free worker either fail fast (`nonblocking`) or
//! wait until a worker is handed back.

mod error;
mod options;
mod pool;
mod queue;
mod worker;

pub use error::{PoolError, Result};
pub use options::{PanicHandler, PoolConfig, PoolOptions};
pub use pool::{DEFAULT_EXPIRY, Pool, PoolStats, Task};
