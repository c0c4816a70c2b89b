//! Worker loop

use futures::FutureExt;
use sluice_core::panic::panic_message;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::pool::{PoolInner, Task};

/// `None` is the close signal sent by the scavenger and by `release`
pub(crate) type WorkerMessage = Option<Task>;

/// Handle to a worker, parked in the idle queue or checked out by a submitter
pub(crate) struct WorkerHandle {
    pub(crate) sender: mpsc::Sender<WorkerMessage>,
    pub(crate) recycle_time: Instant,
}

/// Runs tasks until the worker is told to close, fails to park itself, or a
/// task panics.
pub(crate) async fn run(
    pool: Arc<PoolInner>,
    sender: mpsc::Sender<WorkerMessage>,
    mut receiver: mpsc::Receiver<WorkerMessage>,
) {
    let mut panicked = None;

    while let Some(Some(task)) = receiver.recv().await {
        if let Err(payload) = AssertUnwindSafe(task.run()).catch_unwind().await {
            panicked = Some(panic_message(payload.as_ref()));
            break;
        }

        let handle = WorkerHandle {
            sender: sender.clone(),
            recycle_time: Instant::now(),
        };
        if !pool.revert_worker(handle) {
            break;
        }
    }

    pool.dec_running();

    if let Some(message) = panicked {
        match pool.panic_handler() {
            Some(handler) => handler(message),
            None => error!("worker exits from panic: {}", message),
        }
    } else {
        trace!("worker retired");
    }

    pool.signal();
}
