//! Idle worker queues
//!
//! Both queues keep workers ordered by the time they went idle, oldest first,
//! so expired workers always form a prefix.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::worker::WorkerHandle;

pub(crate) trait WorkerQueue: Send {
    fn len(&self) -> usize;

    /// Parks a worker. Hands it back when the queue is full.
    fn insert(&mut self, worker: WorkerHandle) -> Result<(), WorkerHandle>;

    /// Takes a worker out for reuse
    fn detach(&mut self) -> Option<WorkerHandle>;

    /// Removes every worker idle for longer than `expiry`
    fn retrieve_expiry(&mut self, expiry: Duration) -> Vec<WorkerHandle>;

    /// Empties the queue
    fn reset(&mut self) -> Vec<WorkerHandle>;
}

fn is_expired(worker: &WorkerHandle, now: Instant, expiry: Duration) -> bool {
    now.saturating_duration_since(worker.recycle_time) > expiry
}

/// LIFO queue used by pools created without pre-allocation.
///
/// Reusing the most recently parked worker leaves the old ones to expire.
#[derive(Default)]
pub(crate) struct WorkerStack {
    items: Vec<WorkerHandle>,
}

impl WorkerQueue for WorkerStack {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn insert(&mut self, worker: WorkerHandle) -> Result<(), WorkerHandle> {
        self.items.push(worker);
        Ok(())
    }

    fn detach(&mut self) -> Option<WorkerHandle> {
        self.items.pop()
    }

    fn retrieve_expiry(&mut self, expiry: Duration) -> Vec<WorkerHandle> {
        let now = Instant::now();
        let expired = self
            .items
            .partition_point(|worker| is_expired(worker, now, expiry));
        self.items.drain(..expired).collect()
    }

    fn reset(&mut self) -> Vec<WorkerHandle> {
        std::mem::take(&mut self.items)
    }
}

/// Fixed-size ring used by pre-allocated pools
pub(crate) struct LoopQueue {
    items: VecDeque<WorkerHandle>,
    size: usize,
}

impl LoopQueue {
    pub(crate) fn with_capacity(size: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(size),
            size,
        }
    }
}

impl WorkerQueue for LoopQueue {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn insert(&mut self, worker: WorkerHandle) -> Result<(), WorkerHandle> {
        if self.items.len() >= self.size {
            return Err(worker);
        }
        self.items.push_back(worker);
        Ok(())
    }

    fn detach(&mut self) -> Option<WorkerHandle> {
        self.items.pop_front()
    }

    fn retrieve_expiry(&mut self, expiry: Duration) -> Vec<WorkerHandle> {
        let now = Instant::now();
        let mut expired = Vec::new();
        while self
            .items
            .front()
            .is_some_and(|worker| is_expired(worker, now, expiry))
        {
            if let Some(worker) = self.items.pop_front() {
                expired.push(worker);
            }
        }
        expired
    }

    fn reset(&mut self) -> Vec<WorkerHandle> {
        self.items.drain(..).collect()
    }
}
