//! Pool bookkeeping, submission and the expiry scavenger

use futures::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicIsize, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{PoolError, Result};
use crate::options::{PanicHandler, PoolOptions};
use crate::queue::{LoopQueue, WorkerQueue, WorkerStack};
use crate::worker::{self, WorkerHandle};

/// Idle lifetime and scavenger period used when none is configured
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(1);

const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(10);

const OPENED: u8 = 0;
const CLOSED: u8 = 1;

/// A unit of work executed by a pool worker
pub struct Task {
    future: BoxFuture<'static, ()>,
}

impl Task {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            future: Box::pin(future),
        }
    }

    pub(crate) async fn run(self) {
        self.future.await
    }
}

/// Snapshot of the pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: isize,
    pub running: isize,
    pub free: isize,
    pub waiting: usize,
    pub idle: usize,
}

/// Worker pool handle. Clones share the same workers.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    capacity: AtomicIsize,
    running: AtomicIsize,
    state: AtomicU8,
    idle: Mutex<IdleState>,
    cond: Notify,
    expiry: Duration,
    options: PoolOptions,
    scavenger: Mutex<CancellationToken>,
}

struct IdleState {
    workers: Box<dyn WorkerQueue>,
    blocking: usize,
}

impl Pool {
    /// Creates a pool with `size` workers at most; `size <= 0` means unbounded.
    ///
    /// Starts the scavenger, so this must be called inside a Tokio runtime.
    pub fn new(size: isize, options: PoolOptions) -> Result<Self> {
        let capacity = if size <= 0 { -1 } else { size };

        if options.pre_alloc && capacity == -1 {
            return Err(PoolError::InvalidPreAllocSize);
        }

        let expiry = if options.expiry_duration.is_zero() {
            DEFAULT_EXPIRY
        } else {
            options.expiry_duration
        };

        let workers: Box<dyn WorkerQueue> = if options.pre_alloc {
            Box::new(LoopQueue::with_capacity(capacity as usize))
        } else {
            Box::new(WorkerStack::default())
        };

        let inner = Arc::new(PoolInner {
            capacity: AtomicIsize::new(capacity),
            running: AtomicIsize::new(0),
            state: AtomicU8::new(OPENED),
            idle: Mutex::new(IdleState {
                workers,
                blocking: 0,
            }),
            cond: Notify::new(),
            expiry,
            options,
            scavenger: Mutex::new(CancellationToken::new()),
        });
        inner.start_scavenger();

        debug!("Created worker pool (capacity: {}, expiry: {:?})", capacity, expiry);

        Ok(Self { inner })
    }

    /// Hands a task to a worker.
    ///
    /// Waits for a worker when the pool is full, unless the pool is
    /// nonblocking or the waiter limit is reached.
    pub async fn submit(&self, task: Task) -> Result<()> {
        if self.inner.is_closed() {
            return Err(PoolError::Closed);
        }
        let worker = self.inner.retrieve_worker().await?;
        worker
            .sender
            .send(Some(task))
            .await
            .map_err(|_| PoolError::Closed)
    }

    /// Workers currently alive, busy or idle
    pub fn running(&self) -> isize {
        self.inner.running()
    }

    /// Capacity, `-1` when unbounded
    pub fn cap(&self) -> isize {
        self.inner.cap()
    }

    /// Remaining room for new workers, `-1` when unbounded
    pub fn free(&self) -> isize {
        let cap = self.cap();
        if cap < 0 { -1 } else { cap - self.running() }
    }

    /// Submitters currently waiting for a worker
    pub fn waiting(&self) -> usize {
        self.inner.lock_idle().blocking
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn stats(&self) -> PoolStats {
        let (waiting, idle) = {
            let idle = self.inner.lock_idle();
            (idle.blocking, idle.workers.len())
        };
        PoolStats {
            capacity: self.cap(),
            running: self.running(),
            free: self.free(),
            waiting,
            idle,
        }
    }

    /// Changes the capacity at runtime.
    ///
    /// Ignored for unbounded and pre-allocated pools.
    pub fn tune(&self, size: isize) {
        let cap = self.cap();
        if cap == -1 || size <= 0 || size == cap || self.inner.options.pre_alloc {
            return;
        }
        self.inner.capacity.store(size, Ordering::SeqCst);
        debug!("Tuned worker pool capacity {} -> {}", cap, size);

        if size > cap {
            if size - cap == 1 {
                self.inner.cond.notify_one();
            } else {
                self.inner.cond.notify_waiters();
            }
        }
    }

    /// Closes the pool and retires idle workers.
    ///
    /// Busy workers finish their current task and then exit.
    pub fn release(&self) {
        if self
            .inner
            .state
            .compare_exchange(OPENED, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let drained = self.inner.lock_idle().workers.reset();
        for worker in drained {
            let _ = worker.sender.try_send(None);
        }

        self.inner.cond.notify_waiters();
        self.inner.stop_scavenger();
        debug!("Released worker pool");
    }

    /// Releases the pool and waits until every worker has exited
    pub async fn release_timeout(&self, timeout: Duration) -> Result<()> {
        if self.inner.is_closed() {
            return Err(PoolError::AlreadyClosed);
        }
        self.release();

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.running() == 0 {
                return Ok(());
            }
            time::sleep(RELEASE_POLL_INTERVAL).await;
        }

        if self.running() == 0 {
            Ok(())
        } else {
            Err(PoolError::Timeout)
        }
    }

    /// Reopens a released pool
    pub fn reboot(&self) {
        if self
            .inner
            .state
            .compare_exchange(CLOSED, OPENED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner.start_scavenger();
            debug!("Rebooted worker pool");
        }
    }
}

/// Keeps the waiter count honest if a blocked `submit` is dropped
struct WaitGuard<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut idle = self.inner.lock_idle();
            idle.blocking = idle.blocking.saturating_sub(1);
        }
    }
}

impl PoolInner {
    fn lock_idle(&self) -> MutexGuard<'_, IdleState> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn running(&self) -> isize {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn dec_running(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn cap(&self) -> isize {
        self.capacity.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CLOSED
    }

    pub(crate) fn panic_handler(&self) -> Option<&PanicHandler> {
        self.options.panic_handler.as_ref()
    }

    /// Wakes one blocked submitter
    pub(crate) fn signal(&self) {
        self.cond.notify_one();
    }

    /// Starts a new worker. The running slot is taken while the idle lock
    /// is still held, so the capacity check and the increment cannot
    /// interleave with another submitter.
    fn spawn_worker(self: &Arc<Self>, idle: MutexGuard<'_, IdleState>) -> WorkerHandle {
        self.running.fetch_add(1, Ordering::SeqCst);
        drop(idle);

        let (sender, receiver) = mpsc::channel(1);
        tokio::spawn(worker::run(Arc::clone(self), sender.clone(), receiver));
        WorkerHandle {
            sender,
            recycle_time: Instant::now(),
        }
    }

    async fn retrieve_worker(self: &Arc<Self>) -> Result<WorkerHandle> {
        let mut woken: Option<WaitGuard<'_>> = None;

        loop {
            let notified = self.cond.notified();
            tokio::pin!(notified);

            {
                let mut idle = self.lock_idle();

                if let Some(mut guard) = woken.take() {
                    guard.armed = false;
                    idle.blocking = idle.blocking.saturating_sub(1);

                    if self.is_closed() {
                        return Err(PoolError::Closed);
                    }
                    // every worker was evicted while we slept
                    if self.running() == 0 {
                        return Ok(self.spawn_worker(idle));
                    }
                }

                if let Some(worker) = idle.workers.detach() {
                    return Ok(worker);
                }

                let cap = self.cap();
                if cap == -1 || cap > self.running() {
                    return Ok(self.spawn_worker(idle));
                }

                if self.options.nonblocking {
                    return Err(PoolError::Overload);
                }
                if self.options.max_blocking_tasks != 0
                    && idle.blocking >= self.options.max_blocking_tasks
                {
                    return Err(PoolError::Overload);
                }

                idle.blocking += 1;
                notified.as_mut().enable();
            }

            let guard = WaitGuard {
                inner: self.as_ref(),
                armed: true,
            };
            notified.await;
            woken = Some(guard);
        }
    }

    /// Parks a worker that finished its task.
    ///
    /// Returns false when the worker should exit instead.
    pub(crate) fn revert_worker(&self, worker: WorkerHandle) -> bool {
        let cap = self.cap();
        if (cap > 0 && self.running() > cap) || self.is_closed() {
            self.cond.notify_waiters();
            return false;
        }

        let mut idle = self.lock_idle();
        if self.is_closed() {
            return false;
        }
        if idle.workers.insert(worker).is_err() {
            return false;
        }
        self.cond.notify_one();
        true
    }

    fn start_scavenger(self: &Arc<Self>) {
        let token = CancellationToken::new();
        {
            let mut current = self.scavenger.lock().unwrap_or_else(PoisonError::into_inner);
            current.cancel();
            *current = token.clone();
        }

        let pool = Arc::downgrade(self);
        let expiry = self.expiry;
        tokio::spawn(scavenge(pool, expiry, token));
    }

    fn stop_scavenger(&self) {
        self.scavenger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    fn purge_expired(&self) {
        let expired = self.lock_idle().workers.retrieve_expiry(self.expiry);

        if !expired.is_empty() {
            trace!("Evicting {} expired worker(s)", expired.len());
        }
        for worker in expired {
            let _ = worker.sender.try_send(None);
        }

        if self.running() == 0 {
            self.cond.notify_waiters();
        }
    }
}

async fn scavenge(pool: Weak<PoolInner>, expiry: Duration, token: CancellationToken) {
    let mut ticker = time::interval(expiry);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(pool) = pool.upgrade() else {
            break;
        };
        if pool.is_closed() {
            break;
        }
        pool.purge_expired();
    }

    trace!("Worker pool scavenger stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    /// A task that holds its worker until the gate gets a permit
    fn gated(gate: &Arc<Semaphore>) -> Task {
        let gate = Arc::clone(gate);
        Task::new(async move {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        })
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submit_below_capacity_never_blocks() {
        let pool = Pool::new(4, PoolOptions::default()).unwrap();
        let gate = Arc::new(Semaphore::new(0));

        for _ in 0..4 {
            let submitted = time::timeout(Duration::from_millis(200), pool.submit(gated(&gate))).await;
            assert!(matches!(submitted, Ok(Ok(()))));
        }

        assert_eq!(pool.running(), 4);
        assert_eq!(pool.free(), 0);
        assert_eq!(pool.running() + pool.free(), pool.cap());

        gate.add_permits(4);
        pool.release();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_nonblocking_overload() {
        let pool = Pool::new(1, PoolOptions::default().with_nonblocking(true)).unwrap();
        let gate = Arc::new(Semaphore::new(0));

        pool.submit(gated(&gate)).await.unwrap();
        let second = pool.submit(Task::new(async {})).await;
        assert_eq!(second, Err(PoolError::Overload));

        gate.add_permits(1);
        pool.release();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_blocked_submit_resumes_when_worker_frees() {
        let pool = Pool::new(1, PoolOptions::default()).unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        pool.submit(gated(&gate)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                pool.submit(Task::new(async move {
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .await
            })
        };

        assert!(wait_until(|| pool.waiting() == 1).await);
        gate.add_permits(1);

        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert!(wait_until(|| done.load(Ordering::SeqCst) == 1).await);
        assert_eq!(pool.waiting(), 0);
        pool.release();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_respect_capacity() {
        let pool = Pool::new(1, PoolOptions::default().with_nonblocking(true)).unwrap();
        let gate = Arc::new(Semaphore::new(0));

        let submits: Vec<_> = (0..32)
            .map(|_| {
                let pool = pool.clone();
                let task = gated(&gate);
                tokio::spawn(async move { pool.submit(task).await })
            })
            .collect();
        let results: Vec<_> = futures::future::join_all(submits)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results.iter().all(|result| matches!(result, Ok(()) | Err(PoolError::Overload))));
        assert_eq!(pool.running(), 1);

        gate.add_permits(32);
        pool.release();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tune_wakes_blocked_submit() {
        let pool = Pool::new(1, PoolOptions::default()).unwrap();
        let gate = Arc::new(Semaphore::new(0));
        pool.submit(gated(&gate)).await.unwrap();

        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(Task::new(async {})).await })
        };
        assert!(wait_until(|| pool.waiting() == 1).await);

        // the first worker is still busy; only the extra capacity frees the waiter
        pool.tune(2);
        let resumed = time::timeout(Duration::from_secs(2), blocked).await;
        assert!(matches!(resumed, Ok(Ok(Ok(())))));
        assert_eq!(pool.running(), 2);
        assert_eq!(pool.waiting(), 0);

        gate.add_permits(1);
        pool.release();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_release_wakes_blocked_submits() {
        let pool = Pool::new(1, PoolOptions::default()).unwrap();
        let gate = Arc::new(Semaphore::new(0));
        pool.submit(gated(&gate)).await.unwrap();

        let blocked: Vec<_> = (0..2)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.submit(Task::new(async {})).await })
            })
            .collect();
        assert!(wait_until(|| pool.waiting() == 2).await);

        pool.release();
        for submit in blocked {
            let result = time::timeout(Duration::from_secs(2), submit).await;
            assert!(matches!(result, Ok(Ok(Err(PoolError::Closed)))));
        }
        assert_eq!(pool.waiting(), 0);

        gate.add_permits(1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_blocked_submit_resumes_when_worker_retires() {
        let options = PoolOptions::default().with_panic_handler(|_| {});
        let pool = Pool::new(1, options).unwrap();
        let gate = Arc::new(Semaphore::new(0));

        let doomed = Arc::clone(&gate);
        pool.submit(Task::new(async move {
            if let Ok(permit) = doomed.acquire().await {
                permit.forget();
            }
            panic!("worker gives up");
        }))
        .await
        .unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let blocked = {
            let pool = pool.clone();
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                pool.submit(Task::new(async move {
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .await
            })
        };
        assert!(wait_until(|| pool.waiting() == 1).await);

        // the busy worker exits instead of parking, leaving nobody running
        gate.add_permits(1);
        let resumed = time::timeout(Duration::from_secs(2), blocked).await;
        assert!(matches!(resumed, Ok(Ok(Ok(())))));
        assert!(wait_until(|| done.load(Ordering::SeqCst) == 1).await);
        pool.release();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scavenger_wakes_waiters_when_nothing_runs() {
        let options = PoolOptions::default().with_expiry(Duration::from_millis(50));
        let pool = Pool::new(1, options).unwrap();

        // a slot that is taken and then given back without signalling
        // leaves the waiter to the scavenger
        pool.inner.running.fetch_add(1, Ordering::SeqCst);
        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(Task::new(async {})).await })
        };
        assert!(wait_until(|| pool.waiting() == 1).await);
        pool.inner.dec_running();

        let resumed = time::timeout(Duration::from_secs(2), blocked).await;
        assert!(matches!(resumed, Ok(Ok(Ok(())))));
        assert_eq!(pool.waiting(), 0);
        pool.release();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_blocking_tasks() {
        let pool = Pool::new(1, PoolOptions::default().with_max_blocking_tasks(1)).unwrap();
        let gate = Arc::new(Semaphore::new(0));

        pool.submit(gated(&gate)).await.unwrap();

        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(Task::new(async {})).await })
        };
        assert!(wait_until(|| pool.waiting() == 1).await);

        let rejected = pool.submit(Task::new(async {})).await;
        assert_eq!(rejected, Err(PoolError::Overload));

        gate.add_permits(1);
        assert_eq!(blocked.await.unwrap(), Ok(()));
        pool.release();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicking_task_retires_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = PoolOptions::default().with_panic_handler(move |message| {
            let _ = tx.send(message);
        });
        let pool = Pool::new(2, options).unwrap();

        pool.submit(Task::new(async { panic!("task exploded") }))
            .await
            .unwrap();

        let message = time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(message.as_deref(), Some("task exploded"));
        assert!(wait_until(|| pool.running() == 0).await);

        // the pool keeps serving after a panic
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        pool.submit(Task::new(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();
        assert!(wait_until(|| done.load(Ordering::SeqCst) == 1).await);
        pool.release();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_idle_workers_expire() {
        let options = PoolOptions::default().with_expiry(Duration::from_millis(50));
        let pool = Pool::new(4, options).unwrap();

        for _ in 0..3 {
            pool.submit(Task::new(async {})).await.unwrap();
        }
        assert!(pool.running() > 0);

        assert!(wait_until(|| pool.running() == 0).await);
        assert_eq!(pool.stats().idle, 0);
        pool.release();
    }

    #[tokio::test]
    async fn test_workers_are_reused() {
        let pool = Pool::new(4, PoolOptions::default()).unwrap();

        for _ in 0..10 {
            pool.submit(Task::new(async {})).await.unwrap();
            assert!(wait_until(|| pool.stats().idle == 1).await);
        }
        assert_eq!(pool.running(), 1);
        pool.release();
    }

    #[tokio::test]
    async fn test_tune() {
        let pool = Pool::new(1, PoolOptions::default()).unwrap();
        pool.tune(3);
        assert_eq!(pool.cap(), 3);
        pool.tune(0);
        assert_eq!(pool.cap(), 3);

        let unbounded = Pool::new(0, PoolOptions::default()).unwrap();
        unbounded.tune(5);
        assert_eq!(unbounded.cap(), -1);
        assert_eq!(unbounded.free(), -1);

        let pre_alloc = Pool::new(2, PoolOptions::default().with_pre_alloc(true)).unwrap();
        pre_alloc.tune(5);
        assert_eq!(pre_alloc.cap(), 2);
    }

    #[tokio::test]
    async fn test_release_and_reboot() {
        let pool = Pool::new(2, PoolOptions::default()).unwrap();
        pool.release();

        assert!(pool.is_closed());
        assert_eq!(pool.submit(Task::new(async {})).await, Err(PoolError::Closed));
        assert_eq!(
            pool.release_timeout(Duration::from_millis(10)).await,
            Err(PoolError::AlreadyClosed)
        );

        pool.reboot();
        assert!(!pool.is_closed());
        assert_eq!(pool.submit(Task::new(async {})).await, Ok(()));
        pool.release();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_release_timeout() {
        let pool = Pool::new(2, PoolOptions::default()).unwrap();
        pool.submit(Task::new(async {
            time::sleep(Duration::from_millis(30)).await;
        }))
        .await
        .unwrap();
        assert_eq!(pool.release_timeout(Duration::from_secs(2)).await, Ok(()));
        assert_eq!(pool.running(), 0);

        let stuck = Pool::new(1, PoolOptions::default()).unwrap();
        let gate = Arc::new(Semaphore::new(0));
        stuck.submit(gated(&gate)).await.unwrap();
        assert_eq!(
            stuck.release_timeout(Duration::from_millis(50)).await,
            Err(PoolError::Timeout)
        );
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_invalid_options() {
        let pre_alloc = Pool::new(0, PoolOptions::default().with_pre_alloc(true));
        assert!(matches!(pre_alloc, Err(PoolError::InvalidPreAllocSize)));

        let config: crate::PoolConfig =
            serde_json::from_str(r#"{"size": 2, "expiry_in_ms": -5}"#).unwrap();
        assert!(matches!(config.build(), Err(PoolError::InvalidPoolExpiry)));
    }
}
