//! DAG of jobs
//!
//! A [`Dag`] is an ordered list of jobs. Jobs run strictly in order; the
//! tasks of a parallel job run concurrently, either on their own Tokio tasks
//! or on a [`Pool`] when one is attached.
//!
//! A `first_win` job returns as soon as one task reports back. The other
//! tasks keep running and are tracked by [`DetachedTasks`] until they end.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sluice_core::panic::panic_message;
use sluice_pool::{Pool, Task};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::error::PipelineError;
use crate::processor::Processor;

/// Join policy of a parallel job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Wait for every task
    #[default]
    WaitAll,
    /// Return after the first task, leave the rest running
    FirstWin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Succeeded,
    Failed,
    Panicked,
}

impl TaskOutcome {
    fn is_failure(self) -> bool {
        self != Self::Succeeded
    }
}

/// A group of tasks with completion hooks
pub struct Job {
    tasks: Vec<Arc<dyn Processor>>,
    sequential: bool,
    mode: JoinMode,
    on_complete: Vec<Arc<dyn Processor>>,
    on_failure: Option<Arc<dyn Processor>>,
}

impl Job {
    pub fn sequential(tasks: Vec<Arc<dyn Processor>>) -> Self {
        Self {
            tasks,
            sequential: true,
            mode: JoinMode::WaitAll,
            on_complete: Vec::new(),
            on_failure: None,
        }
    }

    pub fn parallel(tasks: Vec<Arc<dyn Processor>>, mode: JoinMode) -> Self {
        Self {
            tasks,
            sequential: false,
            mode,
            on_complete: Vec::new(),
            on_failure: None,
        }
    }

    fn stages(&self) -> impl Iterator<Item = &Arc<dyn Processor>> {
        self.tasks
            .iter()
            .chain(self.on_complete.iter())
            .chain(self.on_failure.iter())
    }
}

/// Completion tracking for tasks left behind by `first_win` jobs
#[derive(Clone, Default)]
pub struct DetachedTasks {
    inner: Arc<DetachedInner>,
}

#[derive(Default)]
struct DetachedInner {
    in_flight: AtomicUsize,
    idle: Notify,
}

impl DetachedTasks {
    /// Tasks still running in the background
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until no detached task is left. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            if time::timeout_at(deadline, idle).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    fn track(&self, mut outcomes: mpsc::Receiver<TaskOutcome>, remaining: usize, job: String) {
        let inner = Arc::clone(&self.inner);
        inner.in_flight.fetch_add(remaining, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut left = remaining;
            while left > 0 {
                let outcome = outcomes.recv().await;
                let settled = if outcome.is_some() { 1 } else { left };
                left -= settled;
                inner.in_flight.fetch_sub(settled, Ordering::SeqCst);
                inner.idle.notify_waiters();

                match outcome {
                    Some(outcome) => debug!("Detached task of {} ended: {:?}", job, outcome),
                    None => {
                        warn!("{} detached task(s) of {} never reported back", settled, job);
                        break;
                    }
                }
            }
        });
    }
}

/// Ordered list of jobs
#[derive(Default)]
pub struct Dag {
    jobs: Vec<Job>,
    mode: JoinMode,
    pool: Option<Pool>,
    detached: DetachedTasks,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join mode of the parallel jobs added afterwards
    pub fn with_mode(mut self, mode: JoinMode) -> Self {
        self.mode = mode;
        self
    }

    /// Runs parallel tasks on `pool` instead of dedicated Tokio tasks
    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Adds a sequential job
    pub fn pipeline(&mut self, tasks: Vec<Arc<dyn Processor>>) -> &mut Self {
        self.jobs.push(Job::sequential(tasks));
        self
    }

    /// Adds a parallel job using the DAG's join mode
    pub fn spawns(&mut self, tasks: Vec<Arc<dyn Processor>>) -> &mut Self {
        self.jobs.push(Job::parallel(tasks, self.mode));
        self
    }

    /// Adds a prepared job
    pub fn job(&mut self, job: Job) -> &mut Self {
        self.jobs.push(job);
        self
    }

    /// Attaches completion hooks to the last job
    pub fn on_complete(&mut self, hooks: Vec<Arc<dyn Processor>>) -> &mut Self {
        if let Some(job) = self.jobs.last_mut() {
            job.on_complete.extend(hooks);
        }
        self
    }

    /// Attaches a failure hook to the last job
    pub fn on_failure(&mut self, hook: Arc<dyn Processor>) -> &mut Self {
        if let Some(job) = self.jobs.last_mut() {
            job.on_failure = Some(hook);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn detached(&self) -> &DetachedTasks {
        &self.detached
    }

    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    /// Runs the jobs in order.
    ///
    /// A failing sequential task aborts the DAG with its error. Parallel
    /// tasks never fail the DAG: their errors and panics are logged and
    /// recorded on the context.
    pub async fn run(&self, ctx: &Context) -> anyhow::Result<()> {
        for (index, job) in self.jobs.iter().enumerate() {
            if job.sequential {
                self.run_sequential(job, ctx).await?;
            } else {
                self.run_parallel(index, job, ctx).await;
            }
        }
        Ok(())
    }

    async fn run_sequential(&self, job: &Job, ctx: &Context) -> anyhow::Result<()> {
        for task in &job.tasks {
            let err = match AssertUnwindSafe(task.process(ctx)).catch_unwind().await {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(payload) => {
                    let err = PipelineError::Panicked {
                        stage: task.name().to_string(),
                        message: panic_message(payload.as_ref()),
                    };
                    error!("Pipeline {}: {}", ctx.name(), err);
                    anyhow::Error::new(err)
                }
            };

            if let Some(hook) = &job.on_failure {
                run_hook(hook, ctx).await;
            }
            return Err(err);
        }

        for hook in &job.on_complete {
            run_hook(hook, ctx).await;
        }
        Ok(())
    }

    async fn run_parallel(&self, index: usize, job: &Job, ctx: &Context) {
        let total = job.tasks.len();
        let (sender, mut outcomes) = mpsc::channel(total.max(1));
        let mut dispatched = 0;
        let mut any_failed = false;

        for task in &job.tasks {
            let unit = trapped(Arc::clone(task), ctx.clone(), sender.clone());
            if self.dispatch(unit).await {
                dispatched += 1;
            } else {
                ctx.error(format!("failed to dispatch task {}", task.name()));
                any_failed = true;
            }
        }
        drop(sender);

        match job.mode {
            JoinMode::WaitAll => {
                for _ in 0..dispatched {
                    match outcomes.recv().await {
                        Some(outcome) => any_failed |= outcome.is_failure(),
                        None => {
                            any_failed = true;
                            break;
                        }
                    }
                }
            }
            JoinMode::FirstWin => {
                if dispatched > 0 {
                    match outcomes.recv().await {
                        Some(outcome) => any_failed |= outcome.is_failure(),
                        None => any_failed = true,
                    }
                    if dispatched > 1 {
                        let job = format!("{}#{}", ctx.name(), index);
                        self.detached.track(outcomes, dispatched - 1, job);
                    }
                }
            }
        }

        for hook in &job.on_complete {
            run_hook(hook, ctx).await;
        }
        if any_failed {
            if let Some(hook) = &job.on_failure {
                run_hook(hook, ctx).await;
            }
        }
    }

    async fn dispatch<F>(&self, unit: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.pool {
            Some(pool) => match pool.submit(Task::new(unit)).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to submit task to worker pool: {}", e);
                    false
                }
            },
            None => {
                tokio::spawn(unit);
                true
            }
        }
    }

    /// Closes every stage of every job
    pub async fn close(&self) {
        for job in &self.jobs {
            for stage in job.stages() {
                if let Err(e) = stage.close().await {
                    warn!("Failed to close stage {}: {:#}", stage.name(), e);
                }
            }
        }
    }
}

/// Runs one parallel task, trapping panics, and reports its outcome
async fn trapped(task: Arc<dyn Processor>, ctx: Context, sender: mpsc::Sender<TaskOutcome>) {
    let outcome = match AssertUnwindSafe(task.process(&ctx)).catch_unwind().await {
        Ok(Ok(())) => TaskOutcome::Succeeded,
        Ok(Err(e)) => {
            warn!("Parallel task {} of {} failed: {:#}", task.name(), ctx.name(), e);
            ctx.error(&e);
            TaskOutcome::Failed
        }
        Err(payload) => {
            let err = PipelineError::Panicked {
                stage: task.name().to_string(),
                message: panic_message(payload.as_ref()),
            };
            error!("Parallel task of {} trapped a panic: {}", ctx.name(), err);
            ctx.error(&err);
            TaskOutcome::Panicked
        }
    };
    let _ = sender.send(outcome).await;
}

/// Runs a hook; hook failures are logged and never propagate
async fn run_hook(hook: &Arc<dyn Processor>, ctx: &Context) {
    match AssertUnwindSafe(hook.process(ctx)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Hook {} of {} failed: {:#}", hook.name(), ctx.name(), e),
        Err(payload) => error!(
            "Hook {} of {} panicked: {}",
            hook.name(),
            ctx.name(),
            panic_message(payload.as_ref())
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sluice_core::domain::definition::PipelineDefinition;
    use sluice_pool::PoolOptions;
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    /// Records its name into a shared log, optionally after a delay or a gate
    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        delay: Duration,
        gate: Option<Arc<Semaphore>>,
        fail: bool,
        panic: bool,
    }

    impl Recorder {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                log: Arc::clone(log),
                delay: Duration::ZERO,
                gate: None,
                fail: false,
                panic: false,
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn gated(mut self, gate: &Arc<Semaphore>) -> Self {
            self.gate = Some(Arc::clone(gate));
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn panicking(mut self) -> Self {
            self.panic = true;
            self
        }

        fn arc(self) -> Arc<dyn Processor> {
            Arc::new(self)
        }
    }

    #[async_trait]
    impl Processor for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process(&self, _ctx: &Context) -> anyhow::Result<()> {
            if let Some(gate) = &self.gate {
                gate.acquire().await?.forget();
            }
            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            if self.panic {
                panic!("{} panicked", self.name);
            }
            self.log.lock().unwrap().push(self.name.clone());
            if self.fail {
                anyhow::bail!("{} failed", self.name);
            }
            Ok(())
        }
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn context() -> Context {
        Context::acquire(PipelineDefinition::new("dag"))
    }

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let log = log();
        let mut dag = Dag::new();
        dag.pipeline(vec![Recorder::new("a", &log).arc(), Recorder::new("b", &log).arc()])
            .on_complete(vec![Recorder::new("a-done", &log).arc()]);
        dag.pipeline(vec![Recorder::new("c", &log).arc()]);

        dag.run(&context()).await.unwrap();

        assert_eq!(entries(&log), vec!["a", "b", "a-done", "c"]);
    }

    #[tokio::test]
    async fn test_sequential_failure_runs_failure_hook() {
        let log = log();
        let mut dag = Dag::new();
        dag.pipeline(vec![
            Recorder::new("a", &log).failing().arc(),
            Recorder::new("b", &log).arc(),
        ])
        .on_complete(vec![Recorder::new("done", &log).arc()])
        .on_failure(Recorder::new("failed", &log).arc());
        dag.pipeline(vec![Recorder::new("next", &log).arc()]);

        let err = dag.run(&context()).await.unwrap_err();

        assert_eq!(err.to_string(), "a failed");
        assert_eq!(entries(&log), vec!["a", "failed"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wait_all_completes_before_hooks() {
        for count in 1..=5 {
            let log = log();
            let tasks = (0..count)
                .map(|i| {
                    Recorder::new(&format!("t{i}"), &log)
                        .delayed(Duration::from_millis(5 * (count - i) as u64))
                        .arc()
                })
                .collect();

            let mut dag = Dag::new();
            dag.spawns(tasks)
                .on_complete(vec![Recorder::new("complete", &log).arc()]);
            dag.run(&context()).await.unwrap();

            let seen = entries(&log);
            assert_eq!(seen.len(), count + 1);
            assert_eq!(seen.last().map(String::as_str), Some("complete"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_win_does_not_wait_for_all() {
        let log = log();
        let gate = Arc::new(Semaphore::new(0));

        let mut dag = Dag::new().with_mode(JoinMode::FirstWin);
        dag.spawns(vec![
            Recorder::new("fast", &log).arc(),
            Recorder::new("slow-1", &log).gated(&gate).arc(),
            Recorder::new("slow-2", &log).gated(&gate).arc(),
        ])
        .on_complete(vec![Recorder::new("complete", &log).arc()]);

        time::timeout(Duration::from_secs(2), dag.run(&context()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(entries(&log), vec!["fast", "complete"]);
        assert_eq!(dag.detached().in_flight(), 2);

        gate.add_permits(2);
        assert!(dag.detached().wait_idle(Duration::from_secs(2)).await);
        assert_eq!(entries(&log).len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_panic_runs_failure_hook() {
        let log = log();
        let ctx = context();

        let mut dag = Dag::new();
        dag.spawns(vec![
            Recorder::new("ok", &log).arc(),
            Recorder::new("boom", &log).panicking().arc(),
        ])
        .on_complete(vec![Recorder::new("complete", &log).arc()])
        .on_failure(Recorder::new("failure", &log).arc());

        dag.run(&ctx).await.unwrap();

        let seen = entries(&log);
        assert!(seen.contains(&"ok".to_string()));
        assert_eq!(&seen[seen.len() - 2..], ["complete", "failure"]);
        assert!(ctx.errors().iter().any(|e| e.contains("boom panicked")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_tasks_on_pool() {
        let log = log();
        let pool = Pool::new(2, PoolOptions::default()).unwrap();
        let tasks = (0..6)
            .map(|i| {
                Recorder::new(&format!("t{i}"), &log)
                    .delayed(Duration::from_millis(10))
                    .arc()
            })
            .collect();

        let mut dag = Dag::new().with_pool(pool.clone());
        dag.spawns(tasks);
        dag.run(&context()).await.unwrap();

        assert_eq!(entries(&log).len(), 6);
        assert!(pool.running() <= 2);
        pool.release();
    }

    #[tokio::test]
    async fn test_closed_pool_counts_as_failure() {
        let log = log();
        let pool = Pool::new(1, PoolOptions::default()).unwrap();
        pool.release();
        let ctx = context();

        let mut dag = Dag::new().with_pool(pool);
        dag.spawns(vec![Recorder::new("never", &log).arc()])
            .on_failure(Recorder::new("failure", &log).arc());
        dag.run(&ctx).await.unwrap();

        assert_eq!(entries(&log), vec!["failure"]);
        assert!(ctx.has_error());
    }
}
