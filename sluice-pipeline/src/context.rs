//! Per-pipeline execution context
//!
//! A [`Context`] carries the lifecycle state of one named pipeline across
//! its runs:
//! - running state, step counter and timestamps
//! - a cancellation token re-armed for every run
//! - a pause gate that parks the supervising loop between runs
//! - parameters, process history and accumulated errors
//!
//! All mutable state sits behind one internal mutex. The context is a cheap
//! handle: clones share the same state.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sluice_core::domain::definition::PipelineDefinition;
use sluice_core::domain::state::RunningState;
use sluice_core::dto::status::PipelineStatus;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::condition::{ConditionTarget, lookup_path};

/// Pause gate position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Open,
    Parked,
}

/// Execution context shared between the supervising loop, the stages of a
/// run and status readers
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    definition: Arc<PipelineDefinition>,
    state: Mutex<ContextState>,
    gate: watch::Sender<Gate>,
    released: CancellationToken,
}

struct ContextState {
    id: Uuid,
    running_state: RunningState,
    create_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    steps: u64,
    cancel: CancellationToken,
    is_quit: bool,
    released: bool,
    loop_released: bool,
    parameters: BTreeMap<String, JsonValue>,
    process_history: Vec<String>,
    exit_error: Option<String>,
    process_errors: Vec<String>,
}

impl Context {
    /// Acquires a fresh context for `definition`, in the `STOPPED` state
    pub fn acquire(definition: PipelineDefinition) -> Self {
        let (gate, _) = watch::channel(Gate::Open);
        Self {
            inner: Arc::new(ContextInner {
                definition: Arc::new(definition),
                state: Mutex::new(ContextState {
                    id: Uuid::new_v4(),
                    running_state: RunningState::Stopped,
                    create_time: Utc::now(),
                    start_time: None,
                    end_time: None,
                    steps: 0,
                    cancel: CancellationToken::new(),
                    is_quit: false,
                    released: false,
                    loop_released: false,
                    parameters: BTreeMap::new(),
                    process_history: Vec::new(),
                    exit_error: None,
                    process_errors: Vec::new(),
                }),
                gate,
                released: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.lock().id
    }

    pub fn name(&self) -> &str {
        &self.inner.definition.name
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.inner.definition
    }

    /// True when both handles point at the same context
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    pub fn running_state(&self) -> RunningState {
        self.lock().running_state
    }

    pub fn steps(&self) -> u64 {
        self.lock().steps
    }

    pub fn starting(&self) {
        self.transition(RunningState::Starting, None);
    }

    pub fn started(&self) {
        self.transition(RunningState::Started, None);
    }

    /// No-op unless the run is `STARTED` or `STARTING`
    pub fn stopping(&self) {
        self.transition(RunningState::Stopping, None);
    }

    pub fn stopped(&self) {
        self.transition(RunningState::Stopped, None);
    }

    pub fn finished(&self) {
        self.transition(RunningState::Finished, None);
    }

    /// Ends the run as `FAILED` and keeps `err` as the exit error
    pub fn failed(&self, err: impl Display) {
        self.transition(RunningState::Failed, Some(format!("{err:#}")));
    }

    pub fn is_failed(&self) -> bool {
        self.running_state() == RunningState::Failed
    }

    /// False once the run is `FINISHED`
    pub fn should_continue(&self) -> bool {
        self.running_state() != RunningState::Finished
    }

    fn transition(&self, next: RunningState, error: Option<String>) -> bool {
        let (steps, previous) = {
            let mut state = self.lock();

            if state.released {
                trace!(
                    "Dropping transition of released pipeline {} to {}",
                    self.name(),
                    next
                );
                return false;
            }

            let current = state.running_state;
            if current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                debug!(
                    "Ignoring transition of pipeline {} from {} to {}",
                    self.name(),
                    current,
                    next
                );
                return false;
            }

            state.running_state = next;
            state.steps += 1;

            match next {
                RunningState::Starting => {
                    state.end_time = None;
                }
                RunningState::Started => {
                    state.start_time = Some(Utc::now());
                }
                RunningState::Stopping => {}
                RunningState::Stopped | RunningState::Finished | RunningState::Failed => {
                    state.end_time = Some(Utc::now());
                }
            }

            if let Some(message) = error {
                state.process_errors.push(message.clone());
                state.exit_error = Some(message);
            }

            (state.steps, current)
        };

        self.emit_lifecycle_event(previous, next, steps);
        true
    }

    fn emit_lifecycle_event(&self, previous: RunningState, next: RunningState, steps: u64) {
        let definition = &self.inner.definition;
        if definition.logging.enabled {
            info!(
                target: "sluice::lifecycle",
                pipeline = %definition.name,
                from = %previous,
                state = %next,
                steps,
                labels = ?definition.labels,
                "pipeline state changed"
            );
        } else {
            debug!(
                "Pipeline {} changed state {} -> {} (step {})",
                definition.name, previous, next, steps
            );
        }
    }

    // ---------------------------------------------------------------------
    // Exit flag
    // ---------------------------------------------------------------------

    /// Marks an operator stop: the pipeline must not restart by itself
    pub fn exit(&self) {
        self.lock().is_quit = true;
    }

    pub fn restart(&self) {
        self.lock().is_quit = false;
    }

    pub fn is_exit(&self) -> bool {
        self.lock().is_quit
    }

    // ---------------------------------------------------------------------
    // Cancellation
    // ---------------------------------------------------------------------

    /// Fires the cancellation token of the current run
    pub fn cancel_task(&self) {
        self.lock().cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.lock().cancel.is_cancelled()
    }

    /// Token of the current run, for stages that `select!` on cancellation
    pub fn cancellation_token(&self) -> CancellationToken {
        self.lock().cancel.clone()
    }

    // ---------------------------------------------------------------------
    // Pause gate
    // ---------------------------------------------------------------------

    /// Parks the caller until [`Context::resume`] or release
    pub async fn pause(&self) {
        self.park(None).await;
    }

    /// Parks only if the context is still in `expected`.
    ///
    /// The check and the parking happen under the state lock, so a
    /// transition followed by `resume` from another task cannot be missed.
    /// Returns false when the state had already moved on.
    pub async fn pause_if(&self, expected: RunningState) -> bool {
        self.park(Some(expected)).await
    }

    async fn park(&self, expected: Option<RunningState>) -> bool {
        let mut gate = {
            let state = self.lock();
            if state.released {
                return false;
            }
            if expected.is_some_and(|expected| expected != state.running_state) {
                return false;
            }
            let gate = self.inner.gate.subscribe();
            self.inner.gate.send_replace(Gate::Parked);
            gate
        };

        trace!("Pipeline {} paused", self.name());
        let _ = gate.wait_for(|position| *position == Gate::Open).await;
        trace!("Pipeline {} resumed", self.name());
        true
    }

    pub fn resume(&self) {
        let _state = self.lock();
        self.inner.gate.send_replace(Gate::Open);
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.gate.borrow() == Gate::Parked
    }

    // ---------------------------------------------------------------------
    // Release
    // ---------------------------------------------------------------------

    /// Makes the context inert: later transitions are dropped, the current
    /// run is cancelled and a parked loop wakes up.
    pub fn release(&self) {
        {
            let mut state = self.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.cancel.cancel();
            self.inner.gate.send_replace(Gate::Open);
        }
        self.inner.released.cancel();
        debug!("Released context of pipeline {}", self.name());
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    /// Resolves once the context is released
    pub async fn wait_released(&self) {
        self.inner.released.cancelled().await
    }

    /// Set by the supervising loop on its way out
    pub fn set_loop_released(&self) {
        self.lock().loop_released = true;
    }

    pub fn is_loop_released(&self) -> bool {
        self.lock().loop_released
    }

    // ---------------------------------------------------------------------
    // Per-run data
    // ---------------------------------------------------------------------

    /// Prepares the context for a new run.
    ///
    /// Keeps the id and the step counter.
    pub fn reset_context(&self) {
        let mut state = self.lock();
        state.start_time = Some(Utc::now());
        state.end_time = None;
        state.cancel = CancellationToken::new();
        state.parameters.clear();
        state.process_history.clear();
        state.exit_error = None;
        state.process_errors.clear();
    }

    pub fn add_flow_process(&self, name: impl Into<String>) {
        self.lock().process_history.push(name.into());
    }

    pub fn flow_process(&self) -> Vec<String> {
        self.lock().process_history.clone()
    }

    /// Records a non-fatal error of the current run
    pub fn error(&self, err: impl Display) {
        self.lock().process_errors.push(format!("{err:#}"));
    }

    pub fn errors(&self) -> Vec<String> {
        self.lock().process_errors.clone()
    }

    pub fn has_error(&self) -> bool {
        !self.lock().process_errors.is_empty()
    }

    pub fn exit_error(&self) -> Option<String> {
        self.lock().exit_error.clone()
    }

    pub fn set_param(&self, key: impl Into<String>, value: JsonValue) {
        self.lock().parameters.insert(key.into(), value);
    }

    pub fn get_param(&self, key: &str) -> Option<JsonValue> {
        lookup_path(&self.lock().parameters, key)
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.get_param(key).is_some()
    }

    pub fn remove_param(&self, key: &str) -> Option<JsonValue> {
        self.lock().parameters.remove(key)
    }

    pub fn parameters(&self) -> BTreeMap<String, JsonValue> {
        self.lock().parameters.clone()
    }

    /// Consistent snapshot for status readers
    pub fn status(&self) -> PipelineStatus {
        let paused = self.is_paused();
        let state = self.lock();
        PipelineStatus {
            id: state.id,
            name: self.inner.definition.name.clone(),
            state: state.running_state,
            steps: state.steps,
            create_time: state.create_time,
            start_time: state.start_time,
            end_time: state.end_time,
            exit_error: state.exit_error.clone(),
            process_errors: state.process_errors.clone(),
            process_history: state.process_history.clone(),
            paused,
            labels: self.inner.definition.labels.clone(),
        }
    }
}

impl ConditionTarget for Context {
    fn get_value(&self, field: &str) -> Option<JsonValue> {
        match field {
            "_ctx.id" => Some(JsonValue::String(self.id().to_string())),
            "_ctx.name" => Some(JsonValue::String(self.name().to_string())),
            "_ctx.state" => Some(JsonValue::String(self.running_state().to_string())),
            "_ctx.steps" => Some(JsonValue::from(self.steps())),
            _ => self.get_param(field),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name())
            .field("state", &self.running_state())
            .field("steps", &self.steps())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time;

    fn context() -> Context {
        Context::acquire(PipelineDefinition::new("test"))
    }

    #[test]
    fn test_full_run_transitions() {
        let ctx = context();
        assert_eq!(ctx.running_state(), RunningState::Stopped);

        ctx.starting();
        ctx.started();
        ctx.finished();

        assert_eq!(ctx.running_state(), RunningState::Finished);
        assert_eq!(ctx.steps(), 3);
        assert!(!ctx.should_continue());
        assert!(ctx.status().end_time.is_some());
    }

    #[test]
    fn test_no_started_to_starting_jump() {
        let ctx = context();
        ctx.starting();
        ctx.started();
        ctx.starting();

        assert_eq!(ctx.running_state(), RunningState::Started);
        assert_eq!(ctx.steps(), 2);
    }

    #[test]
    fn test_stopping_is_noop_when_not_running() {
        let ctx = context();
        ctx.stopping();
        assert_eq!(ctx.running_state(), RunningState::Stopped);
        assert_eq!(ctx.steps(), 0);

        ctx.starting();
        ctx.stopping();
        assert_eq!(ctx.running_state(), RunningState::Stopping);
        ctx.stopped();
        assert_eq!(ctx.running_state(), RunningState::Stopped);
    }

    #[test]
    fn test_failed_keeps_exit_error() {
        let ctx = context();
        ctx.starting();
        ctx.started();
        ctx.failed(anyhow::anyhow!("disk full"));

        assert!(ctx.is_failed());
        assert_eq!(ctx.exit_error().as_deref(), Some("disk full"));
        assert_eq!(ctx.status().last_error(), Some("disk full"));
    }

    #[test]
    fn test_no_transition_after_release() {
        let ctx = context();
        ctx.starting();
        ctx.release();

        let steps = ctx.steps();
        ctx.started();
        ctx.failed("late");

        assert_eq!(ctx.running_state(), RunningState::Starting);
        assert_eq!(ctx.steps(), steps);
        assert!(ctx.is_canceled());
    }

    #[test]
    fn test_reset_context_keeps_identity() {
        let ctx = context();
        ctx.starting();
        ctx.started();
        ctx.add_flow_process("a");
        ctx.error("oops");
        ctx.set_param("k", json!(1));
        ctx.cancel_task();

        let id = ctx.id();
        let steps = ctx.steps();

        ctx.reset_context();
        ctx.reset_context();

        assert_eq!(ctx.id(), id);
        assert!(ctx.steps() >= steps);
        assert!(ctx.flow_process().is_empty());
        assert!(ctx.errors().is_empty());
        assert!(!ctx.has_param("k"));
        assert!(!ctx.is_canceled());
    }

    #[test]
    fn test_exit_flag_is_independent_of_state() {
        let ctx = context();
        ctx.exit();
        assert!(ctx.is_exit());
        assert_eq!(ctx.running_state(), RunningState::Stopped);
        ctx.restart();
        assert!(!ctx.is_exit());
    }

    #[test]
    fn test_nested_parameter_lookup() {
        let ctx = context();
        ctx.set_param("request", json!({"method": "GET", "size": 3}));

        assert_eq!(ctx.get_param("request.method"), Some(json!("GET")));
        assert_eq!(ctx.get_value("request.size"), Some(json!(3)));
        assert_eq!(ctx.get_value("_ctx.state"), Some(json!("STOPPED")));
        assert_eq!(ctx.get_param("request.missing"), None);
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let ctx = context();
        let parked = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.pause().await })
        };

        time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.is_paused());
        assert!(!parked.is_finished());

        ctx.resume();
        time::timeout(Duration::from_secs(1), parked)
            .await
            .unwrap()
            .unwrap();
        assert!(!ctx.is_paused());
    }

    #[tokio::test]
    async fn test_pause_if_skips_when_state_moved() {
        let ctx = context();
        ctx.starting();
        let parked = time::timeout(
            Duration::from_millis(100),
            ctx.pause_if(RunningState::Stopped),
        )
        .await
        .unwrap();
        assert!(!parked);
    }

    #[tokio::test]
    async fn test_release_wakes_paused_loop() {
        let ctx = context();
        let parked = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.pause().await })
        };
        time::sleep(Duration::from_millis(20)).await;

        ctx.release();
        time::timeout(Duration::from_secs(1), parked)
            .await
            .unwrap()
            .unwrap();
        time::timeout(Duration::from_secs(1), ctx.wait_released())
            .await
            .unwrap();
    }
}
