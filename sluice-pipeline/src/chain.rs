//! Processor and filter chains

use async_trait::async_trait;
use futures::FutureExt;
use sluice_core::panic::panic_message;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::error::PipelineError;
use crate::processor::{Filter, Processor};
use crate::request::RequestContext;

/// History entry appended when a chain stops early
pub const SKIPPED_MARKER: &str = "skipped";

/// Ordered list of processors run one after another
#[derive(Clone, Default)]
pub struct Processors {
    stages: Vec<Arc<dyn Processor>>,
}

impl Processors {
    pub fn new(stages: Vec<Arc<dyn Processor>>) -> Self {
        Self { stages }
    }

    pub fn push(&mut self, stage: Arc<dyn Processor>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[Arc<dyn Processor>] {
        &self.stages
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Runs every stage in order.
    ///
    /// Stops quietly, leaving [`SKIPPED_MARKER`] in the history, once the
    /// run is finished or cancelled. The first stage error aborts the chain
    /// and is returned as is.
    pub async fn process(&self, ctx: &Context) -> anyhow::Result<()> {
        for stage in &self.stages {
            if !ctx.should_continue() || ctx.is_canceled() {
                debug!(
                    "Pipeline {} stops before stage {}",
                    ctx.name(),
                    stage.name()
                );
                ctx.add_flow_process(SKIPPED_MARKER);
                return Ok(());
            }

            ctx.add_flow_process(stage.name());
            stage.process(ctx).await?;
        }
        Ok(())
    }

    /// Like [`Processors::process`], but a panicking stage is trapped: the
    /// panic is logged and recorded with [`Context::failed`] instead of
    /// unwinding into the caller.
    pub async fn process_guarded(&self, ctx: &Context) -> anyhow::Result<()> {
        match AssertUnwindSafe(self.process(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let err = PipelineError::Panicked {
                    stage: ctx.flow_process().last().cloned().unwrap_or_default(),
                    message: panic_message(payload.as_ref()),
                };
                error!("Pipeline {} trapped a panic: {}", ctx.name(), err);
                ctx.failed(&err);
                Ok(())
            }
        }
    }

    /// Closes every stage, logging failures
    pub async fn close(&self) {
        for stage in &self.stages {
            if let Err(e) = stage.close().await {
                warn!("Failed to close stage {}: {:#}", stage.name(), e);
            }
        }
    }
}

#[async_trait]
impl Processor for Processors {
    fn name(&self) -> &str {
        "processors"
    }

    async fn process(&self, ctx: &Context) -> anyhow::Result<()> {
        Processors::process(self, ctx).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        Processors::close(self).await;
        Ok(())
    }
}

/// Ordered list of filters
#[derive(Clone, Default)]
pub struct Filters {
    stages: Vec<Arc<dyn Filter>>,
}

impl Filters {
    pub fn new(stages: Vec<Arc<dyn Filter>>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs the filters until one of them finishes the request
    pub fn filter(&self, req: &mut RequestContext) {
        for stage in &self.stages {
            if !req.should_continue() {
                req.add_flow_process(SKIPPED_MARKER);
                return;
            }
            req.add_flow_process(stage.name());
            stage.filter(req);
        }
    }
}

impl Filter for Filters {
    fn name(&self) -> &str {
        "filters"
    }

    fn filter(&self, req: &mut RequestContext) {
        Filters::filter(self, req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::domain::definition::PipelineDefinition;
    use sluice_core::domain::state::RunningState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Step {
        name: String,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Processor for Step {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process(&self, _ctx: &Context) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("{} failed", self.name);
            }
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl Processor for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        async fn process(&self, _ctx: &Context) -> anyhow::Result<()> {
            panic!("stage blew up")
        }
    }

    fn step(name: &str, calls: &Arc<AtomicUsize>, fail: bool) -> Arc<dyn Processor> {
        Arc::new(Step {
            name: name.to_string(),
            calls: Arc::clone(calls),
            fail,
        })
    }

    fn running_context() -> Context {
        let ctx = Context::acquire(PipelineDefinition::new("chain"));
        ctx.starting();
        ctx.started();
        ctx
    }

    #[tokio::test]
    async fn test_error_aborts_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let chain = Processors::new(vec![
            step("stage1", &calls, false),
            step("stage2", &calls, true),
            step("stage3", &third, false),
        ]);
        let ctx = running_context();

        let err = chain.process(&ctx).await.unwrap_err();

        assert_eq!(err.to_string(), "stage2 failed");
        assert_eq!(ctx.flow_process(), vec!["stage1", "stage2"]);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finished_or_canceled_context_skips() {
        for len in 1..=4 {
            let calls = Arc::new(AtomicUsize::new(0));
            let chain = Processors::new(
                (0..len)
                    .map(|i| step(&format!("s{i}"), &calls, false))
                    .collect(),
            );

            let finished = running_context();
            finished.finished();
            chain.process(&finished).await.unwrap();
            assert_eq!(finished.flow_process(), vec![SKIPPED_MARKER]);

            let canceled = running_context();
            canceled.cancel_task();
            chain.process(&canceled).await.unwrap();
            assert_eq!(canceled.flow_process(), vec![SKIPPED_MARKER]);

            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_guarded_mode_traps_panics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = Processors::new(vec![step("before", &calls, false), Arc::new(Panics)]);
        let ctx = running_context();

        chain.process_guarded(&ctx).await.unwrap();

        assert_eq!(ctx.running_state(), RunningState::Failed);
        let exit = ctx.exit_error().unwrap();
        assert!(exit.contains("panics"));
        assert!(exit.contains("stage blew up"));
    }

    #[tokio::test]
    async fn test_guarded_mode_returns_stage_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = Processors::new(vec![step("bad", &calls, true)]);
        let ctx = running_context();

        assert!(chain.process_guarded(&ctx).await.is_err());
        assert_eq!(ctx.running_state(), RunningState::Started);
    }

    struct Tag(&'static str, bool);

    impl Filter for Tag {
        fn name(&self) -> &str {
            self.0
        }

        fn filter(&self, req: &mut RequestContext) {
            req.set_param(self.0, serde_json::json!(true));
            if self.1 {
                req.finish();
            }
        }
    }

    #[test]
    fn test_filters_stop_after_finish() {
        let filters = Filters::new(vec![
            Arc::new(Tag("auth", false)),
            Arc::new(Tag("cache", true)),
            Arc::new(Tag("proxy", false)),
        ]);
        let mut req = RequestContext::new();

        filters.filter(&mut req);

        assert_eq!(req.flow_process(), ["auth", "cache", SKIPPED_MARKER]);
        assert!(req.get_param("proxy").is_none());
    }
}
