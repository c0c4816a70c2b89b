//! Conditional stages built from `when` and `if` sections

use async_trait::async_trait;
use std::sync::Arc;

use crate::chain::{Filters, Processors};
use crate::condition::Condition;
use crate::context::Context;
use crate::processor::{Filter, Processor};
use crate::request::RequestContext;

/// Runs the wrapped processor only when the condition holds.
///
/// A skipped stage leaves `<name>-skipped` in the process history.
pub struct WhenProcessor {
    inner: Arc<dyn Processor>,
    condition: Condition,
}

impl WhenProcessor {
    pub fn new(inner: Arc<dyn Processor>, condition: Condition) -> Self {
        Self { inner, condition }
    }
}

#[async_trait]
impl Processor for WhenProcessor {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn process(&self, ctx: &Context) -> anyhow::Result<()> {
        if self.condition.check(ctx) {
            self.inner.process(ctx).await
        } else {
            ctx.add_flow_process(format!("{}-skipped", self.inner.name()));
            Ok(())
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.close().await
    }
}

/// Branch stage: one condition, two sub-chains
pub struct IfThenElseProcessor {
    condition: Condition,
    then: Processors,
    otherwise: Processors,
}

impl IfThenElseProcessor {
    pub fn new(condition: Condition, then: Processors, otherwise: Processors) -> Self {
        Self {
            condition,
            then,
            otherwise,
        }
    }
}

#[async_trait]
impl Processor for IfThenElseProcessor {
    fn name(&self) -> &str {
        "if_then_else"
    }

    async fn process(&self, ctx: &Context) -> anyhow::Result<()> {
        if self.condition.check(ctx) {
            ctx.add_flow_process("then");
            self.then.process(ctx).await
        } else {
            ctx.add_flow_process("else");
            self.otherwise.process(ctx).await
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.then.close().await;
        self.otherwise.close().await;
        Ok(())
    }
}

/// Filter counterpart of [`WhenProcessor`]
pub struct WhenFilter {
    inner: Arc<dyn Filter>,
    condition: Condition,
}

impl WhenFilter {
    pub fn new(inner: Arc<dyn Filter>, condition: Condition) -> Self {
        Self { inner, condition }
    }
}

impl Filter for WhenFilter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn filter(&self, req: &mut RequestContext) {
        if self.condition.check(&*req) {
            self.inner.filter(req);
        } else {
            req.add_flow_process(format!("{}-skipped", self.inner.name()));
        }
    }
}

/// Filter counterpart of [`IfThenElseProcessor`]
pub struct IfThenElseFilter {
    condition: Condition,
    then: Filters,
    otherwise: Filters,
}

impl IfThenElseFilter {
    pub fn new(condition: Condition, then: Filters, otherwise: Filters) -> Self {
        Self {
            condition,
            then,
            otherwise,
        }
    }
}

impl Filter for IfThenElseFilter {
    fn name(&self) -> &str {
        "if_then_else"
    }

    fn filter(&self, req: &mut RequestContext) {
        if self.condition.check(&*req) {
            req.add_flow_process("then");
            self.then.filter(req);
        } else {
            req.add_flow_process("else");
            self.otherwise.filter(req);
        }
    }
}
