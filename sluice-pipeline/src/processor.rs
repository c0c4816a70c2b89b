//! Stage traits

use async_trait::async_trait;

use crate::context::Context;
use crate::request::RequestContext;

/// A stage of a processing chain.
///
/// Long-running stages must poll [`Context::is_canceled`] (or await
/// [`Context::cancellation_token`]) at safe points: cancellation is
/// cooperative and never interrupts a running stage.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Name recorded in the context's process history
    fn name(&self) -> &str;

    /// Runs the stage. An error aborts the rest of the chain.
    async fn process(&self, ctx: &Context) -> anyhow::Result<()>;

    /// Releases resources held by the stage.
    ///
    /// Called once the owning chain is discarded.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A request-scoped stage. Filters cannot fail; they stop the chain with
/// [`RequestContext::finish`].
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    fn filter(&self, req: &mut RequestContext);
}
