//! Sluice Pipeline
//!
//! The execution side of the engine:
//! - [`Processor`] and [`Filter`] stages and the [`Registry`] that builds them
//!   from declarative chain entries
//! - [`Processors`] and [`Filters`] chains with sequential, cancellable
//!   execution
//! - [`Context`], the per-pipeline lifecycle state machine
//! - [`Dag`] jobs for sequential and fan-out/fan-in execution
//! - `when` / `if` conditions evaluated against a context
//! - config checks run before a stage is constructed

pub mod builtin;
pub mod chain;
pub mod check;
pub mod condition;
pub mod conditional;
pub mod context;
pub mod dag;
pub mod error;
pub mod processor;
pub mod registry;
pub mod request;

pub use builtin::register_builtins;
pub use chain::{Filters, Processors, SKIPPED_MARKER};
pub use condition::{Condition, ConditionTarget};
pub use context::Context;
pub use dag::{Dag, DetachedTasks, JoinMode};
pub use error::{PipelineError, Result};
pub use processor::{Filter, Processor};
pub use registry::{Registry, checked_filter, checked_processor};
pub use request::RequestContext;
