//! Core domain types
//!
//! These types are shared between the orchestrator (which owns the set of
//! definitions) and the pipeline runtime (which executes them).

pub mod definition;
pub mod state;
