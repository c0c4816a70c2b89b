//! Data Transfer Objects
//!
//! Read-only snapshots handed to status collaborators.

pub mod status;
