//! Sluice Core
//!
//! Core types shared by the Sluice pipeline engine.
//!
//! This crate contains:
//! - Domain types: pipeline definitions and the lifecycle state enum
//! - DTOs: status snapshots handed out by the orchestrator
//! - Panic helpers used by the supervisory boundaries

pub mod domain;
pub mod dto;
pub mod panic;
