//! Shared types for the FlowMesh crates: the common error type, the
//! configuration tree, and structured trace events.

pub mod config;
pub mod error;
pub mod trace;
