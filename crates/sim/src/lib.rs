//! In-process simulation of two FlowMesh nodes exchanging session traffic.

pub mod cli;
pub mod node;
