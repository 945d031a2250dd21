//! Provision controller
//!
//! Owns the lifecycle of one node's provisioner: startup, informer sync,
//! node readiness gating, and the serial tick loop dispatching discovery
//! and deletion passes.

pub mod provision;

pub use provision::*;
