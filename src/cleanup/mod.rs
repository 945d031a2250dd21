//! Released-volume cleanup
//!
//! - [`tracker`]: concurrency-safe status store enforcing at most one
//!   cleanup per PV name
//! - [`job`]: cluster Job construction for job-based cleaning
//! - [`deleter`]: per-tick reaction to Released PVs

pub mod deleter;
pub mod job;
pub mod tracker;

pub use deleter::*;
pub use job::*;
pub use tracker::*;
