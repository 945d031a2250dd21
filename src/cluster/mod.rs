//! Cluster API access
//!
//! - [`client`]: injected client factory (in-cluster or kubeconfig)
//! - [`api`]: thin façade over the objects the provisioner reads and writes

pub mod api;
pub mod client;

pub use api::*;
pub use client::*;
