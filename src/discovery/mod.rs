//! Volume discovery
//!
//! - [`volume`]: OS-level probes for directories, block devices, capacity
//!   and mount points
//! - [`discoverer`]: per-tick scan that publishes newly appeared media as
//!   PV objects

pub mod discoverer;
pub mod volume;

pub use discoverer::*;
pub use volume::*;

use crate::config::VolumeMode;
use sha2::{Digest, Sha256};

/// A medium found during one scan iteration, before it becomes a PV.
#[derive(Debug, Clone)]
pub struct DiscoveredVolume {
    pub class_name: String,
    pub file_name: String,
    /// Path on the host, `hostDir/fileName`
    pub host_path: String,
    /// Path as seen by this process, `mountDir/fileName`
    pub mount_path: String,
    pub mode: VolumeMode,
    pub capacity_bytes: u64,
}

/// Deterministic PV name for a medium: a fingerprint of the node identifier
/// and the host path. Re-scanning the same medium always produces the same
/// name, which makes creation idempotent and re-creation after deletion
/// safe.
pub fn generate_pv_name(node_name: &str, host_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node_name.as_bytes());
    hasher.update(b"|");
    hasher.update(host_path.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("local-pv-{}", &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pv_name_deterministic() {
        let a = generate_pv_name("n1", "/mnt/fast/vol1");
        let b = generate_pv_name("n1", "/mnt/fast/vol1");
        assert_eq!(a, b);
        assert!(a.starts_with("local-pv-"));
        assert_eq!(a.len(), "local-pv-".len() + 16);
    }

    #[test]
    fn test_pv_name_distinguishes_inputs() {
        let base = generate_pv_name("n1", "/mnt/fast/vol1");
        assert_ne!(base, generate_pv_name("n2", "/mnt/fast/vol1"));
        assert_ne!(base, generate_pv_name("n1", "/mnt/fast/vol2"));
    }
}
