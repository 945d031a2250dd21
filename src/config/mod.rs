//! Provisioner configuration
//!
//! This module contains everything the provisioner learns before its first
//! tick:
//! - [`class`]: per-storage-class discovery configuration and the immutable
//!   class table
//! - [`loader`]: assembly of the full configuration from per-key files
//! - [`identity`]: the stable provisioner identity written into PVs

pub mod class;
pub mod identity;
pub mod loader;

pub use class::*;
pub use identity::*;
pub use loader::*;

// =============================================================================
// Object conventions (bit-exact with the upstream provisioner)
// =============================================================================

/// Annotation marking a PV as provisioned by a specific instance
pub const ANN_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";

/// Label key used for PV node affinity; matches pod/node affinity usage
pub const NODE_LABEL_KEY: &str = "kubernetes.io/hostname";

/// Legacy annotation carrying node affinity as JSON when the alpha API is used
pub const ALPHA_NODE_AFFINITY_ANNOTATION: &str = "volume.alpha.kubernetes.io/node-affinity";

/// Default command used to wipe block devices
pub const DEFAULT_BLOCK_CLEANER_COMMAND: &str = "/scripts/quick_reset.sh";

/// Event reason recorded when cleanup or deletion of a released PV fails
pub const EVENT_VOLUME_FAILED_DELETE: &str = "VolumeFailedDelete";

/// Environment variable handed to cleanup commands for block devices
pub const LOCAL_PV_BLKDEVICE_ENV: &str = "LOCAL_PV_BLKDEVICE";

/// Environment variable handed to cleanup commands for filesystem volumes
pub const LOCAL_PV_FILESYSTEM_ENV: &str = "LOCAL_PV_FILESYSTEM";

/// Environment variable naming an out-of-cluster credentials file
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// Default glob pattern for discovery
pub const DEFAULT_NAME_PATTERN: &str = "*";

/// Where the ConfigMap volume with provisioner configuration is mounted
pub const DEFAULT_CONFIG_DIR: &str = "/etc/provisioner/config";
