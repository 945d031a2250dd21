//! Configuration assembly
//!
//! The provisioner's configuration is mounted as a directory of named text
//! files (one per ConfigMap key). Each file is parsed as an independent
//! typed YAML document and assembled into a [`ProvisionerConfig`]; invalid
//! or incomplete configuration is fatal at startup.

use crate::config::class::{StorageClassConfig, StorageClassTable};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Toleration;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// Configuration Keys
// =============================================================================

pub const KEY_STORAGE_CLASS_MAP: &str = "storageClassMap";
pub const KEY_NODE_LABELS_FOR_PV: &str = "nodeLabelsForPV";
pub const KEY_USE_ALPHA_API: &str = "useAlphaAPI";
pub const KEY_USE_JOB_FOR_CLEANING: &str = "useJobForCleaning";
pub const KEY_JOB_TOLERATIONS: &str = "jobTolerations";
pub const KEY_MIN_RESYNC_PERIOD: &str = "minResyncPeriod";
pub const KEY_USE_NODE_NAME_ONLY: &str = "useNodeNameOnly";
pub const KEY_LABELS_FOR_PV: &str = "labelsForPV";
pub const KEY_SET_PV_OWNER_REF: &str = "setPVOwnerRef";
pub const KEY_REMOVE_NODE_NOT_READY_TAINT: &str = "removeNodeNotReadyTaint";
pub const KEY_NOT_READY_TAINT_KEY: &str = "provisionerNotReadyNodeTaintKey";

/// Default base tick period when `minResyncPeriod` is not configured
pub const DEFAULT_MIN_RESYNC_PERIOD: Duration = Duration::from_secs(5 * 60);

// =============================================================================
// Provisioner Configuration
// =============================================================================

/// Fully validated provisioner configuration.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Storage class table, keyed by class name
    pub classes: StorageClassTable,
    /// Node label keys copied onto created PVs
    pub node_labels_for_pv: Vec<String>,
    /// Encode node affinity in the legacy annotation instead of the field
    pub use_alpha_api: bool,
    /// Run block cleanup as a cluster Job instead of a child process
    pub use_job_for_cleaning: bool,
    /// Tolerations added to cleanup Jobs
    pub job_tolerations: Vec<Toleration>,
    /// Base for the randomized tick interval; each tick interval is drawn
    /// uniformly from [min, 2*min)
    pub min_resync_period: Duration,
    /// Drop the node UID from the provisioner identity
    pub use_node_name_only: bool,
    /// Extra labels added to every created PV
    pub labels_for_pv: BTreeMap<String, String>,
    /// Owner-reference created PVs to the Node object
    pub set_pv_owner_ref: bool,
    /// Remove the startup taint once the provisioner is ready
    pub remove_node_not_ready_taint: bool,
    /// Key of the startup taint to remove
    pub provisioner_not_ready_node_taint_key: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            classes: StorageClassTable::default(),
            node_labels_for_pv: Vec::new(),
            use_alpha_api: false,
            use_job_for_cleaning: false,
            job_tolerations: Vec::new(),
            min_resync_period: DEFAULT_MIN_RESYNC_PERIOD,
            use_node_name_only: false,
            labels_for_pv: BTreeMap::new(),
            set_pv_owner_ref: false,
            remove_node_not_ready_taint: false,
            provisioner_not_ready_node_taint_key: String::new(),
        }
    }
}

impl ProvisionerConfig {
    /// Load configuration from a directory of per-key files, e.g. a mounted
    /// ConfigMap volume. ConfigMap bookkeeping entries (`..data` and
    /// friends) are skipped.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("..") || !entry.file_type()?.is_file() {
                continue;
            }
            let contents = fs::read_to_string(entry.path())?;
            entries.push((name, contents));
        }
        Self::from_entries(entries)
    }

    /// Assemble and validate configuration from (key, document) pairs.
    pub fn from_entries(entries: Vec<(String, String)>) -> Result<Self> {
        let mut raw_classes: BTreeMap<String, StorageClassConfig> = BTreeMap::new();
        let mut config = Self::default();

        for (key, raw) in &entries {
            match key.as_str() {
                KEY_STORAGE_CLASS_MAP => raw_classes = parse_leaf(key, raw)?,
                KEY_NODE_LABELS_FOR_PV => config.node_labels_for_pv = parse_leaf(key, raw)?,
                KEY_USE_ALPHA_API => config.use_alpha_api = parse_leaf(key, raw)?,
                KEY_USE_JOB_FOR_CLEANING => config.use_job_for_cleaning = parse_leaf(key, raw)?,
                KEY_JOB_TOLERATIONS => config.job_tolerations = parse_leaf(key, raw)?,
                KEY_MIN_RESYNC_PERIOD => {
                    config.min_resync_period = parse_duration_leaf(key, raw)?
                }
                KEY_USE_NODE_NAME_ONLY => config.use_node_name_only = parse_leaf(key, raw)?,
                KEY_LABELS_FOR_PV => config.labels_for_pv = parse_leaf(key, raw)?,
                KEY_SET_PV_OWNER_REF => config.set_pv_owner_ref = parse_leaf(key, raw)?,
                KEY_REMOVE_NODE_NOT_READY_TAINT => {
                    config.remove_node_not_ready_taint = parse_leaf(key, raw)?
                }
                KEY_NOT_READY_TAINT_KEY => {
                    config.provisioner_not_ready_node_taint_key =
                        raw.trim().to_string()
                }
                other => {
                    warn!("Ignoring unrecognized configuration key {:?}", other);
                }
            }
        }

        if raw_classes.is_empty() {
            return Err(Error::Configuration(
                "no storage classes configured".to_string(),
            ));
        }
        config.classes = StorageClassTable::new(raw_classes)?;

        if config.remove_node_not_ready_taint
            && config.provisioner_not_ready_node_taint_key.is_empty()
        {
            return Err(Error::Configuration(
                "removeNodeNotReadyTaint requires provisionerNotReadyNodeTaintKey".to_string(),
            ));
        }

        for (class, cfg) in config.classes.iter() {
            debug!(
                class,
                host_dir = %cfg.host_dir,
                mount_dir = %cfg.mount_dir,
                volume_mode = %cfg.volume_mode,
                name_pattern = %cfg.name_pattern,
                "Configured storage class"
            );
        }

        Ok(config)
    }
}

fn parse_leaf<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    serde_yaml::from_str(raw).map_err(|e| {
        Error::Configuration(format!("cannot parse configuration key {:?}: {}", key, e))
    })
}

/// Durations are written Go-style, e.g. `5m0s` or `30s`.
fn parse_duration_leaf(key: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim()).map_err(|e| {
        Error::Configuration(format!("cannot parse configuration key {:?}: {}", key, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASS_MAP: &str = r#"
fast:
  hostDir: /mnt/fast
  mountDir: /mnt/fast
raw:
  hostDir: /mnt/raw
  mountDir: /mnt/raw
  volumeMode: Block
"#;

    fn entries(extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut out = vec![(KEY_STORAGE_CLASS_MAP.to_string(), CLASS_MAP.to_string())];
        for (k, v) in extra {
            out.push((k.to_string(), v.to_string()));
        }
        out
    }

    #[test]
    fn test_minimal_config() {
        let config = ProvisionerConfig::from_entries(entries(&[])).unwrap();
        assert_eq!(config.classes.len(), 2);
        assert_eq!(config.min_resync_period, DEFAULT_MIN_RESYNC_PERIOD);
        assert!(!config.use_job_for_cleaning);
    }

    #[test]
    fn test_all_keys() {
        let config = ProvisionerConfig::from_entries(entries(&[
            (KEY_NODE_LABELS_FOR_PV, "- topology.kubernetes.io/zone\n"),
            (KEY_USE_ALPHA_API, "true"),
            (KEY_USE_JOB_FOR_CLEANING, "true"),
            (
                KEY_JOB_TOLERATIONS,
                "- key: node-role.kubernetes.io/storage\n  operator: Exists\n",
            ),
            (KEY_MIN_RESYNC_PERIOD, "30s"),
            (KEY_USE_NODE_NAME_ONLY, "true"),
            (KEY_LABELS_FOR_PV, "rack: r13\n"),
            (KEY_SET_PV_OWNER_REF, "true"),
            (KEY_REMOVE_NODE_NOT_READY_TAINT, "true"),
            (KEY_NOT_READY_TAINT_KEY, "storage.k8s.io/not-ready"),
        ]))
        .unwrap();

        assert_eq!(
            config.node_labels_for_pv,
            vec!["topology.kubernetes.io/zone".to_string()]
        );
        assert!(config.use_alpha_api);
        assert!(config.use_job_for_cleaning);
        assert_eq!(config.job_tolerations.len(), 1);
        assert_eq!(config.min_resync_period, Duration::from_secs(30));
        assert!(config.use_node_name_only);
        assert_eq!(config.labels_for_pv.get("rack"), Some(&"r13".to_string()));
        assert!(config.set_pv_owner_ref);
        assert!(config.remove_node_not_ready_taint);
        assert_eq!(
            config.provisioner_not_ready_node_taint_key,
            "storage.k8s.io/not-ready"
        );
    }

    #[test]
    fn test_go_style_duration() {
        let config =
            ProvisionerConfig::from_entries(entries(&[(KEY_MIN_RESYNC_PERIOD, "5m0s")])).unwrap();
        assert_eq!(config.min_resync_period, Duration::from_secs(300));
    }

    #[test]
    fn test_no_classes_is_fatal() {
        let err = ProvisionerConfig::from_entries(vec![]).unwrap_err();
        assert!(err.is_fatal_config());
    }

    #[test]
    fn test_taint_key_required_when_enabled() {
        let err = ProvisionerConfig::from_entries(entries(&[(
            KEY_REMOVE_NODE_NOT_READY_TAINT,
            "true",
        )]))
        .unwrap_err();
        assert!(err.is_fatal_config());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config =
            ProvisionerConfig::from_entries(entries(&[("futureKnob", "whatever")])).unwrap();
        assert_eq!(config.classes.len(), 2);
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(KEY_STORAGE_CLASS_MAP), CLASS_MAP).unwrap();
        std::fs::write(dir.path().join(KEY_USE_JOB_FOR_CLEANING), "true").unwrap();
        // ConfigMap mounts carry bookkeeping symlinks; loader must skip them.
        std::fs::write(dir.path().join("..data"), "ignored").unwrap();

        let config = ProvisionerConfig::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.classes.len(), 2);
        assert!(config.use_job_for_cleaning);
    }
}
