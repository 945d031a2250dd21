//! Storage class configuration
//!
//! Each configured storage class names a host directory whose entries are
//! published as local PVs. The table is validated once at startup and
//! immutable afterwards.

use crate::config::{DEFAULT_BLOCK_CLEANER_COMMAND, DEFAULT_NAME_PATTERN};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::NodeSelectorTerm;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Volume and Access Modes
// =============================================================================

/// Volume mode of created PV objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeMode {
    #[default]
    Filesystem,
    Block,
}

impl VolumeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeMode::Filesystem => "Filesystem",
            VolumeMode::Block => "Block",
        }
    }
}

impl std::fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access mode of created PV objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
    ReadWriteOncePod,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadWriteOnce => "ReadWriteOnce",
            AccessMode::ReadOnlyMany => "ReadOnlyMany",
            AccessMode::ReadWriteMany => "ReadWriteMany",
            AccessMode::ReadWriteOncePod => "ReadWriteOncePod",
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Storage Class Configuration
// =============================================================================

/// Discovery configuration for a single storage class.
///
/// The serialized field names match the ConfigMap schema consumed by the
/// upstream provisioner, so existing `storageClassMap` documents parse
/// unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassConfig {
    /// Directory on the host where media for this class appear
    pub host_dir: String,
    /// The same directory as seen from inside this process
    pub mount_dir: String,
    /// Ordered argv used to wipe block devices of this class
    #[serde(default)]
    pub block_cleaner_command: Vec<String>,
    /// Volume mode of created PVs, Filesystem if not specified
    #[serde(default)]
    pub volume_mode: VolumeMode,
    /// Access mode of created PVs, ReadWriteOnce if not specified
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Filesystem type, used when the source is a block device and the
    /// volume mode is Filesystem
    #[serde(default)]
    pub fs_type: Option<String>,
    /// Comma-separated glob patterns; only matching entries are discovered
    #[serde(default)]
    pub name_pattern: String,
    /// Accept plain subdirectories for Filesystem classes instead of
    /// requiring each entry to be its own mount point
    #[serde(default)]
    pub allow_plain_dirs: bool,
    /// Extra node-selector terms added to PV node affinity (shared disks)
    #[serde(default)]
    pub selector: Vec<NodeSelectorTerm>,
}

impl StorageClassConfig {
    /// Validate and default this configuration in place. Fatal at startup
    /// when the class is unusable.
    pub fn validate(&mut self, class: &str) -> Result<()> {
        if self.host_dir.is_empty() || self.mount_dir.is_empty() {
            return Err(Error::StorageClassConfig {
                class: class.to_string(),
                reason: "missing hostDir or mountDir parameter".to_string(),
            });
        }
        self.host_dir = normalize_path(&self.host_dir);
        self.mount_dir = normalize_path(&self.mount_dir);

        if self.block_cleaner_command.is_empty() {
            self.block_cleaner_command = vec![DEFAULT_BLOCK_CLEANER_COMMAND.to_string()];
        } else if self.block_cleaner_command.iter().any(|arg| arg.is_empty()) {
            return Err(Error::StorageClassConfig {
                class: class.to_string(),
                reason: "empty argument in blockCleanerCommand".to_string(),
            });
        }

        if self.name_pattern.is_empty() {
            self.name_pattern = DEFAULT_NAME_PATTERN.to_string();
        }
        for pattern in self.name_pattern.split(',') {
            glob::Pattern::new(pattern).map_err(|e| Error::StorageClassConfig {
                class: class.to_string(),
                reason: format!("invalid namePattern {:?}: {}", pattern, e),
            })?;
        }

        Ok(())
    }

    /// True when the file name matches any of the configured glob patterns.
    pub fn matches_name(&self, file_name: &str) -> bool {
        self.name_pattern.split(',').any(|p| {
            glob::Pattern::new(p)
                .map(|pattern| pattern.matches(file_name))
                .unwrap_or(false)
        })
    }
}

/// Make the given path OS-native. On UNIX this is the identity; on Windows
/// forward slashes become backslashes and a drive prefix is ensured.
pub fn normalize_path(path: &str) -> String {
    #[cfg(not(windows))]
    {
        path.to_string()
    }
    #[cfg(windows)]
    {
        let mut normalized = path.replace('/', "\\");
        if normalized.starts_with('\\') {
            normalized = format!("c:{}", normalized);
        }
        normalized
    }
}

// =============================================================================
// Storage Class Table
// =============================================================================

/// Effective storage class configuration, keyed by class name.
/// Immutable after construction.
#[derive(Debug, Clone, Default)]
pub struct StorageClassTable {
    classes: BTreeMap<String, StorageClassConfig>,
}

impl StorageClassTable {
    /// Build a table from raw class configs, validating each one.
    pub fn new(mut classes: BTreeMap<String, StorageClassConfig>) -> Result<Self> {
        for (class, config) in classes.iter_mut() {
            config.validate(class)?;
        }
        Ok(Self { classes })
    }

    pub fn get(&self, class: &str) -> Option<&StorageClassConfig> {
        self.classes.get(class)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StorageClassConfig)> {
        self.classes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_class(host_dir: &str, mount_dir: &str) -> StorageClassConfig {
        StorageClassConfig {
            host_dir: host_dir.to_string(),
            mount_dir: mount_dir.to_string(),
            block_cleaner_command: Vec::new(),
            volume_mode: VolumeMode::default(),
            access_mode: AccessMode::default(),
            fs_type: None,
            name_pattern: String::new(),
            allow_plain_dirs: false,
            selector: Vec::new(),
        }
    }

    #[test]
    fn test_validate_defaults() {
        let mut config = raw_class("/mnt/fast", "/mnt/fast");
        config.validate("fast").unwrap();

        assert_eq!(
            config.block_cleaner_command,
            vec![DEFAULT_BLOCK_CLEANER_COMMAND.to_string()]
        );
        assert_eq!(config.name_pattern, "*");
        assert_eq!(config.volume_mode, VolumeMode::Filesystem);
        assert_eq!(config.access_mode, AccessMode::ReadWriteOnce);
    }

    #[test]
    fn test_validate_rejects_empty_dirs() {
        let mut config = raw_class("", "/mnt/fast");
        assert!(config.validate("fast").is_err());

        let mut config = raw_class("/mnt/fast", "");
        assert!(config.validate("fast").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let mut config = raw_class("/mnt/fast", "/mnt/fast");
        config.name_pattern = "vol[".to_string();
        assert!(config.validate("fast").is_err());
    }

    #[test]
    fn test_matches_name_patterns() {
        let mut config = raw_class("/mnt/fast", "/mnt/fast");
        config.name_pattern = "vol*,disk-?".to_string();
        config.validate("fast").unwrap();

        assert!(config.matches_name("vol1"));
        assert!(config.matches_name("disk-a"));
        assert!(!config.matches_name("disk-10"));
        assert!(!config.matches_name("scratch"));
    }

    #[test]
    fn test_yaml_field_names() {
        let yaml = r#"
hostDir: /mnt/disks
mountDir: /local-disks
volumeMode: Block
blockCleanerCommand:
  - /scripts/shred.sh
  - "2"
namePattern: "nvme*"
"#;
        let config: StorageClassConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.host_dir, "/mnt/disks");
        assert_eq!(config.mount_dir, "/local-disks");
        assert_eq!(config.volume_mode, VolumeMode::Block);
        assert_eq!(config.block_cleaner_command.len(), 2);
        assert_eq!(config.name_pattern, "nvme*");
    }

    #[test]
    fn test_table_lookup() {
        let mut classes = BTreeMap::new();
        classes.insert("fast".to_string(), raw_class("/mnt/fast", "/mnt/fast"));
        classes.insert("raw".to_string(), raw_class("/mnt/raw", "/mnt/raw"));

        let table = StorageClassTable::new(classes).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.get("fast").is_some());
        assert!(table.get("slow").is_none());
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["fast", "raw"]);
    }
}
