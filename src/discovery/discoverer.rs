//! Volume discoverer
//!
//! One pass per tick: scan each configured class directory, classify every
//! matching entry, and publish new media as PV objects pinned to this node.
//! Creation is idempotent because PV names are a pure function of the node
//! and host path; AlreadyExists and Conflict responses count as success.

use crate::backoff::EntryBackoff;
use crate::cache::VolumeCache;
use crate::cluster::{ApiUtil, EventType};
use crate::config::{
    ProvisionerConfig, ProvisionerIdentity, StorageClassConfig, VolumeMode,
    ALPHA_NODE_AFFINITY_ANNOTATION, ANN_PROVISIONED_BY, NODE_LABEL_KEY,
};
use crate::discovery::volume::{probe_volume_mode, VolumeUtil};
use crate::discovery::{generate_pv_name, DiscoveredVolume};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{
    LocalVolumeSource, Node, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PersistentVolume, PersistentVolumeSpec, VolumeNodeAffinity,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Capacity Helpers
// =============================================================================

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Round capacity down to GiB or MiB granularity so reported sizes stay
/// readable; smaller values pass through unchanged.
pub fn round_down_capacity_pretty(capacity_bytes: u64) -> u64 {
    for multiple in [GIB, MIB] {
        if capacity_bytes >= multiple {
            return capacity_bytes / multiple * multiple;
        }
    }
    capacity_bytes
}

/// Render bytes as a binary-SI quantity, using the largest suffix that
/// divides the value evenly.
pub fn format_binary_quantity(bytes: u64) -> String {
    for (multiple, suffix) in [(TIB, "Ti"), (GIB, "Gi"), (MIB, "Mi"), (KIB, "Ki")] {
        if bytes >= multiple && bytes % multiple == 0 {
            return format!("{}{}", bytes / multiple, suffix);
        }
    }
    bytes.to_string()
}

// =============================================================================
// Discoverer
// =============================================================================

/// Scans class directories and creates PVs for newly appeared media.
pub struct Discoverer {
    config: Arc<ProvisionerConfig>,
    identity: ProvisionerIdentity,
    node: Node,
    cache: Arc<VolumeCache>,
    vol_util: Arc<dyn VolumeUtil>,
    api: Arc<dyn ApiUtil>,
    backoff: EntryBackoff,
}

impl Discoverer {
    pub fn new(
        config: Arc<ProvisionerConfig>,
        identity: ProvisionerIdentity,
        node: Node,
        cache: Arc<VolumeCache>,
        vol_util: Arc<dyn VolumeUtil>,
        api: Arc<dyn ApiUtil>,
    ) -> Self {
        Self {
            config,
            identity,
            node,
            cache,
            vol_util,
            api,
            backoff: EntryBackoff::default(),
        }
    }

    fn node_name(&self) -> &str {
        self.node.metadata.name.as_deref().unwrap_or_default()
    }

    /// One discovery pass over every configured class. Per-entry failures
    /// never abort the pass.
    pub async fn discover_once(&mut self) {
        self.backoff.advance_tick();
        let classes: Vec<(String, StorageClassConfig)> = self
            .config
            .classes
            .iter()
            .map(|(name, cfg)| (name.to_string(), cfg.clone()))
            .collect();
        for (class, class_config) in classes {
            if let Err(e) = self.discover_class(&class, &class_config).await {
                warn!(class = %class, "Discovery pass failed: {}", e);
            }
        }
    }

    async fn discover_class(&mut self, class: &str, cfg: &StorageClassConfig) -> Result<()> {
        let reclaim_policy = self.reclaim_policy(class).await?;
        let entries = self.vol_util.read_dir(Path::new(&cfg.mount_dir))?;

        for file_name in entries {
            if !cfg.matches_name(&file_name) {
                continue;
            }
            let host_path = Path::new(&cfg.host_dir)
                .join(&file_name)
                .to_string_lossy()
                .to_string();
            let pv_name = generate_pv_name(self.node_name(), &host_path);

            if self.cache.contains(&pv_name) {
                continue;
            }
            if self.backoff.should_skip(&pv_name) {
                debug!(pv = %pv_name, "Skipping entry during backoff window");
                continue;
            }

            match self
                .discover_entry(class, cfg, &file_name, &host_path, &pv_name, &reclaim_policy)
                .await
            {
                Ok(()) => self.backoff.record_success(&pv_name),
                Err(e) => {
                    warn!(
                        class,
                        file = %file_name,
                        pv = %pv_name,
                        "Cannot discover entry: {}", e
                    );
                    self.backoff.record_failure(&pv_name);
                }
            }
        }
        Ok(())
    }

    /// Effective reclaim policy for the class, from the cluster StorageClass
    /// object; statically provisioned local volumes default to Delete.
    async fn reclaim_policy(&self, class: &str) -> Result<String> {
        Ok(self
            .api
            .get_storage_class(class)
            .await?
            .and_then(|sc| sc.reclaim_policy)
            .unwrap_or_else(|| "Delete".to_string()))
    }

    async fn discover_entry(
        &self,
        class: &str,
        cfg: &StorageClassConfig,
        file_name: &str,
        host_path: &str,
        pv_name: &str,
        reclaim_policy: &str,
    ) -> Result<()> {
        let mount_path = Path::new(&cfg.mount_dir).join(file_name);

        let actual_mode = match probe_volume_mode(self.vol_util.as_ref(), &mount_path)? {
            Some(mode) => mode,
            None => {
                debug!(
                    path = %mount_path.display(),
                    "Skipping entry: not a directory nor a block device"
                );
                return Ok(());
            }
        };

        let capacity_bytes = match (cfg.volume_mode, actual_mode) {
            (VolumeMode::Filesystem, VolumeMode::Filesystem) => {
                if !cfg.allow_plain_dirs && !self.vol_util.is_likely_mount_point(&mount_path)? {
                    return Err(Error::Probe {
                        path: mount_path.display().to_string(),
                        reason: "not an independent mount point".to_string(),
                    });
                }
                self.vol_util.fs_capacity(&mount_path)?
            }
            // A block device published as a Filesystem volume is formatted
            // by the kubelet at mount time using the class fsType.
            (VolumeMode::Filesystem, VolumeMode::Block) => {
                self.vol_util.block_capacity(&mount_path)?
            }
            (VolumeMode::Block, VolumeMode::Block) => self.vol_util.block_capacity(&mount_path)?,
            (VolumeMode::Block, VolumeMode::Filesystem) => {
                debug!(
                    path = %mount_path.display(),
                    class,
                    "Skipping directory: class requires block mode"
                );
                return Ok(());
            }
        };

        if capacity_bytes == 0 {
            debug!(path = %mount_path.display(), "Skipping entry with unknown capacity");
            return Ok(());
        }

        let discovered = DiscoveredVolume {
            class_name: class.to_string(),
            file_name: file_name.to_string(),
            host_path: host_path.to_string(),
            mount_path: mount_path.to_string_lossy().to_string(),
            mode: cfg.volume_mode,
            capacity_bytes: round_down_capacity_pretty(capacity_bytes),
        };
        let pv = self.build_pv(&discovered, pv_name, reclaim_policy, cfg)?;

        match self.api.create_pv(pv.clone()).await {
            Ok(_) => {
                info!(
                    pv = %pv_name,
                    class,
                    path = %discovered.host_path,
                    capacity = discovered.capacity_bytes,
                    "Created PV"
                );
                if let Err(e) = self
                    .api
                    .emit_event(
                        &pv,
                        EventType::Normal,
                        "ProvisioningSucceeded",
                        &format!(
                            "Discovered local volume at {} on node {}",
                            discovered.host_path,
                            self.node_name()
                        ),
                    )
                    .await
                {
                    warn!(pv = %pv_name, "Cannot record provisioning event: {}", e);
                }
                Ok(())
            }
            Err(e) if e.is_already_exists() || e.is_conflict() => {
                debug!(pv = %pv_name, "PV already exists");
                Ok(())
            }
            Err(e) => {
                if let Err(event_err) = self
                    .api
                    .emit_event(
                        &pv,
                        EventType::Warning,
                        "ProvisioningFailed",
                        &format!("Cannot create PV for {}: {}", discovered.host_path, e),
                    )
                    .await
                {
                    warn!(pv = %pv_name, "Cannot record provisioning event: {}", event_err);
                }
                Err(e)
            }
        }
    }

    /// Build the PV object for a discovered medium.
    fn build_pv(
        &self,
        discovered: &DiscoveredVolume,
        pv_name: &str,
        reclaim_policy: &str,
        cfg: &StorageClassConfig,
    ) -> Result<PersistentVolume> {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            ANN_PROVISIONED_BY.to_string(),
            self.identity.as_str().to_string(),
        );

        let node_selector = self.node_selector(&cfg.selector);
        let mut node_affinity = None;
        if self.config.use_alpha_api {
            let affinity = NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(node_selector),
                ..Default::default()
            };
            annotations.insert(
                ALPHA_NODE_AFFINITY_ANNOTATION.to_string(),
                serde_json::to_string(&affinity)?,
            );
        } else {
            node_affinity = Some(VolumeNodeAffinity {
                required: Some(node_selector),
            });
        }

        let mut labels = self.config.labels_for_pv.clone();
        if let Some(node_labels) = self.node.metadata.labels.as_ref() {
            for key in &self.config.node_labels_for_pv {
                if let Some(value) = node_labels.get(key) {
                    labels.insert(key.clone(), value.clone());
                }
            }
        }

        let owner_references = if self.config.set_pv_owner_ref {
            Some(vec![OwnerReference {
                api_version: "v1".to_string(),
                kind: "Node".to_string(),
                name: self.node_name().to_string(),
                uid: self.node.metadata.uid.clone().unwrap_or_default(),
                ..Default::default()
            }])
        } else {
            None
        };

        let fs_type = match discovered.mode {
            VolumeMode::Filesystem => cfg.fs_type.clone(),
            VolumeMode::Block => None,
        };

        let mut capacity = BTreeMap::new();
        capacity.insert(
            "storage".to_string(),
            Quantity(format_binary_quantity(discovered.capacity_bytes)),
        );

        Ok(PersistentVolume {
            metadata: ObjectMeta {
                name: Some(pv_name.to_string()),
                labels: if labels.is_empty() { None } else { Some(labels) },
                annotations: Some(annotations),
                owner_references,
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity: Some(capacity),
                access_modes: Some(vec![cfg.access_mode.as_str().to_string()]),
                persistent_volume_reclaim_policy: Some(reclaim_policy.to_string()),
                storage_class_name: Some(discovered.class_name.clone()),
                volume_mode: Some(discovered.mode.as_str().to_string()),
                local: Some(LocalVolumeSource {
                    path: discovered.host_path.clone(),
                    fs_type,
                }),
                node_affinity,
                ..Default::default()
            }),
            status: None,
        })
    }

    /// Node selector pinning the PV to this host, intersected with the
    /// class selector terms: the hostname requirement is ANDed into every
    /// term, terms stay ORed per scheduler semantics.
    fn node_selector(&self, selector_terms: &[NodeSelectorTerm]) -> NodeSelector {
        let hostname_req = NodeSelectorRequirement {
            key: NODE_LABEL_KEY.to_string(),
            operator: "In".to_string(),
            values: Some(vec![self.node_name().to_string()]),
        };

        let terms = if selector_terms.is_empty() {
            vec![NodeSelectorTerm {
                match_expressions: Some(vec![hostname_req]),
                match_fields: None,
            }]
        } else {
            selector_terms
                .iter()
                .cloned()
                .map(|mut term| {
                    term.match_expressions
                        .get_or_insert_with(Vec::new)
                        .push(hostname_req.clone());
                    term
                })
                .collect()
        };

        NodeSelector {
            node_selector_terms: terms,
        }
    }
}
