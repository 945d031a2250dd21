//! Volume cache
//!
//! Authoritative in-memory map of PV name to PV object for the PVs this
//! node's provisioner instance owns. The populator is the only writer; the
//! discoverer and deleter read it on every tick. Entries leave the cache
//! only through informer delete events, never by direct removal from the
//! control loop.

use crate::config::ANN_PROVISIONED_BY;
use k8s_openapi::api::core::v1::PersistentVolume;
use parking_lot::RwLock;
use std::collections::HashMap;

// =============================================================================
// PV Accessors
// =============================================================================

/// Name of a PV, empty when unset.
pub fn pv_name(pv: &PersistentVolume) -> &str {
    pv.metadata.name.as_deref().unwrap_or_default()
}

/// Phase reported by the cluster, e.g. `Available`, `Bound`, `Released`.
pub fn pv_phase(pv: &PersistentVolume) -> &str {
    pv.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

/// Storage class name, empty when unset.
pub fn pv_storage_class(pv: &PersistentVolume) -> &str {
    pv.spec
        .as_ref()
        .and_then(|s| s.storage_class_name.as_deref())
        .unwrap_or_default()
}

/// Host path of the local volume source, if this is a local PV.
pub fn pv_local_path(pv: &PersistentVolume) -> Option<&str> {
    pv.spec
        .as_ref()
        .and_then(|s| s.local.as_ref())
        .map(|l| l.path.as_str())
}

/// Volume mode, defaulting to `Filesystem` as the API server does.
pub fn pv_volume_mode(pv: &PersistentVolume) -> &str {
    pv.spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        .unwrap_or("Filesystem")
}

/// Reclaim policy, defaulting to `Retain` as the API server does for
/// statically created PVs.
pub fn pv_reclaim_policy(pv: &PersistentVolume) -> &str {
    pv.spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        .unwrap_or("Retain")
}

/// Value of the provisioned-by annotation, if any.
pub fn pv_provisioned_by(pv: &PersistentVolume) -> Option<&str> {
    pv.metadata
        .annotations
        .as_ref()
        .and_then(|anns| anns.get(ANN_PROVISIONED_BY))
        .map(String::as_str)
}

/// True when the PV is a local volume provisioned by the given identity.
pub fn pv_owned_by(pv: &PersistentVolume, identity: &str) -> bool {
    pv_provisioned_by(pv) == Some(identity) && pv_local_path(pv).is_some()
}

// =============================================================================
// Volume Cache
// =============================================================================

/// Authoritative set of PVs owned by this node.
#[derive(Default)]
pub struct VolumeCache {
    pvs: RwLock<HashMap<String, PersistentVolume>>,
}

impl VolumeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a PV. Populator only.
    pub fn add(&self, pv: PersistentVolume) {
        let name = pv_name(&pv).to_string();
        if name.is_empty() {
            return;
        }
        self.pvs.write().insert(name, pv);
    }

    /// Refresh a PV from an informer update. Populator only.
    pub fn update(&self, pv: PersistentVolume) {
        self.add(pv);
    }

    /// Drop a PV after its informer delete event. Populator only.
    pub fn delete(&self, name: &str) {
        self.pvs.write().remove(name);
    }

    /// Replace the whole cache with the result of a fresh list. Populator
    /// only; used at initial sync and after watch re-lists so stale entries
    /// cannot survive a desync.
    pub fn replace_all(&self, pvs: Vec<PersistentVolume>) {
        let mut map = HashMap::with_capacity(pvs.len());
        for pv in pvs {
            let name = pv_name(&pv).to_string();
            if !name.is_empty() {
                map.insert(name, pv);
            }
        }
        *self.pvs.write() = map;
    }

    pub fn get(&self, name: &str) -> Option<PersistentVolume> {
        self.pvs.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pvs.read().contains_key(name)
    }

    /// Snapshot of all cached PVs.
    pub fn list(&self) -> Vec<PersistentVolume> {
        self.pvs.read().values().cloned().collect()
    }

    /// Snapshot of cached PVs with the given storage class.
    pub fn list_by_class(&self, class: &str) -> Vec<PersistentVolume> {
        self.pvs
            .read()
            .values()
            .filter(|pv| pv_storage_class(pv) == class)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pvs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pvs.read().is_empty()
    }
}
