//! Shared test fixtures
//!
//! Fakes for the OS probe and cluster API ports plus object builders, used
//! by the discovery, cleanup and controller tests.

use crate::cluster::{ApiUtil, EventType};
use crate::config::{
    AccessMode, ProvisionerConfig, ProvisionerIdentity, StorageClassConfig, StorageClassTable,
    VolumeMode, ANN_PROVISIONED_BY,
};
use crate::discovery::volume::VolumeUtil;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    LocalVolumeSource, Node, PersistentVolume, PersistentVolumeSpec, PersistentVolumeStatus,
};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::ObjectMeta;
use kube::core::ErrorResponse;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

// =============================================================================
// Object Builders
// =============================================================================

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: String::new(),
        reason: reason.to_string(),
        code,
    }))
}

pub fn make_node(name: &str, uid: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn test_identity() -> ProvisionerIdentity {
    ProvisionerIdentity::from_node(&make_node("n1", "uid-1"), false)
}

pub fn make_local_pv(name: &str, class: &str, path: &str, identity: &str) -> PersistentVolume {
    let mut annotations = BTreeMap::new();
    annotations.insert(ANN_PROVISIONED_BY.to_string(), identity.to_string());
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            storage_class_name: Some(class.to_string()),
            persistent_volume_reclaim_policy: Some("Delete".to_string()),
            volume_mode: Some("Filesystem".to_string()),
            local: Some(LocalVolumeSource {
                path: path.to_string(),
                fs_type: None,
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some("Available".to_string()),
            ..Default::default()
        }),
    }
}

pub fn released(mut pv: PersistentVolume) -> PersistentVolume {
    pv.status.get_or_insert_with(Default::default).phase = Some("Released".to_string());
    pv
}

pub fn with_reclaim(mut pv: PersistentVolume, policy: &str) -> PersistentVolume {
    pv.spec
        .get_or_insert_with(Default::default)
        .persistent_volume_reclaim_policy = Some(policy.to_string());
    pv
}

pub fn with_volume_mode(mut pv: PersistentVolume, mode: &str) -> PersistentVolume {
    pv.spec.get_or_insert_with(Default::default).volume_mode = Some(mode.to_string());
    pv
}

pub fn raw_class_config(host_dir: &str, mount_dir: &str) -> StorageClassConfig {
    StorageClassConfig {
        host_dir: host_dir.to_string(),
        mount_dir: mount_dir.to_string(),
        block_cleaner_command: Vec::new(),
        volume_mode: VolumeMode::Block,
        access_mode: AccessMode::default(),
        fs_type: None,
        name_pattern: String::new(),
        allow_plain_dirs: false,
        selector: Vec::new(),
    }
}

/// Two classes: `fast` (Filesystem under /mnt/fast) and `raw` (Block under
/// /mnt/raw).
pub fn test_config() -> ProvisionerConfig {
    let mut classes = BTreeMap::new();
    classes.insert(
        "fast".to_string(),
        StorageClassConfig {
            host_dir: "/mnt/fast".to_string(),
            mount_dir: "/mnt/fast".to_string(),
            block_cleaner_command: Vec::new(),
            volume_mode: VolumeMode::Filesystem,
            access_mode: AccessMode::default(),
            fs_type: None,
            name_pattern: String::new(),
            allow_plain_dirs: false,
            selector: Vec::new(),
        },
    );
    classes.insert("raw".to_string(), raw_class_config("/mnt/raw", "/mnt/raw"));

    ProvisionerConfig {
        classes: StorageClassTable::new(classes).unwrap(),
        ..Default::default()
    }
}

// =============================================================================
// Fake Volume Util
// =============================================================================

/// One scripted probe target.
#[derive(Debug, Clone)]
pub struct FakeVolume {
    pub path: String,
    pub is_dir: bool,
    pub is_block: bool,
    pub is_mount_point: bool,
    pub capacity: u64,
}

impl FakeVolume {
    pub fn dir(path: &str, capacity: u64) -> Self {
        Self {
            path: path.to_string(),
            is_dir: true,
            is_block: false,
            is_mount_point: false,
            capacity,
        }
    }

    pub fn block(path: &str, capacity: u64) -> Self {
        Self {
            path: path.to_string(),
            is_dir: false,
            is_block: true,
            is_mount_point: false,
            capacity,
        }
    }

    pub fn mount_point(mut self) -> Self {
        self.is_mount_point = true;
        self
    }
}

/// [`VolumeUtil`] answering from a scripted set of entries.
pub struct FakeVolumeUtil {
    volumes: HashMap<String, FakeVolume>,
}

impl FakeVolumeUtil {
    pub fn new(volumes: Vec<FakeVolume>) -> Self {
        Self {
            volumes: volumes
                .into_iter()
                .map(|v| (v.path.clone(), v))
                .collect(),
        }
    }

    fn lookup(&self, path: &Path) -> Result<&FakeVolume> {
        self.volumes
            .get(&path.to_string_lossy().to_string())
            .ok_or_else(|| Error::Probe {
                path: path.display().to_string(),
                reason: "no such file or directory".to_string(),
            })
    }
}

impl VolumeUtil for FakeVolumeUtil {
    fn is_dir(&self, path: &Path) -> Result<bool> {
        Ok(self.lookup(path)?.is_dir)
    }

    fn is_block(&self, path: &Path) -> Result<bool> {
        Ok(self.lookup(path)?.is_block)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .volumes
            .values()
            .filter(|v| Path::new(&v.path).parent() == Some(path))
            .filter_map(|v| {
                Path::new(&v.path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn fs_capacity(&self, path: &Path) -> Result<u64> {
        Ok(self.lookup(path)?.capacity)
    }

    fn block_capacity(&self, path: &Path) -> Result<u64> {
        Ok(self.lookup(path)?.capacity)
    }

    fn is_likely_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.lookup(path)?.is_mount_point)
    }
}

// =============================================================================
// Fake API Util
// =============================================================================

/// Recording [`ApiUtil`] with cluster-like idempotence semantics.
#[derive(Default)]
pub struct FakeApiUtil {
    created: Mutex<Vec<PersistentVolume>>,
    deleted: Mutex<Vec<String>>,
    /// (pv, type, reason, message)
    events: Mutex<Vec<(String, String, String, String)>>,
    jobs: Mutex<BTreeMap<(String, String), Job>>,
    nodes: Mutex<HashMap<String, Node>>,
    storage_classes: Mutex<HashMap<String, StorageClass>>,
    taints_removed: Mutex<Vec<(String, String)>>,
    taint_conflicts: AtomicUsize,
}

impl FakeApiUtil {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.nodes.lock().insert(name, node);
    }

    pub fn add_storage_class(&self, sc: StorageClass) {
        let name = sc.metadata.name.clone().unwrap_or_default();
        self.storage_classes.lock().insert(name, sc);
    }

    /// The next `n` taint removals answer with a write conflict.
    pub fn fail_taint_removals(&self, n: usize) {
        self.taint_conflicts.store(n, Ordering::SeqCst);
    }

    /// Flip a stored Job to a terminal condition.
    pub fn finish_job(&self, namespace: &str, name: &str, success: bool) {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get_mut(&(namespace.to_string(), name.to_string())) {
            let type_ = if success { "Complete" } else { "Failed" };
            job.status = Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }

    pub fn created_pvs(&self) -> Vec<PersistentVolume> {
        self.created.lock().clone()
    }

    pub fn deleted_pvs(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    pub fn events(&self) -> Vec<(String, String, String, String)> {
        self.events.lock().clone()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().values().cloned().collect()
    }

    pub fn taint_removals(&self) -> Vec<(String, String)> {
        self.taints_removed.lock().clone()
    }
}

#[async_trait]
impl ApiUtil for FakeApiUtil {
    async fn create_pv(&self, pv: PersistentVolume) -> Result<PersistentVolume> {
        let name = pv.metadata.name.clone().unwrap_or_default();
        let mut created = self.created.lock();
        if created
            .iter()
            .any(|existing| existing.metadata.name.as_deref() == Some(name.as_str()))
        {
            return Err(api_error(409, "AlreadyExists"));
        }
        created.push(pv.clone());
        Ok(pv)
    }

    async fn delete_pv(&self, name: &str) -> Result<()> {
        self.deleted.lock().push(name.to_string());
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self.storage_classes.lock().get(name).cloned())
    }

    async fn remove_node_taint(&self, node_name: &str, taint_key: &str) -> Result<()> {
        if self
            .taint_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(api_error(409, "Conflict"));
        }
        self.taints_removed
            .lock()
            .push((node_name.to_string(), taint_key.to_string()));
        Ok(())
    }

    async fn create_job(&self, job: Job) -> Result<()> {
        let key = (
            job.metadata.namespace.clone().unwrap_or_default(),
            job.metadata.name.clone().unwrap_or_default(),
        );
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        jobs.insert(key, job);
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .jobs
            .lock()
            .remove(&(namespace.to_string(), name.to_string()))
        {
            Some(_) => Ok(()),
            None => Err(api_error(404, "NotFound")),
        }
    }

    async fn emit_event(
        &self,
        pv: &PersistentVolume,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        self.events.lock().push((
            pv.metadata.name.clone().unwrap_or_default(),
            event_type.as_str().to_string(),
            reason.to_string(),
            message.to_string(),
        ));
        Ok(())
    }
}
