//! Cluster API façade
//!
//! Thin wrapper over the objects the provisioner manipulates: create/delete
//! PV, cleanup Jobs, Events, and node taint removal. Every call carries a
//! bounded deadline so the control loop never blocks indefinitely on the
//! API server.

use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, Node, ObjectReference, PersistentVolume};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use k8s_openapi::chrono::Utc;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams, PropagationPolicy};
use kube::Client;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Default deadline for individual cluster writes
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries for optimistic-concurrency conflicts on node updates
const TAINT_REMOVAL_CONFLICT_RETRIES: usize = 5;

// =============================================================================
// Event Types
// =============================================================================

/// Kubernetes event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

// =============================================================================
// API Util Port
// =============================================================================

/// Cluster operations used by the discoverer, deleter and controller.
#[async_trait]
pub trait ApiUtil: Send + Sync {
    /// Create a PV object. A Conflict/AlreadyExists response surfaces as an
    /// error; callers treat it as success for idempotence.
    async fn create_pv(&self, pv: PersistentVolume) -> Result<PersistentVolume>;

    /// Delete a PV by name. NotFound surfaces as an error; callers treat it
    /// as success.
    async fn delete_pv(&self, name: &str) -> Result<()>;

    /// Fetch the Node object for this host.
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Fetch a StorageClass, `None` when it does not exist.
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    /// Remove a taint from the node, retrying on write conflicts. An absent
    /// taint is success.
    async fn remove_node_taint(&self, node_name: &str, taint_key: &str) -> Result<()>;

    /// Create a cleanup Job.
    async fn create_job(&self, job: Job) -> Result<()>;

    /// Fetch a Job, `None` when it does not exist.
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Delete a Job and its pods.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    /// Record an event against a PV.
    async fn emit_event(
        &self,
        pv: &PersistentVolume,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

// =============================================================================
// Kubernetes Implementation
// =============================================================================

/// [`ApiUtil`] backed by a real cluster client.
pub struct KubeApiUtil {
    client: Client,
    /// Namespace events are recorded in (PVs are cluster-scoped)
    event_namespace: String,
    /// Source component written into events
    component: String,
    request_timeout: Duration,
}

impl KubeApiUtil {
    pub fn new(client: Client, event_namespace: String, component: String) -> Self {
        Self {
            client,
            event_namespace,
            component,
            request_timeout: DEFAULT_API_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::ApiTimeout(self.request_timeout)),
        }
    }
}

#[async_trait]
impl ApiUtil for KubeApiUtil {
    async fn create_pv(&self, pv: PersistentVolume) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        self.bounded(api.create(&PostParams::default(), &pv)).await
    }

    async fn delete_pv(&self, name: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        self.bounded(api.delete(name, &DeleteParams::default()))
            .await
            .map(|_| ())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        self.bounded(api.get(name)).await
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        self.bounded(api.get_opt(name)).await
    }

    async fn remove_node_taint(&self, node_name: &str, taint_key: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());

        for attempt in 0..TAINT_REMOVAL_CONFLICT_RETRIES {
            let mut node = self.bounded(api.get(node_name)).await?;

            let taints = node
                .spec
                .as_ref()
                .and_then(|spec| spec.taints.clone())
                .unwrap_or_default();
            let remaining: Vec<_> = taints
                .iter()
                .filter(|t| t.key != taint_key)
                .cloned()
                .collect();
            if remaining.len() == taints.len() {
                debug!(node = node_name, taint_key, "Taint already absent");
                return Ok(());
            }

            if let Some(spec) = node.spec.as_mut() {
                spec.taints = if remaining.is_empty() {
                    None
                } else {
                    Some(remaining)
                };
            }

            match self
                .bounded(api.replace(node_name, &PostParams::default(), &node))
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    warn!(
                        node = node_name,
                        attempt, "Conflict removing node taint, retrying"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Configuration(format!(
            "could not remove taint {} from node {} after {} attempts",
            taint_key, node_name, TAINT_REMOVAL_CONFLICT_RETRIES
        )))
    }

    async fn create_job(&self, job: Job) -> Result<()> {
        let namespace = job.metadata.namespace.clone().unwrap_or_default();
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        self.bounded(api.create(&PostParams::default(), &job))
            .await
            .map(|_| ())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(api.get_opt(name)).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        self.bounded(api.delete(name, &params)).await.map(|_| ())
    }

    async fn emit_event(
        &self,
        pv: &PersistentVolume,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let pv_name = pv.metadata.name.clone().unwrap_or_default();
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", pv_name)),
                namespace: Some(self.event_namespace.clone()),
                ..Default::default()
            },
            type_: Some(event_type.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: pv_object_ref(pv),
            count: Some(1),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            event_time: Some(MicroTime(now)),
            reporting_component: Some(self.component.clone()),
            reporting_instance: Some(self.component.clone()),
            ..Default::default()
        };

        let api: Api<Event> = Api::namespaced(self.client.clone(), &self.event_namespace);
        self.bounded(api.create(&PostParams::default(), &event))
            .await
            .map(|_| ())
    }
}

/// Object reference for events recorded against a PV.
pub fn pv_object_ref(pv: &PersistentVolume) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolume".to_string()),
        name: pv.metadata.name.clone(),
        uid: pv.metadata.uid.clone(),
        resource_version: pv.metadata.resource_version.clone(),
        ..Default::default()
    }
}
