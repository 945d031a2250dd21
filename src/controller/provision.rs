//! Controller lifecycle
//!
//! ```text
//!  Starting ──► WaitingForInformerSync ──► WaitingForNodeReady ──► Running ──► Stopped
//! ```
//!
//! Startup failures (node unresolvable, fatal config) surface to the
//! caller and end the process; transient failures inside the Running loop
//! stay inside their tick.

use crate::cache::{Populator, VolumeCache};
use crate::cleanup::{CleanupTracker, Deleter};
use crate::cluster::{ApiUtil, ClusterClientFactory, KubeApiUtil};
use crate::config::{ProvisionerConfig, ProvisionerIdentity};
use crate::discovery::{Discoverer, VolumeUtil};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Node;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Attempts to resolve this node at startup before giving up
const NODE_RESOLVE_ATTEMPTS: u32 = 8;

/// Attempts to clear the startup taint before giving up
const TAINT_REMOVAL_ATTEMPTS: u32 = 8;

/// Base delay for startup retry backoff, doubling per attempt
const STARTUP_RETRY_BASE: Duration = Duration::from_secs(1);

// =============================================================================
// Lifecycle States
// =============================================================================

/// Lifecycle of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Starting,
    WaitingForInformerSync,
    WaitingForNodeReady,
    Running,
    Stopped,
}

/// Tick interval drawn uniformly from `[min, 2*min)`; the jitter spreads
/// full scans of the API server across instances.
pub fn jittered_resync_period(min: Duration) -> Duration {
    let min_ms = min.as_millis().max(1) as u64;
    let ms = rand::thread_rng().gen_range(min_ms..min_ms * 2);
    Duration::from_millis(ms)
}

/// Resolve the Node object with exponential backoff up to a fatal cap.
pub async fn resolve_node(
    api: &dyn ApiUtil,
    node_name: &str,
    base_delay: Duration,
) -> Result<Node> {
    let mut delay = base_delay;
    for attempt in 1..=NODE_RESOLVE_ATTEMPTS {
        match api.get_node(node_name).await {
            Ok(node) => return Ok(node),
            Err(e) if attempt == NODE_RESOLVE_ATTEMPTS => {
                return Err(Error::NodeResolve {
                    node: node_name.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                warn!(
                    node = node_name,
                    attempt, "Cannot resolve node, retrying: {}", e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    unreachable!("loop returns on the last attempt")
}

/// Clear the startup taint when configured, retrying transient failures.
/// The control loop may only enter Running after this succeeds.
pub async fn ensure_node_ready(
    api: &dyn ApiUtil,
    config: &ProvisionerConfig,
    node_name: &str,
    base_delay: Duration,
) -> Result<()> {
    if !config.remove_node_not_ready_taint {
        return Ok(());
    }
    let taint_key = &config.provisioner_not_ready_node_taint_key;

    let mut delay = base_delay;
    for attempt in 1..=TAINT_REMOVAL_ATTEMPTS {
        match api.remove_node_taint(node_name, taint_key).await {
            Ok(()) => {
                info!(node = node_name, taint_key = %taint_key, "Startup taint cleared");
                return Ok(());
            }
            Err(e) if attempt == TAINT_REMOVAL_ATTEMPTS => {
                return Err(Error::Configuration(format!(
                    "cannot remove startup taint {} from node {}: {}",
                    taint_key, node_name, e
                )));
            }
            Err(e) => {
                warn!(
                    node = node_name,
                    attempt, "Cannot remove startup taint, retrying: {}", e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    unreachable!("loop returns on the last attempt")
}

// =============================================================================
// Provision Controller
// =============================================================================

/// Wires all provisioner parts together and drives them through the
/// lifecycle above.
pub struct ProvisionController {
    config: Arc<ProvisionerConfig>,
    node_name: String,
    namespace: String,
    job_image: String,
    client_factory: Arc<dyn ClusterClientFactory>,
    vol_util: Arc<dyn VolumeUtil>,
    request_timeout: Duration,
}

impl ProvisionController {
    pub fn new(
        config: ProvisionerConfig,
        node_name: String,
        namespace: String,
        job_image: String,
        client_factory: Arc<dyn ClusterClientFactory>,
        vol_util: Arc<dyn VolumeUtil>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            node_name,
            namespace,
            job_image,
            client_factory,
            vol_util,
            request_timeout: crate::cluster::DEFAULT_API_TIMEOUT,
        }
    }

    /// Deadline applied to every cluster write.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Run until the cancellation token fires. Outstanding cleanup
    /// processes are not killed on the way out; name-stable PVs let the
    /// next run pick up where this one stopped.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut state = ControllerState::Starting;
        info!(?state, node = %self.node_name, "Provisioner starting");

        let client = self.client_factory.build_client().await?;
        let bootstrap_api = KubeApiUtil::new(
            client.clone(),
            self.namespace.clone(),
            String::new(),
        )
        .with_request_timeout(self.request_timeout);
        let node = resolve_node(&bootstrap_api, &self.node_name, STARTUP_RETRY_BASE).await?;
        let identity =
            ProvisionerIdentity::from_node(&node, self.config.use_node_name_only);
        info!(identity = %identity, "Resolved provisioner identity");

        let api: Arc<dyn ApiUtil> = Arc::new(
            KubeApiUtil::new(
                client.clone(),
                self.namespace.clone(),
                identity.to_string(),
            )
            .with_request_timeout(self.request_timeout),
        );

        let cache = Arc::new(VolumeCache::new());
        let populator = Arc::new(Populator::new(identity.clone(), cache.clone()));
        let mut ready = populator.ready();
        {
            let populator = populator.clone();
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { populator.run(client, cancel).await });
        }

        state = ControllerState::WaitingForInformerSync;
        info!(?state, "Waiting for initial PV list");
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(state = ?ControllerState::Stopped, "Shutdown before initial sync");
                return Ok(());
            }
            result = ready.wait_for(|synced| *synced) => {
                result.map_err(|_| {
                    Error::Configuration("populator stopped before initial sync".to_string())
                })?;
            }
        }
        info!(cached = cache.len(), "Initial sync complete");

        state = ControllerState::WaitingForNodeReady;
        info!(?state, "Checking node readiness");
        ensure_node_ready(api.as_ref(), &self.config, &self.node_name, STARTUP_RETRY_BASE)
            .await?;

        let mut discoverer = Discoverer::new(
            self.config.clone(),
            identity.clone(),
            node,
            cache.clone(),
            self.vol_util.clone(),
            api.clone(),
        );
        let tracker = Arc::new(CleanupTracker::new());
        let mut deleter = Deleter::new(
            self.config.clone(),
            self.node_name.clone(),
            self.namespace.clone(),
            self.job_image.clone(),
            cache.clone(),
            self.vol_util.clone(),
            api.clone(),
            tracker,
        );

        state = ControllerState::Running;
        info!(?state, "Entering control loop");
        loop {
            // Ticks are serial: the next one cannot start until both
            // passes of the previous one have returned.
            discoverer.discover_once().await;
            deleter.delete_once().await;

            let period = jittered_resync_period(self.config.min_resync_period);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }

        state = ControllerState::Stopped;
        info!(?state, "Provisioner stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_node, test_config, FakeApiUtil};

    #[test]
    fn test_jitter_within_bounds() {
        let min = Duration::from_millis(100);
        for _ in 0..1000 {
            let period = jittered_resync_period(min);
            assert!(period >= min);
            assert!(period < min * 2);
        }
    }

    #[test]
    fn test_jitter_spreads() {
        let min = Duration::from_millis(1000);
        let draws: Vec<Duration> = (0..200).map(|_| jittered_resync_period(min)).collect();
        let first = draws[0];
        assert!(draws.iter().any(|d| *d != first));
    }

    #[tokio::test]
    async fn test_resolve_node_retries_until_fatal() {
        let api = FakeApiUtil::new();
        let err = resolve_node(&api, "n1", Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeResolve { .. }));
    }

    #[tokio::test]
    async fn test_resolve_node_success() {
        let api = FakeApiUtil::new();
        api.add_node(make_node("n1", "uid-1"));
        let node = resolve_node(&api, "n1", Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(node.metadata.name.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_node_ready_without_taint_flag() {
        let api = FakeApiUtil::new();
        let config = test_config();
        ensure_node_ready(&api, &config, "n1", Duration::from_millis(1))
            .await
            .unwrap();
        assert!(api.taint_removals().is_empty());
    }

    #[tokio::test]
    async fn test_node_ready_clears_startup_taint() {
        let api = FakeApiUtil::new();
        let mut config = test_config();
        config.remove_node_not_ready_taint = true;
        config.provisioner_not_ready_node_taint_key = "storage.k8s.io/not-ready".to_string();

        // Two conflicting writes before the patch goes through.
        api.fail_taint_removals(2);
        ensure_node_ready(&api, &config, "n1", Duration::from_millis(1))
            .await
            .unwrap();

        assert_eq!(
            api.taint_removals(),
            vec![("n1".to_string(), "storage.k8s.io/not-ready".to_string())]
        );
    }
}
