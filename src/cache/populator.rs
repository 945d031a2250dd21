//! Cache populator
//!
//! Long-lived pump that watches PV objects, filters them to the ones owned
//! by this provisioner instance, and writes them through to the
//! [`VolumeCache`]. The control loop is gated on the `ready` latch, which
//! flips after the initial list completes; it never flips back.

use crate::cache::store::{pv_name, pv_owned_by, VolumeCache};
use crate::config::ProvisionerIdentity;
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::Api;
use kube::runtime::watcher;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause before polling the watch stream again after it reports an error
const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Mirrors this node's PVs into the [`VolumeCache`].
pub struct Populator {
    identity: ProvisionerIdentity,
    cache: Arc<VolumeCache>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Populator {
    pub fn new(identity: ProvisionerIdentity, cache: Arc<VolumeCache>) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            identity,
            cache,
            ready_tx,
            ready_rx,
        }
    }

    /// Latch that flips to `true` once the initial PV list has been synced
    /// into the cache.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    /// Run the watch pump until cancelled. Watch errors are logged and the
    /// stream resumes with a fresh list; the cache is atomically replaced on
    /// each re-list so stale entries cannot survive.
    pub async fn run(&self, client: Client, cancel: CancellationToken) {
        let api: Api<PersistentVolume> = Api::all(client);
        let mut stream = watcher(api, watcher::Config::default()).boxed();
        let mut sync = InitialSync::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Populator shutting down");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(ev)) => self.apply_watch_event(ev, &mut sync),
                    Some(Err(e)) => {
                        warn!("PV watch error, stream will re-list: {}", e);
                        tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
                    }
                    None => {
                        warn!("PV watch stream ended");
                        return;
                    }
                },
            }
        }
    }

    /// Apply one watch event to the cache. Separated from the pump so the
    /// event handling is testable without a cluster.
    pub fn apply_watch_event(
        &self,
        event: watcher::Event<PersistentVolume>,
        sync: &mut InitialSync,
    ) {
        match event {
            watcher::Event::Init => {
                sync.buffer.clear();
            }
            watcher::Event::InitApply(pv) => {
                if pv_owned_by(&pv, self.identity.as_str()) {
                    sync.buffer.push(pv);
                }
            }
            watcher::Event::InitDone => {
                let pvs = std::mem::take(&mut sync.buffer);
                info!("Initial PV list complete, {} owned by this node", pvs.len());
                self.cache.replace_all(pvs);
                self.ready_tx.send_replace(true);
            }
            watcher::Event::Apply(pv) => {
                if pv_owned_by(&pv, self.identity.as_str()) {
                    debug!(pv = pv_name(&pv), "Caching PV from watch");
                    self.cache.update(pv);
                }
            }
            watcher::Event::Delete(pv) => {
                if pv_owned_by(&pv, self.identity.as_str()) {
                    debug!(pv = pv_name(&pv), "Dropping deleted PV from cache");
                    self.cache.delete(pv_name(&pv));
                }
            }
        }
    }
}

/// Buffer for the list phase of a (re-)sync.
#[derive(Default)]
pub struct InitialSync {
    buffer: Vec<PersistentVolume>,
}
