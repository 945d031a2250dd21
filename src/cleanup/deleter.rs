//! Released-volume deleter
//!
//! One pass per tick over the volume cache: every Released PV with a
//! Delete reclaim policy is driven through cleanup and, once the wipe has
//! succeeded, removed from the cluster. The cache entry itself is dropped
//! only by the populator when the delete event arrives.

use crate::backoff::EntryBackoff;
use crate::cache::store::{
    pv_local_path, pv_name, pv_phase, pv_reclaim_policy, pv_storage_class, pv_volume_mode,
    VolumeCache,
};
use crate::cleanup::job::{build_cleanup_job, cleanup_job_name, job_terminal_state, CleanupJobSpec};
use crate::cleanup::tracker::{CleanupKind, CleanupState, CleanupTracker};
use crate::cluster::{ApiUtil, EventType};
use crate::config::{
    ProvisionerConfig, StorageClassConfig, VolumeMode, EVENT_VOLUME_FAILED_DELETE,
    LOCAL_PV_BLKDEVICE_ENV, LOCAL_PV_FILESYSTEM_ENV,
};
use crate::discovery::volume::{probe_volume_mode, VolumeUtil};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::PersistentVolume;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How often a Job observer polls for a terminal state
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Path of a PV as seen from inside this process: the class `hostDir`
/// prefix remapped to `mountDir`.
pub fn container_path(
    cfg: &StorageClassConfig,
    host_path: &str,
    pv: &str,
) -> Result<String> {
    let relative = Path::new(host_path)
        .strip_prefix(&cfg.host_dir)
        .map_err(|_| Error::CleanupFailed {
            pv: pv.to_string(),
            reason: format!(
                "path {} is outside the class host dir {}",
                host_path, cfg.host_dir
            ),
        })?;
    Ok(Path::new(&cfg.mount_dir)
        .join(relative)
        .to_string_lossy()
        .to_string())
}

// =============================================================================
// Deleter
// =============================================================================

/// Reacts to Released PVs: wipes the medium, then deletes the PV object.
pub struct Deleter {
    config: Arc<ProvisionerConfig>,
    node_name: String,
    /// Namespace cleanup Jobs run in
    namespace: String,
    /// Container image for cleanup Jobs
    job_image: String,
    cache: Arc<VolumeCache>,
    vol_util: Arc<dyn VolumeUtil>,
    api: Arc<dyn ApiUtil>,
    tracker: Arc<CleanupTracker>,
    backoff: EntryBackoff,
}

impl Deleter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ProvisionerConfig>,
        node_name: String,
        namespace: String,
        job_image: String,
        cache: Arc<VolumeCache>,
        vol_util: Arc<dyn VolumeUtil>,
        api: Arc<dyn ApiUtil>,
        tracker: Arc<CleanupTracker>,
    ) -> Self {
        Self {
            config,
            node_name,
            namespace,
            job_image,
            cache,
            vol_util,
            api,
            tracker,
            backoff: EntryBackoff::default(),
        }
    }

    /// One deletion pass. Per-PV failures never abort the pass.
    pub async fn delete_once(&mut self) {
        self.backoff.advance_tick();
        for pv in self.cache.list() {
            let name = pv_name(&pv).to_string();

            if pv_phase(&pv) != "Released" {
                continue;
            }
            // Retain media are never touched.
            if pv_reclaim_policy(&pv) != "Delete" {
                debug!(pv = %name, "Reclaim policy is not Delete, skipping");
                continue;
            }

            match self.tracker.status(&name) {
                Some(CleanupState::InFlight) => continue,
                Some(CleanupState::Succeeded) => self.delete_pv_object(&pv).await,
                Some(CleanupState::Failed) => self.record_cleanup_failure(&pv).await,
                None => {
                    if self.backoff.should_skip(&name) {
                        debug!(pv = %name, "Skipping cleanup during backoff window");
                        continue;
                    }
                    if let Err(e) = self.start_cleanup(&pv).await {
                        warn!(pv = %name, "Cannot start cleanup: {}", e);
                        self.emit_failed_delete(&pv, &format!("Cleanup not started: {}", e))
                            .await;
                        self.backoff.record_failure(&name);
                    }
                }
            }
        }
    }

    /// The wipe finished; remove the PV object. NotFound counts as done.
    async fn delete_pv_object(&mut self, pv: &PersistentVolume) {
        let name = pv_name(pv).to_string();
        match self.api.delete_pv(&name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(pv = %name, "PV already deleted");
            }
            Err(e) => {
                // Keep the Succeeded entry so the next tick retries the
                // delete without re-running the wipe.
                warn!(pv = %name, "Cannot delete PV: {}", e);
                return;
            }
        }
        info!(pv = %name, "Deleted PV after successful cleanup");
        self.retire_entry(&name).await;
        self.backoff.record_success(&name);
    }

    /// The wipe failed; surface it and clear the tracker so the next tick
    /// can retry from scratch.
    async fn record_cleanup_failure(&mut self, pv: &PersistentVolume) {
        let name = pv_name(pv).to_string();
        warn!(pv = %name, "Cleanup failed, leaving PV for retry");
        self.emit_failed_delete(pv, "Cleanup of the volume failed and will be retried")
            .await;
        self.retire_entry(&name).await;
        self.backoff.record_failure(&name);
    }

    /// Drop the tracker entry, deleting the backing Job when there is one.
    async fn retire_entry(&self, name: &str) {
        if let Some(CleanupKind::Job { namespace, name: job_name }) = self.tracker.kind(name) {
            match self.api.delete_job(&namespace, &job_name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(job = %job_name, "Cannot delete cleanup job: {}", e),
            }
        }
        self.tracker.remove(name);
    }

    async fn emit_failed_delete(&self, pv: &PersistentVolume, message: &str) {
        if let Err(e) = self
            .api
            .emit_event(pv, EventType::Warning, EVENT_VOLUME_FAILED_DELETE, message)
            .await
        {
            warn!(pv = pv_name(pv), "Cannot record event: {}", e);
        }
    }

    /// Validate that the medium still matches the PV, then start a wipe.
    async fn start_cleanup(&self, pv: &PersistentVolume) -> Result<()> {
        let name = pv_name(pv).to_string();
        let class = pv_storage_class(pv).to_string();
        let cfg = self
            .config
            .classes
            .get(&class)
            .ok_or_else(|| Error::ClassNotConfigured {
                class: class.clone(),
                pv: name.clone(),
            })?;
        let host_path = pv_local_path(pv).ok_or_else(|| Error::CleanupFailed {
            pv: name.clone(),
            reason: "PV has no local volume source".to_string(),
        })?;
        let mount_path = container_path(cfg, host_path, &name)?;

        let actual_mode = probe_volume_mode(self.vol_util.as_ref(), Path::new(&mount_path))?
            .ok_or_else(|| Error::CleanupFailed {
                pv: name.clone(),
                reason: format!("{} is no longer a directory or block device", mount_path),
            })?;
        if actual_mode.as_str() != pv_volume_mode(pv) {
            // Mode changed underneath the PV; operator intervention needed.
            return Err(Error::CleanupFailed {
                pv: name.clone(),
                reason: format!(
                    "volume mode changed from {} to {}, not touching the medium",
                    pv_volume_mode(pv),
                    actual_mode
                ),
            });
        }

        let env_name = match actual_mode {
            VolumeMode::Block => LOCAL_PV_BLKDEVICE_ENV,
            VolumeMode::Filesystem => LOCAL_PV_FILESYSTEM_ENV,
        };

        if self.config.use_job_for_cleaning {
            self.start_job_cleanup(&name, cfg, env_name, &mount_path)
                .await?;
        } else {
            self.start_process_cleanup(&name, cfg, env_name, &mount_path)?;
        }

        if let Err(e) = self
            .api
            .emit_event(
                pv,
                EventType::Normal,
                "CleanupStarted",
                &format!("Started cleanup of volume at {}", host_path),
            )
            .await
        {
            warn!(pv = %name, "Cannot record event: {}", e);
        }
        Ok(())
    }

    /// Inline cleanup: spawn the class cleaner command and observe its exit
    /// code from a background task.
    fn start_process_cleanup(
        &self,
        pv: &str,
        cfg: &StorageClassConfig,
        env_name: &str,
        mount_path: &str,
    ) -> Result<()> {
        let entry = self
            .tracker
            .insert_process(pv)
            .ok_or_else(|| Error::CleanupInProgress { pv: pv.to_string() })?;

        let argv = &cfg.block_cleaner_command;
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .env(env_name, mount_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.tracker.remove(pv);
                return Err(Error::CleanupFailed {
                    pv: pv.to_string(),
                    reason: format!("cannot spawn {:?}: {}", argv[0], e),
                });
            }
        };
        info!(pv, command = ?argv, path = mount_path, "Started cleanup process");

        let pv = pv.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    if status.success() {
                        debug!(pv = %pv, "Cleanup process finished");
                    } else {
                        warn!(pv = %pv, code = ?status.code(), "Cleanup process failed");
                    }
                    entry.finish(status.success());
                }
                Err(e) => {
                    warn!(pv = %pv, "Cannot observe cleanup process: {}", e);
                    entry.finish(false);
                }
            }
        });
        Ok(())
    }

    /// Job cleanup: create the Job and poll it to a terminal phase from a
    /// background task.
    async fn start_job_cleanup(
        &self,
        pv: &str,
        cfg: &StorageClassConfig,
        env_name: &str,
        mount_path: &str,
    ) -> Result<()> {
        if self.job_image.is_empty() {
            return Err(Error::CleanupFailed {
                pv: pv.to_string(),
                reason: "no job container image configured".to_string(),
            });
        }

        let job_name = cleanup_job_name(pv);
        let job = build_cleanup_job(&CleanupJobSpec {
            pv_name: pv,
            namespace: &self.namespace,
            image: &self.job_image,
            command: &cfg.block_cleaner_command,
            env_name,
            mount_path,
            host_dir: &cfg.host_dir,
            mount_dir: &cfg.mount_dir,
            node_name: &self.node_name,
            tolerations: &self.config.job_tolerations,
        });

        match self.api.create_job(job).await {
            Ok(()) => {}
            // A job from a previous incarnation is still there; observe it.
            Err(e) if e.is_already_exists() => {
                debug!(job = %job_name, "Cleanup job already exists, observing it");
            }
            Err(e) => return Err(e),
        }

        let entry = self
            .tracker
            .insert_job(pv, &self.namespace, &job_name)
            .ok_or_else(|| Error::CleanupInProgress { pv: pv.to_string() })?;
        info!(pv, job = %job_name, "Started cleanup job");

        let api = self.api.clone();
        let namespace = self.namespace.clone();
        let pv = pv.to_string();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(JOB_POLL_INTERVAL).await;
                match api.get_job(&namespace, &job_name).await {
                    Ok(Some(job)) => {
                        if let Some(succeeded) = job_terminal_state(&job) {
                            if !succeeded {
                                warn!(pv = %pv, job = %job_name, "Cleanup job failed");
                            }
                            entry.finish(succeeded);
                            return;
                        }
                    }
                    Ok(None) => {
                        warn!(pv = %pv, job = %job_name, "Cleanup job disappeared");
                        entry.finish(false);
                        return;
                    }
                    Err(e) => {
                        debug!(job = %job_name, "Cannot poll cleanup job: {}", e);
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageClassTable;
    use crate::testing::{
        make_local_pv, released, test_config, test_identity, with_reclaim, with_volume_mode,
        FakeApiUtil, FakeVolume, FakeVolumeUtil,
    };
    use std::collections::BTreeMap;

    fn config_with_cleaner(command: &[&str], use_job: bool) -> ProvisionerConfig {
        let mut config = test_config();
        let mut classes = BTreeMap::new();
        for (name, cfg) in config.classes.iter() {
            let mut cfg = cfg.clone();
            cfg.block_cleaner_command = command.iter().map(|s| s.to_string()).collect();
            classes.insert(name.to_string(), cfg);
        }
        config.classes = StorageClassTable::new(classes).unwrap();
        config.use_job_for_cleaning = use_job;
        config
    }

    fn deleter(
        config: ProvisionerConfig,
        volumes: Vec<FakeVolume>,
        api: Arc<FakeApiUtil>,
        cache: Arc<VolumeCache>,
        tracker: Arc<CleanupTracker>,
    ) -> Deleter {
        Deleter::new(
            Arc::new(config),
            "n1".to_string(),
            "storage".to_string(),
            "registry.example.com/cleaner:v1".to_string(),
            cache,
            Arc::new(FakeVolumeUtil::new(volumes)),
            api,
            tracker,
        )
    }

    fn released_block_pv(name: &str, path: &str) -> PersistentVolume {
        released(with_volume_mode(
            with_reclaim(
                make_local_pv(name, "raw", path, test_identity().as_str()),
                "Delete",
            ),
            "Block",
        ))
    }

    async fn wait_for_state(
        tracker: &CleanupTracker,
        pv: &str,
        state: CleanupState,
    ) {
        for _ in 0..1000 {
            if tracker.status(pv) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cleanup of {} never reached {:?}", pv, state);
    }

    #[tokio::test]
    async fn test_released_pv_cleaned_and_deleted() {
        let api = Arc::new(FakeApiUtil::new());
        let cache = Arc::new(VolumeCache::new());
        let tracker = Arc::new(CleanupTracker::new());
        cache.add(released_block_pv("pv-x", "/mnt/raw/sdb"));

        // The cleaner only succeeds when handed the device path in the
        // documented environment variable.
        let mut d = deleter(
            config_with_cleaner(
                &["/bin/sh", "-c", "test \"$LOCAL_PV_BLKDEVICE\" = /mnt/raw/sdb"],
                false,
            ),
            vec![FakeVolume::block("/mnt/raw/sdb", 10 * crate::discovery::GIB)],
            api.clone(),
            cache.clone(),
            tracker.clone(),
        );

        d.delete_once().await;
        assert!(tracker.status("pv-x").is_some());
        wait_for_state(&tracker, "pv-x", CleanupState::Succeeded).await;

        d.delete_once().await;
        assert_eq!(api.deleted_pvs(), vec!["pv-x".to_string()]);
        assert_eq!(tracker.status("pv-x"), None);
    }

    #[tokio::test]
    async fn test_failed_cleanup_emits_event_and_retries() {
        let api = Arc::new(FakeApiUtil::new());
        let cache = Arc::new(VolumeCache::new());
        let tracker = Arc::new(CleanupTracker::new());
        cache.add(released_block_pv("pv-x", "/mnt/raw/sdb"));

        let mut d = deleter(
            config_with_cleaner(&["/bin/sh", "-c", "exit 1"], false),
            vec![FakeVolume::block("/mnt/raw/sdb", 10 * crate::discovery::GIB)],
            api.clone(),
            cache.clone(),
            tracker.clone(),
        );

        d.delete_once().await;
        wait_for_state(&tracker, "pv-x", CleanupState::Failed).await;

        // Failure tick: event recorded, PV kept, tracker cleared.
        d.delete_once().await;
        assert!(api.deleted_pvs().is_empty());
        assert!(api
            .events()
            .iter()
            .any(|(pv, _, reason, _)| pv == "pv-x" && reason == EVENT_VOLUME_FAILED_DELETE));
        assert_eq!(tracker.status("pv-x"), None);

        // Next tick starts the wipe again.
        d.delete_once().await;
        assert!(tracker.status("pv-x").is_some());
    }

    #[tokio::test]
    async fn test_at_most_one_cleanup_per_pv() {
        let api = Arc::new(FakeApiUtil::new());
        let cache = Arc::new(VolumeCache::new());
        let tracker = Arc::new(CleanupTracker::new());
        cache.add(released_block_pv("pv-x", "/mnt/raw/sdb"));

        let mut d = deleter(
            config_with_cleaner(&["/bin/sh", "-c", "sleep 0.5"], false),
            vec![FakeVolume::block("/mnt/raw/sdb", 10 * crate::discovery::GIB)],
            api.clone(),
            cache.clone(),
            tracker.clone(),
        );

        d.delete_once().await;
        d.delete_once().await;
        d.delete_once().await;

        let starts = api
            .events()
            .iter()
            .filter(|(_, _, reason, _)| reason == "CleanupStarted")
            .count();
        assert_eq!(starts, 1);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_retain_policy_never_cleaned() {
        let api = Arc::new(FakeApiUtil::new());
        let cache = Arc::new(VolumeCache::new());
        let tracker = Arc::new(CleanupTracker::new());
        cache.add(released(with_volume_mode(
            with_reclaim(
                make_local_pv("pv-x", "raw", "/mnt/raw/sdb", test_identity().as_str()),
                "Retain",
            ),
            "Block",
        )));

        let mut d = deleter(
            config_with_cleaner(&["/bin/sh", "-c", "exit 0"], false),
            vec![FakeVolume::block("/mnt/raw/sdb", 10 * crate::discovery::GIB)],
            api.clone(),
            cache.clone(),
            tracker.clone(),
        );

        d.delete_once().await;

        assert!(tracker.is_empty());
        assert!(api.deleted_pvs().is_empty());
        assert!(api.events().is_empty());
    }

    #[tokio::test]
    async fn test_bound_pv_untouched() {
        let api = Arc::new(FakeApiUtil::new());
        let cache = Arc::new(VolumeCache::new());
        let tracker = Arc::new(CleanupTracker::new());
        let mut pv = released_block_pv("pv-x", "/mnt/raw/sdb");
        pv.status.as_mut().unwrap().phase = Some("Bound".to_string());
        cache.add(pv);

        let mut d = deleter(
            config_with_cleaner(&["/bin/sh", "-c", "exit 0"], false),
            vec![FakeVolume::block("/mnt/raw/sdb", 10 * crate::discovery::GIB)],
            api.clone(),
            cache.clone(),
            tracker.clone(),
        );
        d.delete_once().await;

        assert!(tracker.is_empty());
        assert!(api.deleted_pvs().is_empty());
    }

    #[tokio::test]
    async fn test_mode_change_blocks_cleanup() {
        let api = Arc::new(FakeApiUtil::new());
        let cache = Arc::new(VolumeCache::new());
        let tracker = Arc::new(CleanupTracker::new());
        cache.add(released_block_pv("pv-x", "/mnt/raw/sdb"));

        // The medium now probes as a directory, not the block device the
        // PV was created for.
        let mut d = deleter(
            config_with_cleaner(&["/bin/sh", "-c", "exit 0"], false),
            vec![FakeVolume::dir("/mnt/raw/sdb", 10 * crate::discovery::GIB).mount_point()],
            api.clone(),
            cache.clone(),
            tracker.clone(),
        );
        d.delete_once().await;

        assert!(tracker.is_empty());
        assert!(api.deleted_pvs().is_empty());
        assert!(api
            .events()
            .iter()
            .any(|(_, _, reason, message)| reason == EVENT_VOLUME_FAILED_DELETE
                && message.contains("volume mode changed")));
    }

    #[tokio::test]
    async fn test_unconfigured_class_blocks_cleanup() {
        let api = Arc::new(FakeApiUtil::new());
        let cache = Arc::new(VolumeCache::new());
        let tracker = Arc::new(CleanupTracker::new());
        cache.add(released(with_reclaim(
            make_local_pv("pv-x", "gone-class", "/mnt/gone/v1", test_identity().as_str()),
            "Delete",
        )));

        let mut d = deleter(
            config_with_cleaner(&["/bin/sh", "-c", "exit 0"], false),
            vec![],
            api.clone(),
            cache.clone(),
            tracker.clone(),
        );
        d.delete_once().await;

        assert!(tracker.is_empty());
        assert!(api.deleted_pvs().is_empty());
        assert!(!api.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_cleanup_flow() {
        let api = Arc::new(FakeApiUtil::new());
        let cache = Arc::new(VolumeCache::new());
        let tracker = Arc::new(CleanupTracker::new());
        cache.add(released_block_pv("pv-x", "/mnt/raw/sdb"));

        let mut d = deleter(
            config_with_cleaner(&["/scripts/quick_reset.sh"], true),
            vec![FakeVolume::block("/mnt/raw/sdb", 10 * crate::discovery::GIB)],
            api.clone(),
            cache.clone(),
            tracker.clone(),
        );

        d.delete_once().await;
        assert_eq!(tracker.status("pv-x"), Some(CleanupState::InFlight));
        let jobs = api.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(
            jobs[0].metadata.name.as_deref(),
            Some("cleanup-pv-x")
        );

        api.finish_job("storage", "cleanup-pv-x", true);
        wait_for_state(&tracker, "pv-x", CleanupState::Succeeded).await;

        d.delete_once().await;
        assert_eq!(api.deleted_pvs(), vec!["pv-x".to_string()]);
        assert_eq!(tracker.status("pv-x"), None);
        // The completed Job is retired with the tracker entry.
        assert!(api.jobs().is_empty());
    }

    #[test]
    fn test_container_path_remap() {
        let mut cfg = crate::testing::raw_class_config("/mnt/disks", "/local-disks");
        cfg.validate("raw").unwrap();
        assert_eq!(
            container_path(&cfg, "/mnt/disks/sdb", "pv-x").unwrap(),
            "/local-disks/sdb"
        );
        assert!(container_path(&cfg, "/elsewhere/sdb", "pv-x").is_err());
    }
}
