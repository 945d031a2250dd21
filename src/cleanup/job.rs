//! Cleanup Jobs
//!
//! When `useJobForCleaning` is set, wipes run as cluster Jobs instead of
//! child processes. The Job carries the same contract as the inline path:
//! the class cleaner command with the volume path in `LOCAL_PV_BLKDEVICE`
//! or `LOCAL_PV_FILESYSTEM`, pinned to this node.

use crate::config::NODE_LABEL_KEY;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, PodSpec, PodTemplateSpec, SecurityContext,
    Toleration, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

/// Label identifying cleanup Jobs created by this provisioner
pub const JOB_APP_LABEL: &str = "app";
pub const JOB_APP_LABEL_VALUE: &str = "local-volume-cleanup";

/// Label carrying the PV a cleanup Job is wiping
pub const JOB_PV_LABEL: &str = "persistentvolume";

/// Deterministic Job name for a PV's cleanup.
pub fn cleanup_job_name(pv_name: &str) -> String {
    format!("cleanup-{}", pv_name)
}

/// Parameters for one cleanup Job.
#[derive(Debug, Clone)]
pub struct CleanupJobSpec<'a> {
    pub pv_name: &'a str,
    pub namespace: &'a str,
    pub image: &'a str,
    pub command: &'a [String],
    /// `LOCAL_PV_BLKDEVICE` or `LOCAL_PV_FILESYSTEM`
    pub env_name: &'a str,
    /// Volume path as seen inside the cleanup container
    pub mount_path: &'a str,
    /// Class host directory, mounted into the Job at `mount_dir`
    pub host_dir: &'a str,
    pub mount_dir: &'a str,
    pub node_name: &'a str,
    pub tolerations: &'a [Toleration],
}

/// Build the Job object for a cleanup.
pub fn build_cleanup_job(spec: &CleanupJobSpec<'_>) -> Job {
    let mut labels = BTreeMap::new();
    labels.insert(JOB_APP_LABEL.to_string(), JOB_APP_LABEL_VALUE.to_string());
    labels.insert(JOB_PV_LABEL.to_string(), spec.pv_name.to_string());

    let mut node_selector = BTreeMap::new();
    node_selector.insert(NODE_LABEL_KEY.to_string(), spec.node_name.to_string());

    Job {
        metadata: ObjectMeta {
            name: Some(cleanup_job_name(spec.pv_name)),
            namespace: Some(spec.namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    node_selector: Some(node_selector),
                    tolerations: if spec.tolerations.is_empty() {
                        None
                    } else {
                        Some(spec.tolerations.to_vec())
                    },
                    containers: vec![Container {
                        name: "cleaner".to_string(),
                        image: Some(spec.image.to_string()),
                        command: Some(spec.command.to_vec()),
                        env: Some(vec![EnvVar {
                            name: spec.env_name.to_string(),
                            value: Some(spec.mount_path.to_string()),
                            value_from: None,
                        }]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "media".to_string(),
                            mount_path: spec.mount_dir.to_string(),
                            ..Default::default()
                        }]),
                        // Wiping raw devices needs device access.
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "media".to_string(),
                        host_path: Some(HostPathVolumeSource {
                            path: spec.host_dir.to_string(),
                            type_: None,
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Terminal state of a cleanup Job: `Some(true)` complete, `Some(false)`
/// failed, `None` still running.
pub fn job_terminal_state(job: &Job) -> Option<bool> {
    let conditions = job.status.as_ref()?.conditions.as_ref()?;
    for condition in conditions {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return Some(true),
            "Failed" => return Some(false),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LOCAL_PV_BLKDEVICE_ENV;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn spec<'a>(command: &'a [String], tolerations: &'a [Toleration]) -> CleanupJobSpec<'a> {
        CleanupJobSpec {
            pv_name: "local-pv-abc123",
            namespace: "storage",
            image: "registry.example.com/cleaner:v1",
            command,
            env_name: LOCAL_PV_BLKDEVICE_ENV,
            mount_path: "/mnt/raw/sdb",
            host_dir: "/mnt/raw",
            mount_dir: "/mnt/raw",
            node_name: "n1",
            tolerations,
        }
    }

    #[test]
    fn test_job_carries_cleanup_contract() {
        let command = vec!["/scripts/quick_reset.sh".to_string()];
        let job = build_cleanup_job(&spec(&command, &[]));

        assert_eq!(
            job.metadata.name.as_deref(),
            Some("cleanup-local-pv-abc123")
        );
        assert_eq!(job.metadata.namespace.as_deref(), Some("storage"));

        let pod = job
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .clone();
        assert_eq!(
            pod.node_selector.as_ref().unwrap().get(NODE_LABEL_KEY),
            Some(&"n1".to_string())
        );
        let container = &pod.containers[0];
        assert_eq!(container.command.as_ref().unwrap(), &command);
        let env = &container.env.as_ref().unwrap()[0];
        assert_eq!(env.name, LOCAL_PV_BLKDEVICE_ENV);
        assert_eq!(env.value.as_deref(), Some("/mnt/raw/sdb"));
    }

    #[test]
    fn test_job_tolerations_attached() {
        let command = vec!["/scripts/quick_reset.sh".to_string()];
        let tolerations = vec![Toleration {
            key: Some("node-role.kubernetes.io/storage".to_string()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        }];
        let job = build_cleanup_job(&spec(&command, &tolerations));

        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.tolerations.unwrap().len(), 1);
    }

    fn job_with_condition(type_: &str, status: &str) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_job_terminal_state() {
        assert_eq!(
            job_terminal_state(&job_with_condition("Complete", "True")),
            Some(true)
        );
        assert_eq!(
            job_terminal_state(&job_with_condition("Failed", "True")),
            Some(false)
        );
        assert_eq!(
            job_terminal_state(&job_with_condition("Failed", "False")),
            None
        );
        assert_eq!(job_terminal_state(&Job::default()), None);
    }
}
