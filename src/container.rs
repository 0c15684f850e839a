//! Observed-state pod model.
//!
//! These types describe what the runtime reports about a pod: its sandboxes,
//! its containers and their states, and the pod's assigned IPs. The
//! [`Pod`] inventory view groups raw runtime objects by pod UID, while
//! [`PodStatus`] is the richer per-pod assembly produced by the status path
//! and consumed by the planner.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cri::api::PodSandboxStatus;
use crate::spec::{ContainerSpec, PodTask, RestartPolicy};

/// Lifecycle state of a container as observed through the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    /// The runtime could not report a coherent state; the container may or
    /// may not be running.
    #[default]
    Unknown,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Status of a single container, assembled from the runtime's report and the
/// labels recorded at creation time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerStatus {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: i32,
    pub image: String,
    pub image_ref: String,
    /// Spec digest recorded when the container was created.
    pub hash: String,
    /// How many times a container with this name has been restarted in this
    /// pod, recovered from labels.
    pub restart_count: u32,
    pub reason: String,
    pub message: String,
}

/// Everything the runtime reports about one pod.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PodStatus {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    /// Pod IPs; the first entry is the primary IP.
    pub ips: Vec<String>,
    /// Sandbox statuses, most recent first.
    pub sandbox_statuses: Vec<PodSandboxStatus>,
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodStatus {
    /// Latest status of the named container, if the runtime knows about one.
    pub fn find_container_status_by_name(&self, name: &str) -> Option<&ContainerStatus> {
        self.container_statuses.iter().find(|s| s.name == name)
    }
}

/// A container or sandbox as it appears in the pod inventory.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub hash: String,
    pub state: ContainerState,
}

/// Inventory view of a pod: raw runtime objects regrouped by pod UID.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pod {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    pub containers: Vec<RuntimeContainer>,
    pub sandboxes: Vec<RuntimeContainer>,
}

impl Pod {
    /// Returns the container or sandbox with the given runtime id.
    pub fn get_container_by_id(&self, id: &str) -> Option<&RuntimeContainer> {
        self.containers
            .iter()
            .chain(self.sandboxes.iter())
            .find(|c| c.id == id)
    }
}

/// The kill path's view of a pod: the containers currently running plus every
/// sandbox id associated with the pod.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunningPod {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    pub containers: Vec<RuntimeContainer>,
    pub sandbox_ids: Vec<String>,
}

impl RunningPod {
    /// Projects a [`PodStatus`] down to the running containers and sandbox
    /// ids the kill path operates on.
    pub fn from_pod_status(status: &PodStatus) -> Self {
        let containers = status
            .container_statuses
            .iter()
            .filter(|s| s.state == ContainerState::Running)
            .map(|s| RuntimeContainer {
                id: s.id.clone(),
                name: s.name.clone(),
                image: s.image.clone(),
                hash: s.hash.clone(),
                state: s.state,
            })
            .collect();
        let sandbox_ids = status
            .sandbox_statuses
            .iter()
            .map(|s| s.id.clone())
            .collect();
        RunningPod {
            id: status.id,
            name: status.name.clone(),
            namespace: status.namespace.clone(),
            containers,
            sandbox_ids,
        }
    }
}

/// The generic restart predicate: running containers are never restarted,
/// containers that never ran are always started, and exited containers
/// restart according to the pod's restart policy.
pub fn should_container_be_restarted(
    container: &ContainerSpec,
    pod: &PodTask,
    pod_status: &PodStatus,
) -> bool {
    let Some(status) = pod_status.find_container_status_by_name(&container.name) else {
        return true;
    };
    match status.state {
        ContainerState::Running => false,
        // A created or unknown container may be stuck; try again.
        ContainerState::Created | ContainerState::Unknown => true,
        ContainerState::Exited => match pod.spec.restart_policy {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => status.exit_code != 0,
            RestartPolicy::Never => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ObjectMeta, PodSpec};

    fn make_pod(restart_policy: RestartPolicy) -> PodTask {
        PodTask {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata: ObjectMeta {
                name: "pod".to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                restart_policy,
                ..Default::default()
            },
        }
    }

    fn make_container_spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "img".to_string(),
            command: vec![],
            args: vec![],
            working_dir: None,
            env: vec![],
            ports: vec![],
            resources: None,
            liveness_probe: None,
            lifecycle: None,
            security_context: None,
            sidecar: false,
        }
    }

    fn make_status(name: &str, state: ContainerState, exit_code: i32) -> ContainerStatus {
        ContainerStatus {
            id: format!("id-{name}"),
            name: name.to_string(),
            state,
            exit_code,
            ..Default::default()
        }
    }

    #[test]
    fn restart_predicate_starts_missing_containers() {
        let pod = make_pod(RestartPolicy::Never);
        let container = make_container_spec("c1");
        let status = PodStatus::default();
        assert!(should_container_be_restarted(&container, &pod, &status));
    }

    #[test]
    fn restart_predicate_keeps_running_containers() {
        let pod = make_pod(RestartPolicy::Always);
        let container = make_container_spec("c1");
        let status = PodStatus {
            container_statuses: vec![make_status("c1", ContainerState::Running, 0)],
            ..Default::default()
        };
        assert!(!should_container_be_restarted(&container, &pod, &status));
    }

    #[test]
    fn restart_predicate_follows_policy_for_exited_containers() {
        let container = make_container_spec("c1");
        let succeeded = PodStatus {
            container_statuses: vec![make_status("c1", ContainerState::Exited, 0)],
            ..Default::default()
        };
        let failed = PodStatus {
            container_statuses: vec![make_status("c1", ContainerState::Exited, 1)],
            ..Default::default()
        };

        let always = make_pod(RestartPolicy::Always);
        assert!(should_container_be_restarted(&container, &always, &succeeded));
        assert!(should_container_be_restarted(&container, &always, &failed));

        let on_failure = make_pod(RestartPolicy::OnFailure);
        assert!(!should_container_be_restarted(
            &container,
            &on_failure,
            &succeeded
        ));
        assert!(should_container_be_restarted(&container, &on_failure, &failed));

        let never = make_pod(RestartPolicy::Never);
        assert!(!should_container_be_restarted(&container, &never, &succeeded));
        assert!(!should_container_be_restarted(&container, &never, &failed));
    }

    #[test]
    fn restart_predicate_retries_unknown_containers() {
        let pod = make_pod(RestartPolicy::Never);
        let container = make_container_spec("c1");
        let status = PodStatus {
            container_statuses: vec![make_status("c1", ContainerState::Unknown, 0)],
            ..Default::default()
        };
        assert!(should_container_be_restarted(&container, &pod, &status));
    }

    #[test]
    fn running_pod_projects_running_containers_and_all_sandboxes() {
        let status = PodStatus {
            id: Uuid::new_v4(),
            name: "pod".to_string(),
            namespace: "default".to_string(),
            sandbox_statuses: vec![
                PodSandboxStatus {
                    id: "sb-1".to_string(),
                    ..Default::default()
                },
                PodSandboxStatus {
                    id: "sb-0".to_string(),
                    ..Default::default()
                },
            ],
            container_statuses: vec![
                make_status("c1", ContainerState::Running, 0),
                make_status("c2", ContainerState::Exited, 0),
            ],
            ..Default::default()
        };

        let running = RunningPod::from_pod_status(&status);
        assert_eq!(running.containers.len(), 1);
        assert_eq!(running.containers[0].name, "c1");
        assert_eq!(
            running.sandbox_ids,
            vec!["sb-1".to_string(), "sb-0".to_string()]
        );
    }
}
