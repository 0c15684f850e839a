//! The action planner: decides which sandbox and container operations bring
//! a pod's observed state in line with its spec.
//!
//! [`compute_pod_actions`] is a pure function of the desired spec, the
//! observed status, and a snapshot of liveness verdicts; identical inputs
//! produce identical plans. Execution and every side effect live in the sync
//! executor.

use std::collections::HashMap;

use tracing::{debug, error, info};

use crate::container::{ContainerState, ContainerStatus, PodStatus, should_container_be_restarted};
use crate::cri::RuntimeService;
use crate::probe::{LivenessManager, ProbeResultType};
use crate::spec::{
    ContainerSpec, PodTask, RestartPolicy, hash_container, is_one_off_pod, is_sidecar,
    should_restart_on_failure,
};

use super::{FeatureGates, RuntimeManager, sandbox};

/// Everything needed to kill one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerToKill {
    /// Name of the container to kill.
    pub name: String,
    /// The spec entry the container belongs to, used for pre-stop hooks and
    /// grace periods.
    pub container: ContainerSpec,
    /// Why the container is being killed.
    pub message: String,
}

/// The plan for one sync cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PodActions {
    /// Stop all containers and every sandbox of the pod.
    pub kill_pod: bool,
    /// Create a fresh sandbox before starting any container.
    pub create_sandbox: bool,
    /// Id of the existing sandbox to reuse, empty when creating fresh.
    pub sandbox_id: String,
    /// Attempt number for the (new) sandbox.
    pub attempt: u32,
    /// Index into the init container list of the single init container to
    /// start this cycle, if any.
    pub next_init_container_to_start: Option<usize>,
    /// Indices into the main container list to start.
    pub containers_to_start: Vec<usize>,
    /// Indices into the ephemeral container list to start.
    pub ephemeral_containers_to_start: Vec<usize>,
    /// Containers to kill, keyed by container id.
    pub containers_to_kill: HashMap<String, ContainerToKill>,
}

fn container_changed(container: &ContainerSpec, status: &ContainerStatus) -> bool {
    status.hash != hash_container(container)
}

fn container_succeeded(container: &ContainerSpec, pod_status: &PodStatus) -> bool {
    match pod_status.find_container_status_by_name(&container.name) {
        None => false,
        Some(status) if status.state == ContainerState::Running => false,
        Some(status) => status.exit_code == 0,
    }
}

/// True when every main container of a one-off pod has reached `Exited`.
/// Init containers need no check here: if any init container were unfinished,
/// the main containers would never have been created.
fn one_off_pod_all_containers_reached_final_state(pod: &PodTask, pod_status: &PodStatus) -> bool {
    if !is_one_off_pod(pod) {
        return false;
    }
    pod.spec.containers.iter().all(|c| {
        pod_status
            .find_container_status_by_name(&c.name)
            .is_some_and(|s| s.state == ContainerState::Exited)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OneOffFlags {
    all_main_exited: bool,
    all_main_succeeded: bool,
    all_exited: bool,
    has_sidecar_in_progress: bool,
}

fn collect_one_off_container_status_flags(pod: &PodTask, pod_status: &PodStatus) -> OneOffFlags {
    let mut flags = OneOffFlags {
        all_main_exited: true,
        all_main_succeeded: true,
        all_exited: true,
        has_sidecar_in_progress: false,
    };

    for container in &pod.spec.containers {
        match pod_status.find_container_status_by_name(&container.name) {
            Some(status) => {
                if status.state != ContainerState::Exited {
                    // created, running, or unknown: still in progress
                    flags.all_exited = false;
                    if is_sidecar(container) {
                        flags.has_sidecar_in_progress = true;
                    } else {
                        flags.all_main_exited = false;
                        flags.all_main_succeeded = false;
                    }
                } else if !is_sidecar(container) && status.exit_code != 0 {
                    flags.all_main_succeeded = false;
                }
            }
            None => {
                if !is_sidecar(container) {
                    flags.all_main_exited = false;
                    flags.all_main_succeeded = false;
                }
                flags.all_exited = false;
            }
        }
    }
    flags
}

/// "The main workload is done": sidecars stop tracking it once this is true.
/// Assumes the pod is one-off.
fn one_off_pod_main_containers_all_finished(pod: &PodTask, flags: &OneOffFlags) -> bool {
    match pod.spec.restart_policy {
        RestartPolicy::Always => false,
        RestartPolicy::OnFailure => flags.all_main_succeeded,
        RestartPolicy::Never => flags.all_main_exited,
    }
}

/// Restart predicate for containers of a one-off pod. Sidecars ignore their
/// own exit status and track the main containers instead; main containers
/// honor the generic predicate.
fn should_restart_container_in_one_off_pod(
    pod: &PodTask,
    container: &ContainerSpec,
    container_status: Option<&ContainerStatus>,
    pod_status: &PodStatus,
    flags: &OneOffFlags,
) -> bool {
    let Some(status) = container_status else {
        // Never created. Hold off only when this is a sidecar and the main
        // containers are already done.
        return !(is_sidecar(container) && one_off_pod_main_containers_all_finished(pod, flags));
    };

    if is_sidecar(container) {
        if status.state == ContainerState::Running {
            return false;
        }
        return !one_off_pod_main_containers_all_finished(pod, flags);
    }

    should_container_be_restarted(container, pod, pod_status)
}

struct InitProgress {
    /// Prior status of the next init container, if it ran before.
    last_status: Option<ContainerStatus>,
    /// Index of the next init container to start, if one should start now.
    next: Option<usize>,
    /// All init containers have completed successfully.
    done: bool,
}

fn is_init_container_failed(status: &ContainerStatus) -> bool {
    status.state == ContainerState::Exited && status.exit_code != 0
}

/// Walks the init list in order and finds the lowest-indexed init container
/// that is neither successfully exited nor currently running.
fn find_next_init_container(pod: &PodTask, pod_status: &PodStatus) -> InitProgress {
    if pod.spec.init_containers.is_empty() {
        return InitProgress {
            last_status: None,
            next: None,
            done: true,
        };
    }

    // A running main container means initialization completed in the past.
    let any_main_running = pod.spec.containers.iter().any(|c| {
        pod_status
            .find_container_status_by_name(&c.name)
            .is_some_and(|s| s.state == ContainerState::Running)
    });
    if any_main_running {
        return InitProgress {
            last_status: None,
            next: None,
            done: true,
        };
    }

    for (idx, container) in pod.spec.init_containers.iter().enumerate() {
        let status = pod_status.find_container_status_by_name(&container.name);
        match status {
            Some(s) if s.state == ContainerState::Exited && s.exit_code == 0 => continue,
            Some(s) if s.state == ContainerState::Running => {
                return InitProgress {
                    last_status: Some(s.clone()),
                    next: None,
                    done: false,
                };
            }
            other => {
                return InitProgress {
                    last_status: other.cloned(),
                    next: Some(idx),
                    done: false,
                };
            }
        }
    }

    InitProgress {
        last_status: None,
        next: None,
        done: true,
    }
}

/// Computes the plan that converges the observed pod state toward the spec.
///
/// Pure and deterministic: identical `(pod, pod_status)` inputs and liveness
/// snapshots yield identical plans.
pub fn compute_pod_actions(
    pod: &PodTask,
    pod_status: &PodStatus,
    liveness: &dyn LivenessManager,
    features: &FeatureGates,
) -> PodActions {
    debug!(pod = %pod.full_name(), "[planner] computing pod actions");

    let (create_sandbox, attempt, sandbox_id) = sandbox::pod_sandbox_changed(pod, pod_status);

    // A finished one-off pod whose sandbox is already gone needs teardown
    // only. Recreating the sandbox here races with the teardown triggered by
    // the final sidecar exits: the second sidecar's exit event arrives after
    // the sandbox has been stopped, and a recreate attempt then fails against
    // a pod whose resources are being torn down.
    if one_off_pod_all_containers_reached_final_state(pod, pod_status) && create_sandbox {
        info!(
            pod = %pod.full_name(),
            "[planner] one-off pod finished and sandbox not ready, tearing down without recreate"
        );
        return PodActions {
            kill_pod: true,
            create_sandbox: false,
            sandbox_id,
            attempt,
            ..Default::default()
        };
    }

    let mut changes = PodActions {
        kill_pod: create_sandbox,
        create_sandbox,
        sandbox_id,
        attempt,
        ..Default::default()
    };

    // Recreating the sandbox means killing and recreating everything.
    if create_sandbox {
        if !should_restart_on_failure(pod)
            && attempt != 0
            && !pod_status.container_statuses.is_empty()
        {
            // The pod already ran to completion in a previous attempt; an
            // empty status list would instead mean no container was ever
            // created and sandbox creation should be retried.
            changes.create_sandbox = false;
            return changes;
        }
        if !pod.spec.init_containers.is_empty() {
            changes.next_init_container_to_start = Some(0);
            return changes;
        }
        for (idx, container) in pod.spec.containers.iter().enumerate() {
            if container_succeeded(container, pod_status)
                && pod.spec.restart_policy == RestartPolicy::OnFailure
            {
                continue;
            }
            changes.containers_to_start.push(idx);
        }
        return changes;
    }

    // Ephemeral containers may start even while initialization is incomplete,
    // and are never restarted.
    if features.ephemeral_containers {
        for (idx, container) in pod.spec.ephemeral_containers.iter().enumerate() {
            if pod_status
                .find_container_status_by_name(&container.name)
                .is_none()
            {
                changes.ephemeral_containers_to_start.push(idx);
            }
        }
    }

    let init_progress = find_next_init_container(pod, pod_status);
    if !init_progress.done {
        if let Some(next_idx) = init_progress.next {
            let next = &pod.spec.init_containers[next_idx];
            let init_failed = init_progress
                .last_status
                .as_ref()
                .is_some_and(is_init_container_failed);
            if init_failed && !should_restart_on_failure(pod) {
                changes.kill_pod = true;
            } else {
                if let Some(last) = &init_progress.last_status
                    && last.state == ContainerState::Unknown
                {
                    // The previous attempt may still be alive; kill it before
                    // starting a replacement so two instances never coexist.
                    changes.containers_to_kill.insert(
                        last.id.clone(),
                        ContainerToKill {
                            name: next.name.clone(),
                            container: next.clone(),
                            message:
                                "Init container is in Unknown state, try killing it before restart"
                                    .to_string(),
                        },
                    );
                }
                changes.next_init_container_to_start = Some(next_idx);
            }
        }
        // Initialization failed or still in progress; skip main containers.
        return changes;
    }

    let one_off = is_one_off_pod(pod);
    let flags = collect_one_off_container_status_flags(pod, pod_status);

    // Number of running containers to keep.
    let mut keep_count = 0usize;
    for (idx, container) in pod.spec.containers.iter().enumerate() {
        let container_status = pod_status.find_container_status_by_name(&container.name);

        match container_status {
            Some(status) if status.state == ContainerState::Running => {
                // The container is running; kill it if any of the conditions
                // below is met.
                let mut restart = should_restart_on_failure(pod);
                let mut message;
                if container_changed(container, status) {
                    message = format!("Container {} definition changed", container.name);
                    // The spec changed; restart regardless of policy.
                    restart = true;
                } else if liveness.get(&status.id) == Some(ProbeResultType::Failure) {
                    message = format!("Container {} failed liveness probe", container.name);
                } else if one_off && is_sidecar(container) {
                    if one_off_pod_main_containers_all_finished(pod, &flags) {
                        message = format!(
                            "Kill sidecar {} as main containers are all finished",
                            container.name
                        );
                        restart = false;
                    } else {
                        keep_count += 1;
                        continue;
                    }
                } else {
                    keep_count += 1;
                    continue;
                }

                if restart {
                    message = format!("{message}, will be restarted");
                    changes.containers_to_start.push(idx);
                }
                info!(
                    pod = %pod.full_name(),
                    container = %container.name,
                    container_id = %status.id,
                    message = %message,
                    "[planner] killing running container"
                );
                changes.containers_to_kill.insert(
                    status.id.clone(),
                    ContainerToKill {
                        name: status.name.clone(),
                        container: container.clone(),
                        message,
                    },
                );
            }
            status => {
                // Missing or not running: decide restart.
                let restart = if one_off {
                    should_restart_container_in_one_off_pod(
                        pod, container, status, pod_status, &flags,
                    )
                } else {
                    should_container_be_restarted(container, pod, pod_status)
                };
                if restart {
                    debug!(
                        pod = %pod.full_name(),
                        container = %container.name,
                        "[planner] container is dead and the restart policy says to restart it"
                    );
                    changes.containers_to_start.push(idx);
                    if let Some(status) = status
                        && status.state == ContainerState::Unknown
                    {
                        // It may actually still be running; kill before
                        // restart so two instances never coexist.
                        changes.containers_to_kill.insert(
                            status.id.clone(),
                            ContainerToKill {
                                name: status.name.clone(),
                                container: container.clone(),
                                message:
                                    "Container is in Unknown state, try killing it before restart"
                                        .to_string(),
                            },
                        );
                    }
                }
            }
        }
    }

    if one_off {
        // One-off pods actively kill their sidecars, so the sandbox is only
        // killed once nothing remains in progress.
        if !changes.create_sandbox {
            if flags.all_exited {
                changes.kill_pod = keep_count == 0 && changes.containers_to_start.is_empty();
            } else if one_off_pod_main_containers_all_finished(pod, &flags)
                && !flags.has_sidecar_in_progress
            {
                changes.kill_pod = true;
                info!(
                    pod = %pod.full_name(),
                    "[planner] one-off pod main containers finished with no sidecar in progress, killing sandbox"
                );
            }
        }
    } else if keep_count == 0 && changes.containers_to_start.is_empty() {
        changes.kill_pod = true;
    }

    changes
}

impl<R: RuntimeService> RuntimeManager<R> {
    /// Plans the sync cycle for a pod.
    ///
    /// Fires the post-stop bookkeeping hook for observed non-running
    /// containers (releasing CPU and device allocations promptly) before
    /// delegating every decision to the pure planner.
    pub fn compute_pod_actions(&self, pod: &PodTask, pod_status: &PodStatus) -> PodActions {
        for container in &pod.spec.containers {
            if let Some(status) = pod_status.find_container_status_by_name(&container.name)
                && status.state != ContainerState::Running
                && let Err(err) = self.internal_lifecycle.post_stop_container(&status.id)
            {
                error!(
                    pod = %pod.full_name(),
                    container = %container.name,
                    error = %err,
                    "[planner] post-stop lifecycle hook failed"
                );
            }
        }
        compute_pod_actions(pod, pod_status, self.liveness.as_ref(), &self.config.features)
    }
}
