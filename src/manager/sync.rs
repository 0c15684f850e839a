//! The sync executor: turns a [`PodActions`](super::actions::PodActions) plan
//! into runtime operations with defined ordering and failure isolation.
//!
//! Phase order within one cycle: kill plan, init pruning, sandbox creation,
//! ephemeral starts, the single init start, then main starts. Init failures
//! abort the cycle (init is strictly ordered); main failures are isolated per
//! container; ephemeral failures are logged and ignored.

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, stable_key};
use crate::container::{ContainerState, PodStatus, RunningPod};
use crate::cri::RuntimeService;
use crate::cri::api::PodSandboxConfig;
use crate::error::{StartError, SyncErrorKind};
use crate::events::{self, EventType, ObjectRef};
use crate::labels::ContainerType;
use crate::spec::{ContainerSpec, ImagePullSecret, PodTask, is_sidecar};
use crate::sync_result::{PodSyncResult, SyncAction, SyncResult};

use super::{RuntimeManager, sandbox};

impl<R: RuntimeService> RuntimeManager<R> {
    /// Drives one sync cycle for the pod: plans, kills what must go, creates
    /// the sandbox when needed, and starts containers in phase order.
    pub fn sync_pod(
        &self,
        pod: &PodTask,
        pod_status: &PodStatus,
        pull_secrets: &[ImagePullSecret],
        backoff: &Backoff,
    ) -> PodSyncResult {
        let mut result = PodSyncResult::new();
        let pod_ref = ObjectRef::from_pod(pod);

        // Step 1: compute sandbox and container changes.
        let pod_container_changes = self.compute_pod_actions(pod, pod_status);
        debug!(
            pod = %pod.full_name(),
            actions = ?pod_container_changes,
            "[sync] computed pod actions"
        );
        if pod_container_changes.create_sandbox {
            if pod_container_changes.sandbox_id.is_empty() {
                info!(pod = %pod.full_name(), "[sync] new pod, will create a sandbox for it");
            } else {
                self.recorder.event(
                    &pod_ref,
                    EventType::Normal,
                    events::SANDBOX_CHANGED,
                    "Pod sandbox changed, it will be killed and re-created.",
                );
            }
        }

        // Step 2: kill the whole pod when the plan says so.
        if pod_container_changes.kill_pod {
            if pod_container_changes.create_sandbox {
                info!(pod = %pod.full_name(), "[sync] stopping pod sandbox, will start a new one");
            } else {
                info!(
                    pod = %pod.full_name(),
                    "[sync] stopping pod sandbox because all other containers are dead"
                );
            }
            let running_pod = RunningPod::from_pod_status(pod_status);
            let kill_result = self.kill_pod_with_sync_result(Some(pod), &running_pod, None);
            let kill_error = kill_result.error();
            result.add_pod_sync_result(kill_result);
            if let Some(message) = kill_error {
                error!(pod = %pod.full_name(), error = %message, "[sync] killing pod failed");
                return result;
            }
            if pod_container_changes.create_sandbox {
                self.purge_init_containers(pod, pod_status);
            }
        } else {
            // Step 3: kill the containers the planner marked. A failure here
            // aborts the cycle: a killed container must be gone before its
            // replacement starts.
            for (container_id, kill_info) in &pod_container_changes.containers_to_kill {
                let mut kill_result =
                    SyncResult::new(SyncAction::KillContainer, kill_info.name.clone());
                if let Err(err) = self.kill_container(
                    Some(pod),
                    container_id,
                    &kill_info.name,
                    &kill_info.message,
                    None,
                ) {
                    kill_result.fail(SyncErrorKind::KillContainer, format!("{err:#}"));
                    result.add_sync_result(kill_result);
                    error!(
                        pod = %pod.full_name(),
                        container = %kill_info.name,
                        container_id = %container_id,
                        error = %err,
                        "[sync] killing container failed"
                    );
                    return result;
                }
                result.add_sync_result(kill_result);
            }
        }

        // Step 4: keep terminated init containers tightly bounded; the
        // garbage collector would get to them eventually, the planner walks
        // them every cycle.
        self.prune_init_containers_before_start(pod, pod_status);

        // Containers start against the primary pod IP. Default to the IPs in
        // the passed-in status and overwrite them when the sandbox is
        // (re)started, so a restarting container never observes a stale IP.
        let mut pod_ips = pod_status.ips.clone();

        // Step 5: create the sandbox when planned.
        let mut pod_sandbox_id = pod_container_changes.sandbox_id.clone();
        if pod_container_changes.create_sandbox {
            let mut create_result =
                SyncResult::new(SyncAction::CreatePodSandbox, pod.full_name());
            match self.create_pod_sandbox(pod, pod_container_changes.attempt) {
                Ok(sandbox_id) => {
                    result.add_sync_result(create_result);
                    pod_sandbox_id = sandbox_id;
                }
                Err((kind, message)) => {
                    create_result.fail(kind, message.clone());
                    result.add_sync_result(create_result);
                    self.recorder.event(
                        &pod_ref,
                        EventType::Warning,
                        events::FAILED_CREATE_POD_SANDBOX,
                        &format!("Failed to create pod sandbox: {message}"),
                    );
                    error!(pod = %pod.full_name(), error = %message, "[sync] creating sandbox failed");
                    return result;
                }
            }

            let sandbox_status = match self.runtime.pod_sandbox_status(&pod_sandbox_id) {
                Ok(status) => status,
                Err(err) => {
                    self.recorder.event(
                        &pod_ref,
                        EventType::Warning,
                        events::FAILED_STATUS_POD_SANDBOX,
                        &format!("Unable to get pod sandbox status: {err}"),
                    );
                    error!(
                        pod = %pod.full_name(),
                        sandbox_id = %pod_sandbox_id,
                        error = %err,
                        "[sync] fetching created sandbox status failed"
                    );
                    result.fail(format!(
                        "sandbox status of {pod_sandbox_id} failed: {err}"
                    ));
                    return result;
                }
            };

            if !pod.spec.host_network {
                pod_ips =
                    sandbox::determine_pod_sandbox_ips(&self.config.node_ips, &sandbox_status);
                info!(
                    pod = %pod.full_name(),
                    ips = ?pod_ips,
                    "[sync] determined pod ips after sandbox changed"
                );
            }
        }

        let pod_ip = pod_ips.first().cloned().unwrap_or_default();

        // Step 6: sandbox configuration for the containers about to start.
        let mut config_result =
            SyncResult::new(SyncAction::ConfigPodSandbox, pod_sandbox_id.clone());
        let sandbox_config = match sandbox::generate_pod_sandbox_config(
            pod,
            pod_container_changes.attempt,
            &self.config.pod_logs_root,
        ) {
            Ok(config) => {
                result.add_sync_result(config_result);
                config
            }
            Err(err) => {
                config_result.fail(SyncErrorKind::ConfigPodSandbox, err.to_string());
                result.add_sync_result(config_result);
                error!(pod = %pod.full_name(), error = %err, "[sync] generating sandbox config failed");
                return result;
            }
        };

        // Step 7: ephemeral containers; a failure never fails the pod.
        for idx in &pod_container_changes.ephemeral_containers_to_start {
            let container = &pod.spec.ephemeral_containers[*idx];
            if let Err(err) = self.start_any_container(
                &mut result,
                "ephemeral container",
                ContainerType::Ephemeral,
                pod,
                pod_status,
                container,
                &pod_sandbox_id,
                &sandbox_config,
                &pod_ip,
                pull_secrets,
                backoff,
            ) {
                warn!(
                    pod = %pod.full_name(),
                    container = %container.name,
                    error = %err,
                    "[sync] failed to start ephemeral container"
                );
            }
        }

        // Step 8: the next init container. Init is strictly ordered, so a
        // failure aborts the cycle.
        if let Some(idx) = pod_container_changes.next_init_container_to_start {
            let container = &pod.spec.init_containers[idx];
            if let Err(err) = self.start_any_container(
                &mut result,
                "init container",
                ContainerType::Init,
                pod,
                pod_status,
                container,
                &pod_sandbox_id,
                &sandbox_config,
                &pod_ip,
                pull_secrets,
                backoff,
            ) {
                warn!(
                    pod = %pod.full_name(),
                    container = %container.name,
                    error = %err,
                    "[sync] failed to start init container"
                );
                return result;
            }
            debug!(
                pod = %pod.full_name(),
                container = %container.name,
                "[sync] started init container"
            );
        }

        // Step 9: main containers are unordered; start as many as possible.
        for idx in &pod_container_changes.containers_to_start {
            let container = &pod.spec.containers[*idx];
            let container_type = if is_sidecar(container) {
                ContainerType::Sidecar
            } else {
                ContainerType::Main
            };
            if let Err(err) = self.start_any_container(
                &mut result,
                "container",
                container_type,
                pod,
                pod_status,
                container,
                &pod_sandbox_id,
                &sandbox_config,
                &pod_ip,
                pull_secrets,
                backoff,
            ) {
                warn!(
                    pod = %pod.full_name(),
                    container = %container.name,
                    error = %err,
                    "[sync] failed to start container"
                );
            }
        }

        result
    }

    /// Backoff gate plus container start, recorded as one sync result.
    #[allow(clippy::too_many_arguments)]
    fn start_any_container(
        &self,
        result: &mut PodSyncResult,
        type_name: &str,
        container_type: ContainerType,
        pod: &PodTask,
        pod_status: &PodStatus,
        container: &ContainerSpec,
        pod_sandbox_id: &str,
        sandbox_config: &PodSandboxConfig,
        pod_ip: &str,
        pull_secrets: &[ImagePullSecret],
        backoff: &Backoff,
    ) -> std::result::Result<(), StartError> {
        let mut start_result = SyncResult::new(SyncAction::StartContainer, container.name.clone());

        if let Err(err) = self.do_backoff(pod, container, pod_status, backoff) {
            start_result.fail(err.kind, err.message.clone());
            result.add_sync_result(start_result);
            info!(
                pod = %pod.full_name(),
                container = %container.name,
                type_name,
                "[sync] backing off restarting container"
            );
            return Err(err);
        }

        info!(
            pod = %pod.full_name(),
            container = %container.name,
            type_name,
            "[sync] creating container"
        );
        match self.start_container(
            pod,
            pod_status,
            container,
            container_type,
            pod_sandbox_id,
            sandbox_config,
            pod_ip,
            pull_secrets,
        ) {
            Ok(_container_id) => {
                result.add_sync_result(start_result);
                Ok(())
            }
            Err(err) => {
                start_result.fail(err.kind, err.message.clone());
                result.add_sync_result(start_result);
                Err(err)
            }
        }
    }

    /// Refuses a start while the container's backoff window is open;
    /// otherwise advances the window using the last exit as reference point.
    fn do_backoff(
        &self,
        pod: &PodTask,
        container: &ContainerSpec,
        pod_status: &PodStatus,
        backoff: &Backoff,
    ) -> std::result::Result<(), StartError> {
        let Some(status) = pod_status
            .container_statuses
            .iter()
            .find(|s| s.name == container.name && s.state == ContainerState::Exited)
        else {
            return Ok(());
        };

        let finished_at = status.finished_at.unwrap_or(status.created_at);
        let key = stable_key(pod, container);
        if backoff.is_in_backoff_since(&key, finished_at) {
            self.recorder.event(
                &ObjectRef::from_pod(pod),
                EventType::Warning,
                events::BACKOFF_START_CONTAINER,
                "Back-off restarting failed container",
            );
            let message = format!(
                "back-off {:?} restarting failed container={} pod={}",
                backoff.get(&key),
                container.name,
                pod.full_name()
            );
            debug!(pod = %pod.full_name(), container = %container.name, "[sync] {message}");
            return Err(StartError::new(SyncErrorKind::CrashLoopBackOff, message));
        }

        backoff.next(&key, finished_at);
        Ok(())
    }

    /// Kills every container of `running_pod` with grace, then stops all its
    /// sandboxes. `pod` may be absent when the reconciler restarted and only
    /// runtime state is left.
    pub fn kill_pod(
        &self,
        pod: Option<&PodTask>,
        running_pod: &RunningPod,
        grace_override: Option<i64>,
    ) -> anyhow::Result<()> {
        let result = self.kill_pod_with_sync_result(pod, running_pod, grace_override);
        match result.error() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    /// [`Self::kill_pod`] with per-operation accounting.
    pub(crate) fn kill_pod_with_sync_result(
        &self,
        pod: Option<&PodTask>,
        running_pod: &RunningPod,
        grace_override: Option<i64>,
    ) -> PodSyncResult {
        let mut result = PodSyncResult::new();
        for kill_result in self.kill_containers_with_sync_result(pod, running_pod, grace_override)
        {
            result.add_sync_result(kill_result);
        }

        // Stop every sandbox of the pod; removal is garbage collection's job.
        let mut sandbox_result =
            SyncResult::new(SyncAction::KillPodSandbox, running_pod.id.to_string());
        for sandbox_id in &running_pod.sandbox_ids {
            if let Err(err) = self.runtime.stop_pod_sandbox(sandbox_id) {
                sandbox_result.fail(SyncErrorKind::KillPodSandbox, err.to_string());
                error!(
                    sandbox_id = %sandbox_id,
                    error = %err,
                    "[sync] failed to stop sandbox"
                );
            }
        }
        result.add_sync_result(sandbox_result);
        result
    }
}
