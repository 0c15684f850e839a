//! Container-level operations: config generation, the start path, the kill
//! path, restart-count recovery, and init-container cleanup.

use anyhow::{Context, Result, anyhow};
use chrono::DateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::container::{ContainerState, PodStatus, RuntimeContainer, RunningPod};
use crate::cri::RuntimeService;
use crate::cri::api::{
    Container as CriContainer, ContainerConfig, ContainerFilter, ContainerMetadata,
    ContainerState as CriContainerState, ContainerStatus as CriContainerStatus, ImageSpec,
    KeyValue, LinuxContainerConfig, LinuxContainerResources, LinuxContainerSecurityContext,
    PodSandboxConfig,
};
use crate::error::{StartError, SyncErrorKind};
use crate::events::{self, EventType, ObjectRef};
use crate::labels::{
    CONTAINER_HASH_LABEL, CONTAINER_NAME_LABEL, CONTAINER_RESTART_COUNT_LABEL, ContainerType,
    POD_UID_LABEL, new_container_labels,
};
use crate::spec::{ContainerRes, ContainerSpec, ImagePullSecret, PodTask};
use crate::sync_result::{SyncAction, SyncResult};

use super::RuntimeManager;

/// Minimal shutdown window applied to any positive grace period, avoiding
/// unnecessary SIGKILLs.
pub(crate) const MINIMUM_GRACE_PERIOD_SECONDS: i64 = 2;

pub(crate) fn cri_state_to_container_state(state: CriContainerState) -> ContainerState {
    match state {
        CriContainerState::Created => ContainerState::Created,
        CriContainerState::Running => ContainerState::Running,
        CriContainerState::Exited => ContainerState::Exited,
        CriContainerState::Unknown => ContainerState::Unknown,
    }
}

/// Converts a listed container into the inventory's container shape.
pub(crate) fn to_runtime_container(container: &CriContainer) -> RuntimeContainer {
    RuntimeContainer {
        id: container.id.clone(),
        name: container
            .metadata
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_default(),
        image: container
            .image
            .as_ref()
            .map(|i| i.image.clone())
            .unwrap_or_default(),
        hash: container
            .labels
            .get(CONTAINER_HASH_LABEL)
            .cloned()
            .unwrap_or_default(),
        state: cri_state_to_container_state(container.state),
    }
}

/// Converts a runtime container status into the observed model, recovering
/// the recorded hash and restart count from labels.
pub(crate) fn to_container_status(status: &CriContainerStatus) -> crate::container::ContainerStatus {
    let name = status
        .labels
        .get(CONTAINER_NAME_LABEL)
        .cloned()
        .or_else(|| status.metadata.as_ref().map(|m| m.name.clone()))
        .unwrap_or_default();
    let restart_count = status
        .labels
        .get(CONTAINER_RESTART_COUNT_LABEL)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);

    crate::container::ContainerStatus {
        id: status.id.clone(),
        name,
        state: cri_state_to_container_state(status.state),
        created_at: DateTime::from_timestamp_nanos(status.created_at),
        started_at: (status.started_at != 0)
            .then(|| DateTime::from_timestamp_nanos(status.started_at)),
        finished_at: (status.finished_at != 0)
            .then(|| DateTime::from_timestamp_nanos(status.finished_at)),
        exit_code: status.exit_code,
        image: status
            .image
            .as_ref()
            .map(|i| i.image.clone())
            .unwrap_or_default(),
        image_ref: status.image_ref.clone(),
        hash: status
            .labels
            .get(CONTAINER_HASH_LABEL)
            .cloned()
            .unwrap_or_default(),
        restart_count,
        reason: status.reason.clone(),
        message: status.message.clone(),
    }
}

/// Converts CPU descriptions like `1` or `500m` and memory descriptions like
/// `1Gi`, `30Mi`, or `200Ki` into runtime resource limits.
pub(crate) fn parse_resource(
    cpu: Option<String>,
    memory: Option<String>,
    cpu_period_micros: i64,
) -> Result<LinuxContainerResources> {
    let mut res = LinuxContainerResources::default();

    if let Some(c) = cpu {
        let period = cpu_period_micros;
        let portion: i64 = if c.ends_with('m') {
            c[..c.len() - 1]
                .parse::<i64>()
                .map_err(|e| anyhow!("failed to parse cpu resource config: {}", e))?
                * period
                / 1000
        } else {
            (c.parse::<f64>()
                .map_err(|e| anyhow!("failed to parse cpu resource config: {}", e))?
                * period as f64) as i64
        };
        res.cpu_period = period;
        res.cpu_quota = portion;
    }

    if let Some(m) = memory {
        let mem_result: std::result::Result<i64, _> = if m.ends_with("Gi") {
            m[..m.len() - 2]
                .parse()
                .map(|x: i64| x * 1024 * 1024 * 1024)
        } else if m.ends_with("Mi") {
            m[..m.len() - 2].parse().map(|x: i64| x * 1024 * 1024)
        } else if m.ends_with("Ki") {
            m[..m.len() - 2].parse().map(|x: i64| x * 1024)
        } else {
            return Err(anyhow!("failed to parse memory resource config: {}", m));
        };
        let mem = mem_result.map_err(|e| anyhow!("failed to parse memory resource config: {}", e))?;
        res.memory_limit_in_bytes = mem;
    }

    Ok(res)
}

fn linux_container_resources(
    res: Option<&ContainerRes>,
    cpu_period_micros: i64,
) -> Result<Option<LinuxContainerResources>> {
    match res.and_then(|r| r.limits.as_ref()) {
        Some(limits) => Ok(Some(parse_resource(
            limits.cpu.clone(),
            limits.memory.clone(),
            cpu_period_micros,
        )?)),
        None => Ok(None),
    }
}

fn find_container_spec<'a>(pod: &'a PodTask, name: &str) -> Option<&'a ContainerSpec> {
    pod.spec
        .init_containers
        .iter()
        .chain(pod.spec.containers.iter())
        .chain(pod.spec.ephemeral_containers.iter())
        .find(|c| c.name == name)
}

fn verify_run_as_non_root(container: &ContainerSpec) -> std::result::Result<(), StartError> {
    let Some(security) = &container.security_context else {
        return Ok(());
    };
    if security.run_as_non_root == Some(true) && security.run_as_user == Some(0) {
        return Err(StartError::new(
            SyncErrorKind::VerifyNonRoot,
            format!(
                "container {} must run as non-root but requests uid 0",
                container.name
            ),
        ));
    }
    Ok(())
}

impl<R: RuntimeService> RuntimeManager<R> {
    /// Builds the runtime-level configuration for one container.
    pub(crate) fn generate_container_config(
        &self,
        pod: &PodTask,
        container: &ContainerSpec,
        restart_count: u32,
        image_ref: &str,
        pod_ip: &str,
        container_type: ContainerType,
    ) -> Result<ContainerConfig> {
        let mut envs: Vec<KeyValue> = container
            .env
            .iter()
            .map(|e| KeyValue {
                key: e.name.clone(),
                value: e.value.clone(),
            })
            .collect();
        if !pod_ip.is_empty() {
            envs.push(KeyValue {
                key: "POD_IP".to_string(),
                value: pod_ip.to_string(),
            });
        }

        let resources = linux_container_resources(
            container.resources.as_ref(),
            self.config.cpu_cfs_quota_period_micros,
        )?
        .map(|mut r| {
            if !self.config.cpu_cfs_quota {
                // memory limits still apply, cpu throttling is opted out
                r.cpu_period = 0;
                r.cpu_quota = 0;
            }
            r
        });
        let security_context = container.security_context.as_ref().map(|sc| {
            LinuxContainerSecurityContext {
                run_as_user: sc.run_as_user,
                seccomp_profile_path: sc
                    .seccomp_profile
                    .as_ref()
                    .map(|profile| {
                        self.config
                            .seccomp_profile_root
                            .join(profile)
                            .to_string_lossy()
                            .into_owned()
                    })
                    .unwrap_or_default(),
            }
        });
        let linux = if resources.is_some() || security_context.is_some() {
            Some(LinuxContainerConfig {
                resources,
                security_context,
            })
        } else {
            None
        };

        Ok(ContainerConfig {
            metadata: Some(ContainerMetadata {
                name: container.name.clone(),
                attempt: restart_count,
            }),
            image: Some(ImageSpec {
                image: image_ref.to_string(),
                annotations: Default::default(),
            }),
            command: container.command.clone(),
            args: container.args.clone(),
            working_dir: container.working_dir.clone().unwrap_or_else(|| "/".to_string()),
            envs,
            mounts: Vec::new(),
            labels: new_container_labels(pod, container, restart_count, container_type),
            annotations: pod.metadata.annotations.clone(),
            log_path: format!("{}/{}.log", container.name, restart_count),
            stdin: false,
            stdin_once: false,
            tty: false,
            linux,
        })
    }

    /// Pulls the image, creates the container in the sandbox, runs the
    /// pre-start bookkeeping, starts it, and fires the post-start hook.
    /// Returns the new container id.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_container(
        &self,
        pod: &PodTask,
        pod_status: &PodStatus,
        container: &ContainerSpec,
        container_type: ContainerType,
        pod_sandbox_id: &str,
        sandbox_config: &PodSandboxConfig,
        pod_ip: &str,
        pull_secrets: &[ImagePullSecret],
    ) -> std::result::Result<String, StartError> {
        let pod_ref = ObjectRef::from_pod(pod);

        verify_run_as_non_root(container)?;

        let image_ref = self
            .image_puller
            .ensure_image_exists(pod, container, pull_secrets)?;

        let restart_count = pod_status
            .find_container_status_by_name(&container.name)
            .map(|s| s.restart_count + 1)
            .unwrap_or(0);

        let container_config = self
            .generate_container_config(
                pod,
                container,
                restart_count,
                &image_ref,
                pod_ip,
                container_type,
            )
            .map_err(|err| {
                StartError::new(
                    SyncErrorKind::StartContainer,
                    format!(
                        "generate config for container {} failed: {err}",
                        container.name
                    ),
                )
            })?;

        let container_id = self
            .runtime
            .create_container(pod_sandbox_id, &container_config, sandbox_config)
            .map_err(|err| {
                StartError::new(
                    SyncErrorKind::StartContainer,
                    format!("create container {} failed: {err}", container.name),
                )
            })?;
        self.recorder.event(
            &pod_ref,
            EventType::Normal,
            events::CREATED_CONTAINER,
            &format!("Created container {}", container.name),
        );

        if let Err(err) = self
            .internal_lifecycle
            .pre_start_container(pod, container, &container_id)
        {
            return Err(StartError::new(
                SyncErrorKind::PreStartHook,
                format!(
                    "internal pre-start hook for container {} failed: {err}",
                    container.name
                ),
            ));
        }

        self.runtime.start_container(&container_id).map_err(|err| {
            StartError::new(
                SyncErrorKind::StartContainer,
                format!("start container {} failed: {err}", container.name),
            )
        })?;
        self.recorder.event(
            &pod_ref,
            EventType::Normal,
            events::STARTED_CONTAINER,
            &format!("Started container {}", container.name),
        );

        if let Some(lifecycle) = &container.lifecycle
            && lifecycle.post_start.is_some()
            && let Err(err) = self.hook_runner.run_post_start(pod, &container_id, container)
        {
            self.recorder.event(
                &pod_ref,
                EventType::Warning,
                events::FAILED_POST_START_HOOK,
                &format!("post-start hook for container {} failed: {err}", container.name),
            );
            if let Err(kill_err) = self.kill_container(
                Some(pod),
                &container_id,
                &container.name,
                "FailedPostStartHook",
                Some(0),
            ) {
                error!(
                    pod = %pod.full_name(),
                    container = %container.name,
                    error = %kill_err,
                    "[container] failed to kill container after post-start hook failure"
                );
            }
            return Err(StartError::new(
                SyncErrorKind::PostStartHook,
                format!(
                    "post-start hook for container {} failed: {err}",
                    container.name
                ),
            ));
        }

        Ok(container_id)
    }

    /// Stops one container: pre-stop hook within the grace budget, then the
    /// runtime stop with the effective grace period.
    pub(crate) fn kill_container(
        &self,
        pod: Option<&PodTask>,
        container_id: &str,
        container_name: &str,
        message: &str,
        grace_override: Option<i64>,
    ) -> Result<()> {
        let container_spec = pod.and_then(|p| find_container_spec(p, container_name));
        let mut grace_period = pod
            .map(|p| p.spec.termination_grace_period_seconds)
            .unwrap_or(MINIMUM_GRACE_PERIOD_SECONDS);

        info!(
            container = container_name,
            container_id,
            message,
            "[container] killing container"
        );

        if let (Some(pod), Some(spec)) = (pod, container_spec)
            && grace_period > 0
            && spec
                .lifecycle
                .as_ref()
                .is_some_and(|l| l.pre_stop.is_some())
            && let Err(err) = self.hook_runner.run_pre_stop(pod, container_id, spec)
        {
            self.recorder.event(
                &ObjectRef::from_pod(pod),
                EventType::Warning,
                events::FAILED_PRE_STOP_HOOK,
                &format!("pre-stop hook for container {container_name} failed: {err}"),
            );
            warn!(
                container = container_name,
                error = %err,
                "[container] pre-stop hook failed, continuing with stop"
            );
        }

        if let Some(grace) = grace_override {
            grace_period = grace;
        }
        if grace_period > 0 {
            grace_period = grace_period.max(MINIMUM_GRACE_PERIOD_SECONDS);
        }

        if let Some(pod) = pod {
            self.recorder.event(
                &ObjectRef::from_pod(pod),
                EventType::Normal,
                events::KILLING_CONTAINER,
                &format!("Stopping container {container_name}: {message}"),
            );
        }

        self.runtime
            .stop_container(container_id, grace_period)
            .with_context(|| format!("stop container {container_name} ({container_id})"))
    }

    /// Kills every running container of the pod, one sync result each.
    pub(crate) fn kill_containers_with_sync_result(
        &self,
        pod: Option<&PodTask>,
        running_pod: &RunningPod,
        grace_override: Option<i64>,
    ) -> Vec<SyncResult> {
        let mut results = Vec::with_capacity(running_pod.containers.len());
        for container in &running_pod.containers {
            let mut result = SyncResult::new(SyncAction::KillContainer, container.name.clone());
            if let Err(err) = self.kill_container(
                pod,
                &container.id,
                &container.name,
                "pod is being killed",
                grace_override,
            ) {
                result.fail(SyncErrorKind::KillContainer, format!("{err:#}"));
                error!(
                    container = %container.name,
                    container_id = %container.id,
                    error = %err,
                    "[container] failed to kill container"
                );
            }
            results.push(result);
        }
        results
    }

    /// Statuses of every container recorded for a pod UID, newest first.
    pub(crate) fn get_pod_container_statuses(
        &self,
        uid: Uuid,
        name: &str,
        namespace: &str,
    ) -> Result<Vec<crate::container::ContainerStatus>> {
        let mut label_selector = std::collections::HashMap::new();
        label_selector.insert(POD_UID_LABEL.to_string(), uid.to_string());
        let filter = ContainerFilter {
            label_selector,
            ..Default::default()
        };
        let containers = self.runtime.list_containers(Some(&filter))?;

        let mut statuses = Vec::with_capacity(containers.len());
        for container in containers {
            let status = self
                .runtime
                .container_status(&container.id)
                .with_context(|| {
                    format!(
                        "container status of {} for pod {namespace}/{name}",
                        container.id
                    )
                })?;
            statuses.push(to_container_status(&status));
        }

        statuses.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(statuses)
    }

    /// Removes all but the most recent terminated instance per init container
    /// name, bounding the state the planner has to walk.
    pub(crate) fn prune_init_containers_before_start(&self, pod: &PodTask, pod_status: &PodStatus) {
        self.cleanup_init_containers(pod, pod_status, true);
    }

    /// Removes every terminated init container instance; used when the
    /// sandbox is recreated and init must run from scratch.
    pub(crate) fn purge_init_containers(&self, pod: &PodTask, pod_status: &PodStatus) {
        self.cleanup_init_containers(pod, pod_status, false);
    }

    fn cleanup_init_containers(&self, pod: &PodTask, pod_status: &PodStatus, keep_newest: bool) {
        for init_container in &pod.spec.init_containers {
            let mut seen = 0;
            // container_statuses are sorted newest first
            for status in pod_status
                .container_statuses
                .iter()
                .filter(|s| s.name == init_container.name && s.state == ContainerState::Exited)
            {
                seen += 1;
                if keep_newest && seen == 1 {
                    continue;
                }
                debug!(
                    pod = %pod.full_name(),
                    container = %status.name,
                    container_id = %status.id,
                    "[container] removing terminated init container"
                );
                if let Err(err) = self.runtime.remove_container(&status.id) {
                    error!(
                        pod = %pod.full_name(),
                        container_id = %status.id,
                        error = %err,
                        "[container] failed to remove terminated init container"
                    );
                }
            }
        }
    }
}
