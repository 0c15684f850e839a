//! Sandbox-level reconciliation: drift detection, config generation,
//! creation, and IP derivation.

use std::net::IpAddr;

use anyhow::Result;
use tracing::{debug, info};
use uuid::Uuid;

use crate::container::{ContainerState, PodStatus, RuntimeContainer};
use crate::cri::RuntimeService;
use crate::cri::api::{
    LinuxPodSandboxConfig, NamespaceMode, NamespaceOption, PodSandbox, PodSandboxConfig,
    PodSandboxFilter, PodSandboxMetadata, PodSandboxState, PodSandboxStatus, PortMapping, Protocol,
};
use crate::error::SyncErrorKind;
use crate::labels::{POD_UID_LABEL, new_sandbox_labels};
use crate::spec::PodTask;

use super::RuntimeManager;

/// Network namespace mode the spec asks for.
pub(crate) fn network_namespace_for_pod(pod: &PodTask) -> NamespaceMode {
    if pod.spec.host_network {
        NamespaceMode::Node
    } else {
        NamespaceMode::Pod
    }
}

/// Decides whether the pod needs a fresh sandbox.
///
/// Returns `(changed, attempt, sandbox_id)`: whether to create a new sandbox,
/// the attempt number to use for it, and the id of the existing sandbox when
/// one is being reused or replaced.
pub(crate) fn pod_sandbox_changed(pod: &PodTask, pod_status: &PodStatus) -> (bool, u32, String) {
    if pod_status.sandbox_statuses.is_empty() {
        debug!(pod = %pod.full_name(), "[sandbox] no sandbox found, need to start a new one");
        return (true, 0, String::new());
    }

    let ready_count = pod_status
        .sandbox_statuses
        .iter()
        .filter(|s| s.state == PodSandboxState::Ready)
        .count();

    let sandbox_status = &pod_status.sandbox_statuses[0];
    let attempt = sandbox_status
        .metadata
        .as_ref()
        .map(|m| m.attempt)
        .unwrap_or(0);

    if ready_count > 1 {
        debug!(
            pod = %pod.full_name(),
            ready_count,
            "[sandbox] more than one ready sandbox, need to reconcile them"
        );
        return (true, attempt + 1, sandbox_status.id.clone());
    }
    if sandbox_status.state != PodSandboxState::Ready {
        debug!(pod = %pod.full_name(), "[sandbox] no ready sandbox, need to start a new one");
        return (true, attempt + 1, sandbox_status.id.clone());
    }
    if sandbox_status.network_namespace() != network_namespace_for_pod(pod) {
        debug!(
            pod = %pod.full_name(),
            "[sandbox] network namespace changed, need to start a new one"
        );
        return (true, attempt + 1, String::new());
    }
    let sandbox_ip_missing = sandbox_status
        .network
        .as_ref()
        .map(|n| n.ip.is_empty())
        .unwrap_or(true);
    if !pod.spec.host_network && sandbox_ip_missing {
        debug!(
            pod = %pod.full_name(),
            "[sandbox] sandbox has no ip address, need to start a new one"
        );
        return (true, attempt + 1, sandbox_status.id.clone());
    }

    (false, attempt, sandbox_status.id.clone())
}

/// Builds the sandbox configuration for a pod at the given attempt.
///
/// Fails when the pod violates the naming contract (empty pod name or
/// duplicate container names), which would produce ambiguous runtime state.
pub(crate) fn generate_pod_sandbox_config(
    pod: &PodTask,
    attempt: u32,
    logs_root: &std::path::Path,
) -> Result<PodSandboxConfig> {
    if pod.metadata.name.is_empty() {
        anyhow::bail!("pod has no name");
    }
    let mut seen = std::collections::HashSet::new();
    for container in pod
        .spec
        .init_containers
        .iter()
        .chain(pod.spec.containers.iter())
        .chain(pod.spec.ephemeral_containers.iter())
    {
        if !seen.insert(container.name.as_str()) {
            anyhow::bail!(
                "duplicate container name {} in pod {}",
                container.name,
                pod.full_name()
            );
        }
    }

    let metadata = PodSandboxMetadata {
        name: pod.metadata.name.clone(),
        namespace: pod.metadata.namespace.clone(),
        uid: pod.metadata.uid.to_string(),
        attempt,
    };

    let port_mappings = pod
        .spec
        .containers
        .iter()
        .flat_map(|c| {
            c.ports.iter().map(|p| PortMapping {
                protocol: match p.protocol.as_str() {
                    "UDP" => Protocol::Udp,
                    _ => Protocol::Tcp,
                },
                container_port: p.container_port,
                host_port: p.host_port,
                host_ip: p.host_ip.clone(),
            })
        })
        .collect();

    let log_directory = logs_root
        .join(format!(
            "{}_{}_{}",
            pod.metadata.namespace, pod.metadata.name, pod.metadata.uid
        ))
        .to_string_lossy()
        .into_owned();

    // Host-network pods keep the node's hostname.
    let hostname = if pod.spec.host_network {
        String::new()
    } else {
        pod.metadata.name.clone()
    };

    Ok(PodSandboxConfig {
        metadata: Some(metadata),
        hostname,
        log_directory,
        dns_config: None,
        port_mappings,
        labels: new_sandbox_labels(pod),
        annotations: pod.metadata.annotations.clone(),
        linux: Some(LinuxPodSandboxConfig {
            cgroup_parent: String::new(),
            namespace_options: Some(NamespaceOption {
                network: network_namespace_for_pod(pod),
                ..Default::default()
            }),
        }),
    })
}

/// Derives a pod's IPs from a sandbox status, IPv4 first. Host-network
/// sandboxes report the node's addresses instead.
pub(crate) fn determine_pod_sandbox_ips(
    node_ips: &[String],
    sandbox_status: &PodSandboxStatus,
) -> Vec<String> {
    if sandbox_status.network_namespace() == NamespaceMode::Node {
        return node_ips.to_vec();
    }

    let Some(network) = &sandbox_status.network else {
        return Vec::new();
    };
    let reported = std::iter::once(network.ip.as_str())
        .chain(network.additional_ips.iter().map(|extra| extra.ip.as_str()))
        .filter(|ip| !ip.is_empty());

    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for raw in reported {
        match raw.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => v4.push(raw.to_string()),
            Ok(IpAddr::V6(_)) => v6.push(raw.to_string()),
            Err(err) => {
                debug!(
                    sandbox_id = %sandbox_status.id,
                    ip = raw,
                    error = %err,
                    "[sandbox] sandbox reported an unparseable ip, dropping it"
                );
            }
        }
    }
    v4.extend(v6);
    v4
}

/// Converts a listed sandbox into the inventory's container shape.
pub(crate) fn sandbox_to_runtime_container(sandbox: &PodSandbox) -> RuntimeContainer {
    RuntimeContainer {
        id: sandbox.id.clone(),
        name: sandbox
            .metadata
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_default(),
        image: String::new(),
        hash: String::new(),
        state: if sandbox.state == PodSandboxState::Ready {
            ContainerState::Running
        } else {
            ContainerState::Exited
        },
    }
}

impl<R: RuntimeService> RuntimeManager<R> {
    /// All sandbox ids recorded for a pod UID, newest first.
    pub(crate) fn get_sandbox_ids_by_pod_uid(&self, uid: Uuid) -> Result<Vec<String>> {
        let mut label_selector = std::collections::HashMap::new();
        label_selector.insert(POD_UID_LABEL.to_string(), uid.to_string());
        let filter = PodSandboxFilter {
            label_selector,
            ..Default::default()
        };

        let mut sandboxes = self.runtime.list_pod_sandbox(Some(&filter))?;
        sandboxes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sandboxes.into_iter().map(|s| s.id).collect())
    }

    /// Creates a new sandbox for the pod and returns its id.
    pub(crate) fn create_pod_sandbox(
        &self,
        pod: &PodTask,
        attempt: u32,
    ) -> std::result::Result<String, (SyncErrorKind, String)> {
        let sandbox_config =
            generate_pod_sandbox_config(pod, attempt, &self.config.pod_logs_root).map_err(
                |err| {
                    (
                        SyncErrorKind::ConfigPodSandbox,
                        format!(
                            "generate sandbox config for pod {} failed: {err}",
                            pod.full_name()
                        ),
                    )
                },
            )?;

        if let Err(err) = std::fs::create_dir_all(&sandbox_config.log_directory) {
            return Err((
                SyncErrorKind::CreatePodSandbox,
                format!(
                    "create pod log directory {} failed: {err}",
                    sandbox_config.log_directory
                ),
            ));
        }

        let runtime_handler = self
            .runtime_handler_resolver
            .lookup(pod.spec.runtime_class_name.as_deref())
            .map_err(|err| {
                (
                    SyncErrorKind::CreatePodSandbox,
                    format!(
                        "lookup runtime handler for pod {} failed: {err}",
                        pod.full_name()
                    ),
                )
            })?;

        let sandbox_id = self
            .runtime
            .run_pod_sandbox(&sandbox_config, &runtime_handler)
            .map_err(|err| {
                (
                    SyncErrorKind::CreatePodSandbox,
                    format!("run sandbox for pod {} failed: {err}", pod.full_name()),
                )
            })?;
        info!(
            pod = %pod.full_name(),
            sandbox_id = %sandbox_id,
            attempt,
            "[sandbox] created sandbox"
        );
        Ok(sandbox_id)
    }
}
