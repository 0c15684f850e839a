//! The label contract stamped onto every created container and sandbox.
//!
//! Labels are the only channel through which pod identity, spec hashes, and
//! restart counts survive a reconciler restart: the runtime keeps them on the
//! object, and [`get_container_info_from_labels`] recovers them when raw
//! runtime objects are regrouped into pods.

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::spec::{ContainerSpec, PodTask, hash_container};

pub const POD_UID_LABEL: &str = "podruntime/pod-uid";
pub const POD_NAME_LABEL: &str = "podruntime/pod-name";
pub const POD_NAMESPACE_LABEL: &str = "podruntime/pod-namespace";
pub const CONTAINER_NAME_LABEL: &str = "podruntime/container-name";
pub const CONTAINER_HASH_LABEL: &str = "podruntime/container-hash";
pub const CONTAINER_RESTART_COUNT_LABEL: &str = "podruntime/restart-count";
pub const CONTAINER_TYPE_LABEL: &str = "podruntime/container-type";

/// Lifecycle role of a container within its pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerType {
    Init,
    #[default]
    Main,
    Ephemeral,
    Sidecar,
}

impl ContainerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerType::Init => "init",
            ContainerType::Main => "main",
            ContainerType::Ephemeral => "ephemeral",
            ContainerType::Sidecar => "sidecar",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "init" => Some(ContainerType::Init),
            "main" => Some(ContainerType::Main),
            "ephemeral" => Some(ContainerType::Ephemeral),
            "sidecar" => Some(ContainerType::Sidecar),
            _ => None,
        }
    }
}

/// Pod and container identity recovered from a container's labels.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledContainerInfo {
    pub pod_uid: Uuid,
    pub pod_name: String,
    pub pod_namespace: String,
    pub container_name: String,
    pub hash: String,
    pub restart_count: u32,
    pub container_type: ContainerType,
}

/// Builds the label set recorded on a new container.
pub fn new_container_labels(
    pod: &PodTask,
    container: &ContainerSpec,
    restart_count: u32,
    container_type: ContainerType,
) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(POD_UID_LABEL.to_string(), pod.metadata.uid.to_string());
    labels.insert(POD_NAME_LABEL.to_string(), pod.metadata.name.clone());
    labels.insert(
        POD_NAMESPACE_LABEL.to_string(),
        pod.metadata.namespace.clone(),
    );
    labels.insert(CONTAINER_NAME_LABEL.to_string(), container.name.clone());
    labels.insert(CONTAINER_HASH_LABEL.to_string(), hash_container(container));
    labels.insert(
        CONTAINER_RESTART_COUNT_LABEL.to_string(),
        restart_count.to_string(),
    );
    labels.insert(
        CONTAINER_TYPE_LABEL.to_string(),
        container_type.as_str().to_string(),
    );
    labels
}

/// Builds the label set recorded on a new pod sandbox.
pub fn new_sandbox_labels(pod: &PodTask) -> HashMap<String, String> {
    let mut labels = pod.metadata.labels.clone();
    labels.insert(POD_UID_LABEL.to_string(), pod.metadata.uid.to_string());
    labels.insert(POD_NAME_LABEL.to_string(), pod.metadata.name.clone());
    labels.insert(
        POD_NAMESPACE_LABEL.to_string(),
        pod.metadata.namespace.clone(),
    );
    labels
}

/// Recovers pod and container identity from a container's labels.
///
/// Returns `None` when the pod UID is missing or unparseable; other missing
/// fields fall back to defaults, since older containers may predate parts of
/// the contract.
pub fn get_container_info_from_labels(
    labels: &HashMap<String, String>,
) -> Option<LabeledContainerInfo> {
    let raw_uid = labels.get(POD_UID_LABEL)?;
    let pod_uid = match Uuid::parse_str(raw_uid) {
        Ok(uid) => uid,
        Err(error) => {
            debug!(raw_uid = %raw_uid, error = %error, "[labels] container carries an unparseable pod uid");
            return None;
        }
    };

    let restart_count = labels
        .get(CONTAINER_RESTART_COUNT_LABEL)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let container_type = labels
        .get(CONTAINER_TYPE_LABEL)
        .and_then(|v| ContainerType::parse(v))
        .unwrap_or_default();

    Some(LabeledContainerInfo {
        pod_uid,
        pod_name: labels.get(POD_NAME_LABEL).cloned().unwrap_or_default(),
        pod_namespace: labels
            .get(POD_NAMESPACE_LABEL)
            .cloned()
            .unwrap_or_default(),
        container_name: labels
            .get(CONTAINER_NAME_LABEL)
            .cloned()
            .unwrap_or_default(),
        hash: labels.get(CONTAINER_HASH_LABEL).cloned().unwrap_or_default(),
        restart_count,
        container_type,
    })
}
