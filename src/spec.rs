//! Desired-state pod model.
//!
//! These types describe what a pod *should* look like: its identity, its
//! container lists (init, main, ephemeral), restart policy, and the
//! per-container parameters the runtime needs to create containers. They are
//! plain serde types so manifests can be loaded from YAML files and so a
//! container's spec can be hashed for drift detection.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and bookkeeping metadata of a pod.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ObjectMeta {
    #[serde(default)]
    pub uid: Uuid,
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// How containers in a pod are restarted after they exit.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

/// A complete pod object as handed to the reconciler: identity plus desired
/// state. Immutable for the duration of one sync cycle.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodTask {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

impl PodTask {
    /// Loads a pod manifest from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::from_yaml(&contents)
    }

    /// Parses a pod manifest from a YAML string.
    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        let task: PodTask = serde_yaml::from_str(contents)?;
        Ok(task)
    }

    /// `namespace/name` form used in log messages.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }
}

/// Desired state of a pod.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    #[serde(rename = "initContainers", default)]
    pub init_containers: Vec<ContainerSpec>,
    #[serde(rename = "ephemeralContainers", default)]
    pub ephemeral_containers: Vec<ContainerSpec>,
    #[serde(rename = "restartPolicy", default)]
    pub restart_policy: RestartPolicy,
    /// When set the pod shares the node's network namespace and gets no
    /// sandbox-assigned IP of its own.
    #[serde(rename = "hostNetwork", default)]
    pub host_network: bool,
    /// Marks a batch pod that is expected to run to completion. Sidecar
    /// teardown and sandbox kill decisions differ for these pods.
    #[serde(rename = "oneOff", default)]
    pub one_off: bool,
    #[serde(
        rename = "terminationGracePeriodSeconds",
        default = "default_grace_period"
    )]
    pub termination_grace_period_seconds: i64,
    #[serde(rename = "runtimeClassName", default)]
    pub runtime_class_name: Option<String>,
    #[serde(rename = "imagePullSecrets", default)]
    pub image_pull_secrets: Vec<ImagePullSecret>,
}

fn default_grace_period() -> i64 {
    30
}

/// Desired state of a single container within a pod.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(rename = "workingDir", default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub resources: Option<ContainerRes>,
    #[serde(rename = "livenessProbe", default)]
    pub liveness_probe: Option<Probe>,
    #[serde(default)]
    pub lifecycle: Option<Lifecycle>,
    #[serde(rename = "securityContext", default)]
    pub security_context: Option<SecurityContext>,
    /// Classifies this container as subordinate to the pod's main workload:
    /// its restarts track the lifetime of the main containers rather than its
    /// own exit code. Stable for the life of a pod UID.
    #[serde(default)]
    pub sidecar: bool,
}

/// A single environment variable.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Port {
    #[serde(rename = "containerPort")]
    pub container_port: i32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(rename = "hostPort", default)]
    pub host_port: i32,
    #[serde(rename = "hostIP", default)]
    pub host_ip: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerRes {
    pub limits: Option<Resource>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Resource {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// A periodic container health check. Only the liveness class is consumed by
/// the reconciler; the probing itself runs in an external manager.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Probe {
    #[serde(default)]
    pub exec: Option<ExecAction>,
    #[serde(rename = "httpGet", default)]
    pub http_get: Option<HttpGetAction>,
    #[serde(rename = "tcpSocket", default)]
    pub tcp_socket: Option<TcpSocketAction>,
    #[serde(rename = "initialDelaySeconds", default)]
    pub initial_delay_seconds: u32,
    #[serde(rename = "periodSeconds", default = "default_probe_period")]
    pub period_seconds: u32,
    #[serde(rename = "timeoutSeconds", default = "default_probe_timeout")]
    pub timeout_seconds: u32,
    #[serde(rename = "successThreshold", default = "default_one")]
    pub success_threshold: u32,
    #[serde(rename = "failureThreshold", default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_probe_period() -> u32 {
    10
}

fn default_probe_timeout() -> u32 {
    1
}

fn default_one() -> u32 {
    1
}

fn default_failure_threshold() -> u32 {
    3
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExecAction {
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HttpGetAction {
    #[serde(default = "default_http_path")]
    pub path: String,
    pub port: u16,
}

fn default_http_path() -> String {
    "/".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TcpSocketAction {
    pub port: u16,
}

/// Post-start and pre-stop handlers run around container start and stop.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Lifecycle {
    #[serde(rename = "postStart", default)]
    pub post_start: Option<LifecycleHandler>,
    #[serde(rename = "preStop", default)]
    pub pre_stop: Option<LifecycleHandler>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct LifecycleHandler {
    #[serde(default)]
    pub exec: Option<ExecAction>,
    #[serde(rename = "httpGet", default)]
    pub http_get: Option<HttpGetAction>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct SecurityContext {
    #[serde(rename = "runAsUser", default)]
    pub run_as_user: Option<i64>,
    #[serde(rename = "runAsNonRoot", default)]
    pub run_as_non_root: Option<bool>,
    /// Name of a seccomp profile relative to the configured profile root.
    #[serde(rename = "seccompProfile", default)]
    pub seccomp_profile: Option<String>,
}

/// Reference to a registry credential made available to the image puller.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ImagePullSecret {
    pub name: String,
}

/// Whether this pod is classified as a one-off (batch) pod. Deterministic and
/// stable over the life of a pod UID.
pub fn is_one_off_pod(pod: &PodTask) -> bool {
    pod.spec.one_off
}

/// Whether this container is classified as a sidecar. Deterministic and
/// stable over the life of a pod UID.
pub fn is_sidecar(container: &ContainerSpec) -> bool {
    container.sidecar
}

/// Whether the pod's restart policy allows restarting failed containers.
pub fn should_restart_on_failure(pod: &PodTask) -> bool {
    pod.spec.restart_policy != RestartPolicy::Never
}

/// Stable digest of a container spec. Recorded in container labels at
/// creation time; a mismatch against the current spec means the definition
/// changed and the container must be replaced.
pub fn hash_container(container: &ContainerSpec) -> String {
    let encoded = serde_json::to_string(container).unwrap_or_default();
    sha256::digest(encoded)
}
