//! The runtime manager: construction, inventory, and status assembly.
//!
//! [`RuntimeManager`] owns the narrow CRI client plus the capabilities wired
//! in at construction (image puller, event recorder, liveness oracle, hook
//! runners). Planning lives in [`actions`], execution in [`sync`]; this
//! module covers the construction-time version gate, the pod inventory, and
//! the per-pod status assembly those paths consume.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cache::VersionCache;
use crate::container::{Pod, PodStatus};
use crate::cri::api::{
    ContainerFilter, ContainerState as CriContainerState, NetworkConfig, PodSandboxFilter,
    PodSandboxState, RuntimeConfig, RuntimeStatus, VersionResponse,
};
use crate::cri::{InstrumentedRuntimeService, RuntimeService};
use crate::error::SyncErrorKind;
use crate::events::EventRecorder;
use crate::hooks::{
    ImagePuller, InternalContainerLifecycle, LifecycleHookRunner, RuntimeHandlerResolver,
};
use crate::labels::get_container_info_from_labels;
use crate::logreduction::LogReduction;
use crate::probe::LivenessManager;

pub mod actions;
pub mod container;
pub mod sandbox;
pub mod sync;

/// The runtime API version this reconciler speaks.
pub const RUNTIME_API_VERSION: &str = "0.1.0";

const VERSION_CACHE_TTL: Duration = Duration::from_secs(60);
const IDENTICAL_ERROR_DELAY: Duration = Duration::from_secs(60);

/// Process-wide feature switches, injected explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureGates {
    /// Enables planning and starting ephemeral (debug) containers.
    pub ephemeral_containers: bool,
}

/// Construction-time configuration of the runtime manager.
#[derive(Debug, Clone)]
pub struct RuntimeManagerConfig {
    /// Machine identity keying the version cache.
    pub machine_id: String,
    /// Node addresses reported as pod IPs for host-network pods.
    pub node_ips: Vec<String>,
    /// Root directory for per-pod log directories.
    pub pod_logs_root: PathBuf,
    /// Root directory seccomp profile names resolve against.
    pub seccomp_profile_root: PathBuf,
    /// Enforce container CPU limits with CFS quota.
    pub cpu_cfs_quota: bool,
    /// CFS quota period in microseconds.
    pub cpu_cfs_quota_period_micros: i64,
    pub features: FeatureGates,
}

impl Default for RuntimeManagerConfig {
    fn default() -> Self {
        Self {
            machine_id: String::new(),
            node_ips: Vec::new(),
            pod_logs_root: PathBuf::from("/var/log/pods"),
            seccomp_profile_root: PathBuf::from("/var/lib/podruntime/seccomp"),
            cpu_cfs_quota: true,
            cpu_cfs_quota_period_micros: 100_000,
            features: FeatureGates::default(),
        }
    }
}

/// Reconciles desired pod specs against the state observed through the
/// runtime client.
///
/// One instance serves all pods on a node. The caller serializes sync cycles
/// per pod UID; across pods the manager is safe for concurrent use.
pub struct RuntimeManager<R: RuntimeService> {
    runtime_name: String,
    runtime: InstrumentedRuntimeService<R>,
    image_puller: Arc<dyn ImagePuller>,
    recorder: Arc<dyn EventRecorder>,
    liveness: Arc<dyn LivenessManager>,
    hook_runner: Arc<dyn LifecycleHookRunner>,
    internal_lifecycle: Arc<dyn InternalContainerLifecycle>,
    runtime_handler_resolver: Arc<dyn RuntimeHandlerResolver>,
    version_cache: VersionCache,
    log_reduction: LogReduction,
    config: RuntimeManagerConfig,
}

impl<R: RuntimeService> std::fmt::Debug for RuntimeManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeManager")
            .field("runtime_name", &self.runtime_name)
            .finish_non_exhaustive()
    }
}

impl<R: RuntimeService> RuntimeManager<R> {
    /// Validates the runtime's API version, ensures the pod log root exists,
    /// and wires the manager together.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeManagerConfig,
        runtime_service: R,
        image_puller: Arc<dyn ImagePuller>,
        recorder: Arc<dyn EventRecorder>,
        liveness: Arc<dyn LivenessManager>,
        hook_runner: Arc<dyn LifecycleHookRunner>,
        internal_lifecycle: Arc<dyn InternalContainerLifecycle>,
        runtime_handler_resolver: Arc<dyn RuntimeHandlerResolver>,
    ) -> Result<Self> {
        let runtime = InstrumentedRuntimeService::new(runtime_service);

        let typed_version = runtime
            .version(RUNTIME_API_VERSION)
            .context("get runtime version failed")?;
        if typed_version.version != RUNTIME_API_VERSION {
            error!(
                reported = %typed_version.version,
                supported = RUNTIME_API_VERSION,
                "[manager] runtime api version is not supported"
            );
            return Err(SyncErrorKind::VersionNotSupported.into());
        }

        if let Err(err) = ensure_pod_logs_root(&config.pod_logs_root) {
            error!(
                path = %config.pod_logs_root.display(),
                error = %err,
                "[manager] failed to create pod logs root directory"
            );
        }

        info!(
            runtime_name = %typed_version.runtime_name,
            runtime_version = %typed_version.runtime_version,
            runtime_api_version = %typed_version.runtime_api_version,
            "[manager] container runtime initialized"
        );

        Ok(Self {
            runtime_name: typed_version.runtime_name,
            runtime,
            image_puller,
            recorder,
            liveness,
            hook_runner,
            internal_lifecycle,
            runtime_handler_resolver,
            version_cache: VersionCache::new(VERSION_CACHE_TTL),
            log_reduction: LogReduction::new(IDENTICAL_ERROR_DELAY),
            config,
        })
    }

    /// Name of the container runtime in use.
    pub fn runtime_type(&self) -> &str {
        &self.runtime_name
    }

    /// The runtime's current version report, fetched fresh.
    pub fn version(&self) -> Result<VersionResponse> {
        self.runtime.version(RUNTIME_API_VERSION)
    }

    /// The runtime's API version, served from the TTL-bounded cache.
    pub fn api_version(&self) -> Result<String> {
        let version = self.version_cache.get(&self.config.machine_id, || {
            let typed_version = self.runtime.version(RUNTIME_API_VERSION)?;
            if typed_version.version != RUNTIME_API_VERSION {
                return Err(SyncErrorKind::VersionNotSupported.into());
            }
            Ok(typed_version)
        })?;
        Ok(version.runtime_api_version)
    }

    /// The runtime's readiness conditions.
    pub fn runtime_status(&self) -> Result<RuntimeStatus> {
        self.runtime.status()
    }

    /// Pushes an updated pod CIDR down to the runtime.
    pub fn update_pod_cidr(&self, pod_cidr: &str) -> Result<()> {
        info!(pod_cidr, "[manager] updating runtime configuration with pod cidr");
        self.runtime.update_runtime_config(&RuntimeConfig {
            network_config: Some(NetworkConfig {
                pod_cidr: pod_cidr.to_string(),
            }),
        })
    }

    /// Lists containers and sandboxes from the runtime and regroups them by
    /// pod UID. With `include_dead` the listing also covers exited and dead
    /// objects (used by garbage collection). The result is unordered.
    pub fn get_pods(&self, include_dead: bool) -> Result<Vec<Pod>> {
        let mut pods: HashMap<Uuid, Pod> = HashMap::new();

        let sandbox_filter = (!include_dead).then(|| PodSandboxFilter {
            state: Some(PodSandboxState::Ready),
            ..Default::default()
        });
        let sandboxes = self.runtime.list_pod_sandbox(sandbox_filter.as_ref())?;
        for sandbox in &sandboxes {
            let Some(metadata) = &sandbox.metadata else {
                debug!(sandbox_id = %sandbox.id, "[manager] sandbox has no metadata, skipping");
                continue;
            };
            let pod_uid = match Uuid::parse_str(&metadata.uid) {
                Ok(uid) => uid,
                Err(err) => {
                    debug!(
                        sandbox_id = %sandbox.id,
                        error = %err,
                        "[manager] sandbox carries an unparseable pod uid, skipping"
                    );
                    continue;
                }
            };
            let pod = pods.entry(pod_uid).or_insert_with(|| Pod {
                id: pod_uid,
                name: metadata.name.clone(),
                namespace: metadata.namespace.clone(),
                ..Default::default()
            });
            pod.sandboxes.push(sandbox::sandbox_to_runtime_container(sandbox));
        }

        let container_filter = (!include_dead).then(|| ContainerFilter {
            state: Some(CriContainerState::Running),
            ..Default::default()
        });
        let containers = self.runtime.list_containers(container_filter.as_ref())?;
        for runtime_container in &containers {
            if runtime_container.metadata.is_none() {
                debug!(
                    container_id = %runtime_container.id,
                    "[manager] container has no metadata, skipping"
                );
                continue;
            }
            let Some(info) = get_container_info_from_labels(&runtime_container.labels) else {
                debug!(
                    container_id = %runtime_container.id,
                    "[manager] container labels do not identify a pod, skipping"
                );
                continue;
            };
            let pod = pods.entry(info.pod_uid).or_insert_with(|| Pod {
                id: info.pod_uid,
                name: info.pod_name.clone(),
                namespace: info.pod_namespace.clone(),
                ..Default::default()
            });
            pod.containers
                .push(container::to_runtime_container(runtime_container));
        }

        Ok(pods.into_values().collect())
    }

    /// Assembles the full observed status of one pod: its sandbox statuses
    /// (newest first), its primary IPs, and all container statuses visible in
    /// the runtime.
    pub fn get_pod_status(&self, uid: Uuid, name: &str, namespace: &str) -> Result<PodStatus> {
        let sandbox_ids = self.get_sandbox_ids_by_pod_uid(uid)?;
        let pod_full_name = format!("{namespace}/{name}");
        debug!(
            pod = %pod_full_name,
            sandbox_count = sandbox_ids.len(),
            "[manager] assembling pod status"
        );

        let mut sandbox_statuses = Vec::with_capacity(sandbox_ids.len());
        let mut pod_ips = Vec::new();
        for (idx, sandbox_id) in sandbox_ids.iter().enumerate() {
            let sandbox_status = self
                .runtime
                .pod_sandbox_status(sandbox_id)
                .with_context(|| format!("sandbox status of {sandbox_id} for pod {pod_full_name}"))?;

            // Only the most recent sandbox is authoritative for the pod IP.
            if idx == 0 && sandbox_status.state == PodSandboxState::Ready {
                pod_ips =
                    sandbox::determine_pod_sandbox_ips(&self.config.node_ips, &sandbox_status);
            }
            sandbox_statuses.push(sandbox_status);
        }

        let container_statuses = match self.get_pod_container_statuses(uid, name, namespace) {
            Ok(statuses) => {
                self.log_reduction.clear_id(&pod_full_name);
                statuses
            }
            Err(err) => {
                if self
                    .log_reduction
                    .should_message_be_printed(&err.to_string(), &pod_full_name)
                {
                    error!(
                        pod = %pod_full_name,
                        error = %err,
                        "[manager] listing container statuses failed"
                    );
                }
                return Err(err);
            }
        };

        Ok(PodStatus {
            id: uid,
            name: name.to_string(),
            namespace: namespace.to_string(),
            ips: pod_ips,
            sandbox_statuses,
            container_statuses,
        })
    }
}

fn ensure_pod_logs_root(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}
