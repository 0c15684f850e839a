//! In-crate test support: an in-memory runtime, recording fakes for the
//! injected capabilities, and constructors for the fixtures the unit tests
//! share.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::container::{ContainerState, ContainerStatus};
use crate::cri::RuntimeService;
use crate::cri::api::{
    self, LinuxPodSandboxStatus, Namespace, NamespaceMode, NamespaceOption, PodIp, PodSandbox,
    PodSandboxMetadata, PodSandboxNetworkStatus, PodSandboxState, PodSandboxStatus,
    RuntimeCondition, RuntimeStatus, VersionResponse,
};
use crate::error::{PullError, SyncErrorKind};
use crate::events::{EventRecorder, EventType, ObjectRef};
use crate::hooks::{ImagePuller, NoopHooks, StaticRuntimeHandler};
use crate::labels::{ContainerType, new_container_labels};
use crate::manager::{FeatureGates, RuntimeManager, RuntimeManagerConfig};
use crate::probe::ProbeResultCache;
use crate::spec::{
    ContainerSpec, ImagePullSecret, ObjectMeta, PodSpec, PodTask, RestartPolicy, hash_container,
};

pub(crate) fn make_container_spec(name: &str, image: &str) -> ContainerSpec {
    ContainerSpec {
        name: name.to_string(),
        image: image.to_string(),
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

pub(crate) fn make_sidecar_spec(name: &str, image: &str) -> ContainerSpec {
    let mut container = make_container_spec(name, image);
    container.sidecar = true;
    container
}

/// A pod named `name` with a single main container called `server`.
pub(crate) fn make_pod(name: &str, restart_policy: RestartPolicy) -> PodTask {
    PodTask {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        metadata: ObjectMeta {
            uid: Uuid::new_v4(),
            name: name.to_string(),
            namespace: "default".to_string(),
            labels: Default::default(),
            annotations: Default::default(),
        },
        spec: PodSpec {
            containers: vec![make_container_spec("server", "nginx:1.25")],
            restart_policy,
            ..Default::default()
        },
    }
}

/// An observed container status matching `spec` (id `id-<name>`, recorded
/// hash equal to the spec hash). Exited containers finished an hour ago so
/// restart backoff stays quiet unless a test wants it.
pub(crate) fn make_container_status_for(
    spec: &ContainerSpec,
    state: ContainerState,
    exit_code: i32,
) -> ContainerStatus {
    let base: DateTime<Utc> = Utc::now() - chrono::Duration::hours(2);
    ContainerStatus {
        id: format!("id-{}", spec.name),
        name: spec.name.clone(),
        state,
        created_at: base,
        started_at: (state != ContainerState::Created).then_some(base),
        finished_at: (state == ContainerState::Exited)
            .then(|| Utc::now() - chrono::Duration::hours(1)),
        exit_code,
        image: spec.image.clone(),
        image_ref: spec.image.clone(),
        hash: hash_container(spec),
        restart_count: 0,
        reason: String::new(),
        message: String::new(),
    }
}

pub(crate) fn make_sandbox_status(
    id: &str,
    attempt: u32,
    state: PodSandboxState,
    ip: &str,
    network_namespace: NamespaceMode,
) -> PodSandboxStatus {
    PodSandboxStatus {
        id: id.to_string(),
        metadata: Some(PodSandboxMetadata {
            name: "pod".to_string(),
            uid: Uuid::new_v4().to_string(),
            namespace: "default".to_string(),
            attempt,
        }),
        state,
        created_at: attempt as i64,
        network: Some(PodSandboxNetworkStatus {
            ip: ip.to_string(),
            additional_ips: vec![],
        }),
        linux: Some(LinuxPodSandboxStatus {
            namespaces: Some(Namespace {
                options: Some(NamespaceOption {
                    network: network_namespace,
                    ..Default::default()
                }),
            }),
        }),
        labels: Default::default(),
        annotations: Default::default(),
    }
}

pub(crate) fn make_ready_sandbox_status(id: &str, attempt: u32, ip: &str) -> PodSandboxStatus {
    make_sandbox_status(id, attempt, PodSandboxState::Ready, ip, NamespaceMode::Pod)
}

struct FakeContainer {
    status: api::ContainerStatus,
    pod_sandbox_id: String,
}

/// An in-memory [`RuntimeService`]: sandboxes and containers live in maps,
/// every call is recorded, and any operation can be made to fail by name.
#[derive(Default)]
pub(crate) struct FakeRuntimeService {
    version: Mutex<Option<VersionResponse>>,
    sandboxes: DashMap<String, (api::PodSandboxConfig, PodSandboxStatus)>,
    containers: DashMap<String, FakeContainer>,
    next_id: AtomicU64,
    clock: AtomicI64,
    calls: Mutex<Vec<String>>,
    stop_timeouts: Mutex<Vec<(String, i64)>>,
    last_pod_cidr: Mutex<Option<String>>,
    fail_ops: DashMap<String, String>,
}

impl FakeRuntimeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_version_response(&self, version: VersionResponse) {
        *self.version.lock().unwrap() = Some(version);
    }

    /// Makes the named operation fail with the given message until cleared.
    pub fn fail_on(&self, operation: &str, message: &str) {
        self.fail_ops
            .insert(operation.to_string(), message.to_string());
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == operation)
            .count()
    }

    pub fn last_stop_timeout(&self) -> Option<i64> {
        self.stop_timeouts.lock().unwrap().last().map(|(_, t)| *t)
    }

    pub fn last_pod_cidr(&self) -> Option<String> {
        self.last_pod_cidr.lock().unwrap().clone()
    }

    /// Names of the containers currently running, sorted.
    pub fn running_container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .iter()
            .filter(|entry| entry.value().status.state == api::ContainerState::Running)
            .filter_map(|entry| entry.value().status.metadata.as_ref().map(|m| m.name.clone()))
            .collect();
        names.sort();
        names
    }

    /// Flips a stored container into the given state, stamping finish time
    /// and exit code for exited containers.
    pub fn set_container_state(&self, container_id: &str, state: api::ContainerState, exit_code: i32) {
        if let Some(mut entry) = self.containers.get_mut(container_id) {
            entry.status.state = state;
            if state == api::ContainerState::Exited {
                entry.status.finished_at = self.tick();
                entry.status.exit_code = exit_code;
            }
        }
    }

    /// Seeds a running container labeled for `pod`, returning its id.
    pub fn add_running_container(
        &self,
        pod: &PodTask,
        container: &ContainerSpec,
        restart_count: u32,
    ) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("container-{n}");
        let now = self.tick();
        let status = api::ContainerStatus {
            id: id.clone(),
            metadata: Some(api::ContainerMetadata {
                name: container.name.clone(),
                attempt: restart_count,
            }),
            state: api::ContainerState::Running,
            created_at: now,
            started_at: now,
            image: Some(api::ImageSpec {
                image: container.image.clone(),
                annotations: Default::default(),
            }),
            image_ref: container.image.clone(),
            labels: new_container_labels(pod, container, restart_count, ContainerType::Main),
            ..Default::default()
        };
        self.containers.insert(
            id.clone(),
            FakeContainer {
                status,
                pod_sandbox_id: "sb-0".to_string(),
            },
        );
        id
    }

    fn check(&self, operation: &str) -> Result<()> {
        self.calls.lock().unwrap().push(operation.to_string());
        if let Some(message) = self.fail_ops.get(operation) {
            bail!("{}", message.value());
        }
        Ok(())
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn labels_match(
    selector: &std::collections::HashMap<String, String>,
    labels: &std::collections::HashMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

impl RuntimeService for FakeRuntimeService {
    fn version(&self, _api_version: &str) -> Result<VersionResponse> {
        self.check("version")?;
        Ok(self.version.lock().unwrap().clone().unwrap_or(VersionResponse {
            version: "0.1.0".to_string(),
            runtime_name: "fake-runtime".to_string(),
            runtime_version: "1.0.0".to_string(),
            runtime_api_version: "0.1.0".to_string(),
        }))
    }

    fn status(&self) -> Result<RuntimeStatus> {
        self.check("status")?;
        Ok(RuntimeStatus {
            conditions: vec![
                RuntimeCondition {
                    condition_type: "RuntimeReady".to_string(),
                    status: true,
                    ..Default::default()
                },
                RuntimeCondition {
                    condition_type: "NetworkReady".to_string(),
                    status: true,
                    ..Default::default()
                },
            ],
        })
    }

    fn run_pod_sandbox(
        &self,
        config: &api::PodSandboxConfig,
        _runtime_handler: &str,
    ) -> Result<String> {
        self.check("run_pod_sandbox")?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("sandbox-{n}");
        let network_namespace = config
            .linux
            .as_ref()
            .and_then(|l| l.namespace_options)
            .map(|o| o.network)
            .unwrap_or_default();
        let ip = if network_namespace == NamespaceMode::Node {
            String::new()
        } else {
            format!("10.1.0.{}", (n % 250) + 2)
        };
        let status = PodSandboxStatus {
            id: id.clone(),
            metadata: config.metadata.clone(),
            state: PodSandboxState::Ready,
            created_at: self.tick(),
            network: Some(PodSandboxNetworkStatus {
                ip,
                additional_ips: Vec::<PodIp>::new(),
            }),
            linux: Some(LinuxPodSandboxStatus {
                namespaces: Some(Namespace {
                    options: Some(NamespaceOption {
                        network: network_namespace,
                        ..Default::default()
                    }),
                }),
            }),
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
        };
        self.sandboxes.insert(id.clone(), (config.clone(), status));
        Ok(id)
    }

    fn stop_pod_sandbox(&self, pod_sandbox_id: &str) -> Result<()> {
        self.check("stop_pod_sandbox")?;
        let Some(mut entry) = self.sandboxes.get_mut(pod_sandbox_id) else {
            bail!("sandbox {pod_sandbox_id} not found");
        };
        entry.1.state = PodSandboxState::NotReady;
        Ok(())
    }

    fn pod_sandbox_status(&self, pod_sandbox_id: &str) -> Result<PodSandboxStatus> {
        self.check("pod_sandbox_status")?;
        match self.sandboxes.get(pod_sandbox_id) {
            Some(entry) => Ok(entry.1.clone()),
            None => bail!("sandbox {pod_sandbox_id} not found"),
        }
    }

    fn list_pod_sandbox(
        &self,
        filter: Option<&api::PodSandboxFilter>,
    ) -> Result<Vec<PodSandbox>> {
        self.check("list_pod_sandbox")?;
        let mut sandboxes: Vec<PodSandbox> = self
            .sandboxes
            .iter()
            .filter(|entry| {
                let status = &entry.value().1;
                let Some(filter) = filter else { return true };
                if let Some(id) = &filter.id
                    && id != &status.id
                {
                    return false;
                }
                if let Some(state) = filter.state
                    && state != status.state
                {
                    return false;
                }
                labels_match(&filter.label_selector, &status.labels)
            })
            .map(|entry| {
                let status = &entry.value().1;
                PodSandbox {
                    id: status.id.clone(),
                    metadata: status.metadata.clone(),
                    state: status.state,
                    created_at: status.created_at,
                    labels: status.labels.clone(),
                    annotations: status.annotations.clone(),
                }
            })
            .collect();
        sandboxes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sandboxes)
    }

    fn create_container(
        &self,
        pod_sandbox_id: &str,
        config: &api::ContainerConfig,
        _sandbox_config: &api::PodSandboxConfig,
    ) -> Result<String> {
        self.check("create_container")?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("container-{n}");
        let status = api::ContainerStatus {
            id: id.clone(),
            metadata: config.metadata.clone(),
            state: api::ContainerState::Created,
            created_at: self.tick(),
            image: config.image.clone(),
            image_ref: config
                .image
                .as_ref()
                .map(|i| i.image.clone())
                .unwrap_or_default(),
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
            log_path: config.log_path.clone(),
            ..Default::default()
        };
        self.containers.insert(
            id.clone(),
            FakeContainer {
                status,
                pod_sandbox_id: pod_sandbox_id.to_string(),
            },
        );
        Ok(id)
    }

    fn start_container(&self, container_id: &str) -> Result<()> {
        self.check("start_container")?;
        let Some(mut entry) = self.containers.get_mut(container_id) else {
            bail!("container {container_id} not found");
        };
        entry.status.state = api::ContainerState::Running;
        entry.status.started_at = self.tick();
        Ok(())
    }

    fn stop_container(&self, container_id: &str, timeout_seconds: i64) -> Result<()> {
        self.check("stop_container")?;
        self.stop_timeouts
            .lock()
            .unwrap()
            .push((container_id.to_string(), timeout_seconds));
        let Some(mut entry) = self.containers.get_mut(container_id) else {
            bail!("container {container_id} not found");
        };
        entry.status.state = api::ContainerState::Exited;
        entry.status.finished_at = self.tick();
        Ok(())
    }

    fn remove_container(&self, container_id: &str) -> Result<()> {
        self.check("remove_container")?;
        if self.containers.remove(container_id).is_none() {
            bail!("container {container_id} not found");
        }
        Ok(())
    }

    fn list_containers(&self, filter: Option<&api::ContainerFilter>) -> Result<Vec<api::Container>> {
        self.check("list_containers")?;
        let mut containers: Vec<api::Container> = self
            .containers
            .iter()
            .filter(|entry| {
                let container = entry.value();
                let Some(filter) = filter else { return true };
                if let Some(id) = &filter.id
                    && id != &container.status.id
                {
                    return false;
                }
                if let Some(state) = filter.state
                    && state != container.status.state
                {
                    return false;
                }
                if let Some(sandbox_id) = &filter.pod_sandbox_id
                    && sandbox_id != &container.pod_sandbox_id
                {
                    return false;
                }
                labels_match(&filter.label_selector, &container.status.labels)
            })
            .map(|entry| {
                let container = entry.value();
                api::Container {
                    id: container.status.id.clone(),
                    pod_sandbox_id: container.pod_sandbox_id.clone(),
                    metadata: container.status.metadata.clone(),
                    image: container.status.image.clone(),
                    image_ref: container.status.image_ref.clone(),
                    state: container.status.state,
                    created_at: container.status.created_at,
                    labels: container.status.labels.clone(),
                    annotations: container.status.annotations.clone(),
                }
            })
            .collect();
        containers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(containers)
    }

    fn container_status(&self, container_id: &str) -> Result<api::ContainerStatus> {
        self.check("container_status")?;
        match self.containers.get(container_id) {
            Some(entry) => Ok(entry.status.clone()),
            None => bail!("container {container_id} not found"),
        }
    }

    fn update_runtime_config(&self, config: &api::RuntimeConfig) -> Result<()> {
        self.check("update_runtime_config")?;
        *self.last_pod_cidr.lock().unwrap() = config
            .network_config
            .as_ref()
            .map(|n| n.pod_cidr.clone());
        Ok(())
    }
}

/// Records every event it sees.
#[derive(Default)]
pub(crate) struct RecordingRecorder {
    events: Mutex<Vec<(EventType, String, String)>>,
}

impl RecordingRecorder {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }
}

impl EventRecorder for RecordingRecorder {
    fn event(&self, _object: &ObjectRef, event_type: EventType, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((event_type, reason.to_string(), message.to_string()));
    }
}

/// Resolves pulls to the spec's image name; individual containers can be made
/// to fail by name.
#[derive(Default)]
pub(crate) struct FakeImagePuller {
    failures: DashMap<String, PullError>,
}

impl FakeImagePuller {
    pub fn fail_for(&self, container_name: &str, kind: SyncErrorKind, message: &str) {
        self.failures
            .insert(container_name.to_string(), PullError::new(kind, message));
    }
}

impl ImagePuller for FakeImagePuller {
    fn ensure_image_exists(
        &self,
        _pod: &PodTask,
        container: &ContainerSpec,
        _pull_secrets: &[ImagePullSecret],
    ) -> std::result::Result<String, PullError> {
        if let Some(failure) = self.failures.get(&container.name) {
            return Err(failure.value().clone());
        }
        Ok(container.image.clone())
    }
}

/// Hook runner whose post-start handler always fails.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FailingPostStartHooks;

impl crate::hooks::LifecycleHookRunner for FailingPostStartHooks {
    fn run_post_start(&self, _: &PodTask, _: &str, _: &ContainerSpec) -> Result<()> {
        bail!("post-start handler exited with 1")
    }

    fn run_pre_stop(&self, _: &PodTask, _: &str, _: &ContainerSpec) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct TestFixture {
    pub manager: RuntimeManager<Arc<FakeRuntimeService>>,
    pub runtime: Arc<FakeRuntimeService>,
    pub recorder: Arc<RecordingRecorder>,
    pub liveness: Arc<ProbeResultCache>,
    pub puller: Arc<FakeImagePuller>,
}

pub(crate) fn test_config() -> RuntimeManagerConfig {
    let root = std::env::temp_dir().join("libpodruntime-tests");
    RuntimeManagerConfig {
        machine_id: "machine-test".to_string(),
        node_ips: vec!["192.168.1.10".to_string()],
        pod_logs_root: root.join("logs"),
        seccomp_profile_root: root.join("seccomp"),
        cpu_cfs_quota: true,
        cpu_cfs_quota_period_micros: 100_000,
        features: FeatureGates {
            ephemeral_containers: true,
        },
    }
}

pub(crate) fn make_fixture_with_config(config: RuntimeManagerConfig) -> TestFixture {
    let runtime = Arc::new(FakeRuntimeService::new());
    let recorder = Arc::new(RecordingRecorder::default());
    let liveness = Arc::new(ProbeResultCache::new());
    let puller = Arc::new(FakeImagePuller::default());
    let manager = RuntimeManager::new(
        config,
        runtime.clone(),
        puller.clone(),
        recorder.clone(),
        liveness.clone(),
        Arc::new(NoopHooks),
        Arc::new(NoopHooks),
        Arc::new(StaticRuntimeHandler("runc".to_string())),
    )
    .expect("runtime manager construction");
    TestFixture {
        manager,
        runtime,
        recorder,
        liveness,
        puller,
    }
}

pub(crate) fn make_fixture() -> TestFixture {
    make_fixture_with_config(test_config())
}

pub(crate) fn make_manager() -> (RuntimeManager<Arc<FakeRuntimeService>>, Arc<FakeRuntimeService>)
{
    let fixture = make_fixture();
    (fixture.manager, fixture.runtime)
}
