//! The narrow client surface this crate consumes from a container runtime.
//!
//! [`RuntimeService`] mirrors the runtime endpoints the reconciler actually
//! calls. Every operation is a single blocking call carrying the caller's
//! deadline; the client never retries, and errors surface to the caller
//! unchanged. [`InstrumentedRuntimeService`] wraps any implementation and
//! records per-operation latency and outcome.

use std::time::Instant;

use anyhow::Result;
use tracing::{debug, warn};

pub mod api;

use api::{
    Container, ContainerConfig, ContainerFilter, ContainerStatus, PodSandbox, PodSandboxConfig,
    PodSandboxFilter, PodSandboxStatus, RuntimeConfig, RuntimeStatus, VersionResponse,
};

/// Blocking client for the consumed runtime endpoints.
///
/// Implementations are shared across pod sync workers and must be safe for
/// concurrent use.
pub trait RuntimeService: Send + Sync {
    /// Reports the runtime's name and version information.
    fn version(&self, api_version: &str) -> Result<VersionResponse>;

    /// Reports the runtime's readiness conditions.
    fn status(&self) -> Result<RuntimeStatus>;

    /// Creates and starts a pod sandbox, returning its id.
    fn run_pod_sandbox(&self, config: &PodSandboxConfig, runtime_handler: &str) -> Result<String>;

    /// Stops a pod sandbox. Removal is left to garbage collection.
    fn stop_pod_sandbox(&self, pod_sandbox_id: &str) -> Result<()>;

    fn pod_sandbox_status(&self, pod_sandbox_id: &str) -> Result<PodSandboxStatus>;

    fn list_pod_sandbox(&self, filter: Option<&PodSandboxFilter>) -> Result<Vec<PodSandbox>>;

    /// Creates a container inside a sandbox, returning its id.
    fn create_container(
        &self,
        pod_sandbox_id: &str,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
    ) -> Result<String>;

    fn start_container(&self, container_id: &str) -> Result<()>;

    /// Stops a container, allowing up to `timeout_seconds` for graceful
    /// shutdown before the runtime escalates.
    fn stop_container(&self, container_id: &str, timeout_seconds: i64) -> Result<()>;

    fn remove_container(&self, container_id: &str) -> Result<()>;

    fn list_containers(&self, filter: Option<&ContainerFilter>) -> Result<Vec<Container>>;

    fn container_status(&self, container_id: &str) -> Result<ContainerStatus>;

    /// Pushes updated runtime configuration (currently the pod CIDR) down to
    /// the runtime.
    fn update_runtime_config(&self, config: &RuntimeConfig) -> Result<()>;
}

impl<T: RuntimeService + ?Sized> RuntimeService for std::sync::Arc<T> {
    fn version(&self, api_version: &str) -> Result<VersionResponse> {
        (**self).version(api_version)
    }

    fn status(&self) -> Result<RuntimeStatus> {
        (**self).status()
    }

    fn run_pod_sandbox(&self, config: &PodSandboxConfig, runtime_handler: &str) -> Result<String> {
        (**self).run_pod_sandbox(config, runtime_handler)
    }

    fn stop_pod_sandbox(&self, pod_sandbox_id: &str) -> Result<()> {
        (**self).stop_pod_sandbox(pod_sandbox_id)
    }

    fn pod_sandbox_status(&self, pod_sandbox_id: &str) -> Result<PodSandboxStatus> {
        (**self).pod_sandbox_status(pod_sandbox_id)
    }

    fn list_pod_sandbox(&self, filter: Option<&PodSandboxFilter>) -> Result<Vec<PodSandbox>> {
        (**self).list_pod_sandbox(filter)
    }

    fn create_container(
        &self,
        pod_sandbox_id: &str,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
    ) -> Result<String> {
        (**self).create_container(pod_sandbox_id, config, sandbox_config)
    }

    fn start_container(&self, container_id: &str) -> Result<()> {
        (**self).start_container(container_id)
    }

    fn stop_container(&self, container_id: &str, timeout_seconds: i64) -> Result<()> {
        (**self).stop_container(container_id, timeout_seconds)
    }

    fn remove_container(&self, container_id: &str) -> Result<()> {
        (**self).remove_container(container_id)
    }

    fn list_containers(&self, filter: Option<&ContainerFilter>) -> Result<Vec<Container>> {
        (**self).list_containers(filter)
    }

    fn container_status(&self, container_id: &str) -> Result<ContainerStatus> {
        (**self).container_status(container_id)
    }

    fn update_runtime_config(&self, config: &RuntimeConfig) -> Result<()> {
        (**self).update_runtime_config(config)
    }
}

/// Wraps a [`RuntimeService`] and records latency and outcome per operation.
pub struct InstrumentedRuntimeService<R> {
    inner: R,
}

impl<R: RuntimeService> InstrumentedRuntimeService<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn observe<T>(&self, operation: &'static str, started: Instant, result: Result<T>) -> Result<T> {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(operation, elapsed_ms, "[cri] runtime operation completed"),
            Err(error) => {
                warn!(operation, elapsed_ms, error = %error, "[cri] runtime operation failed")
            }
        }
        result
    }
}

impl<R: RuntimeService> RuntimeService for InstrumentedRuntimeService<R> {
    fn version(&self, api_version: &str) -> Result<VersionResponse> {
        let started = Instant::now();
        let result = self.inner.version(api_version);
        self.observe("version", started, result)
    }

    fn status(&self) -> Result<RuntimeStatus> {
        let started = Instant::now();
        let result = self.inner.status();
        self.observe("status", started, result)
    }

    fn run_pod_sandbox(&self, config: &PodSandboxConfig, runtime_handler: &str) -> Result<String> {
        let started = Instant::now();
        let result = self.inner.run_pod_sandbox(config, runtime_handler);
        self.observe("run_pod_sandbox", started, result)
    }

    fn stop_pod_sandbox(&self, pod_sandbox_id: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.stop_pod_sandbox(pod_sandbox_id);
        self.observe("stop_pod_sandbox", started, result)
    }

    fn pod_sandbox_status(&self, pod_sandbox_id: &str) -> Result<PodSandboxStatus> {
        let started = Instant::now();
        let result = self.inner.pod_sandbox_status(pod_sandbox_id);
        self.observe("pod_sandbox_status", started, result)
    }

    fn list_pod_sandbox(&self, filter: Option<&PodSandboxFilter>) -> Result<Vec<PodSandbox>> {
        let started = Instant::now();
        let result = self.inner.list_pod_sandbox(filter);
        self.observe("list_pod_sandbox", started, result)
    }

    fn create_container(
        &self,
        pod_sandbox_id: &str,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
    ) -> Result<String> {
        let started = Instant::now();
        let result = self
            .inner
            .create_container(pod_sandbox_id, config, sandbox_config);
        self.observe("create_container", started, result)
    }

    fn start_container(&self, container_id: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.start_container(container_id);
        self.observe("start_container", started, result)
    }

    fn stop_container(&self, container_id: &str, timeout_seconds: i64) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.stop_container(container_id, timeout_seconds);
        self.observe("stop_container", started, result)
    }

    fn remove_container(&self, container_id: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.remove_container(container_id);
        self.observe("remove_container", started, result)
    }

    fn list_containers(&self, filter: Option<&ContainerFilter>) -> Result<Vec<Container>> {
        let started = Instant::now();
        let result = self.inner.list_containers(filter);
        self.observe("list_containers", started, result)
    }

    fn container_status(&self, container_id: &str) -> Result<ContainerStatus> {
        let started = Instant::now();
        let result = self.inner.container_status(container_id);
        self.observe("container_status", started, result)
    }

    fn update_runtime_config(&self, config: &RuntimeConfig) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.update_runtime_config(config);
        self.observe("update_runtime_config", started, result)
    }
}
