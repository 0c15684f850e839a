//! Capabilities the reconciler consumes from its collaborators.
//!
//! The runtime manager is constructed before the image puller, the hook
//! runner, and the resource bookkeeping that call back into it, so each of
//! those collaborators is narrowed to the interface the reconciler actually
//! needs and wired in at construction.

use anyhow::Result;

use crate::error::PullError;
use crate::spec::{ContainerSpec, ImagePullSecret, PodTask};

/// Runs the pre-stop and post-start handlers declared on a container spec.
///
/// Handlers may block for their full timeout; the sync cycle waits.
pub trait LifecycleHookRunner: Send + Sync {
    fn run_post_start(
        &self,
        pod: &PodTask,
        container_id: &str,
        container: &ContainerSpec,
    ) -> Result<()>;

    fn run_pre_stop(
        &self,
        pod: &PodTask,
        container_id: &str,
        container: &ContainerSpec,
    ) -> Result<()>;
}

/// Resource bookkeeping hooks around container start and stop, e.g. CPU or
/// device allocations owned by a higher layer.
pub trait InternalContainerLifecycle: Send + Sync {
    fn pre_start_container(
        &self,
        pod: &PodTask,
        container: &ContainerSpec,
        container_id: &str,
    ) -> Result<()>;

    fn post_stop_container(&self, container_id: &str) -> Result<()>;
}

/// Maps a pod's runtime class to the handler string passed to the runtime
/// when creating a sandbox.
pub trait RuntimeHandlerResolver: Send + Sync {
    fn lookup(&self, runtime_class_name: Option<&str>) -> Result<String>;
}

/// Makes a container's image available locally, returning the image
/// reference to record on the container. Pull policy (backoff, serialization,
/// QPS) is owned by the implementation.
pub trait ImagePuller: Send + Sync {
    fn ensure_image_exists(
        &self,
        pod: &PodTask,
        container: &ContainerSpec,
        pull_secrets: &[ImagePullSecret],
    ) -> std::result::Result<String, PullError>;
}

/// Hook runner and lifecycle bookkeeping that do nothing. Useful for callers
/// that manage neither.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl LifecycleHookRunner for NoopHooks {
    fn run_post_start(&self, _: &PodTask, _: &str, _: &ContainerSpec) -> Result<()> {
        Ok(())
    }

    fn run_pre_stop(&self, _: &PodTask, _: &str, _: &ContainerSpec) -> Result<()> {
        Ok(())
    }
}

impl InternalContainerLifecycle for NoopHooks {
    fn pre_start_container(&self, _: &PodTask, _: &ContainerSpec, _: &str) -> Result<()> {
        Ok(())
    }

    fn post_stop_container(&self, _: &str) -> Result<()> {
        Ok(())
    }
}

/// Resolves every runtime class to one fixed handler string.
#[derive(Debug, Clone, Default)]
pub struct StaticRuntimeHandler(pub String);

impl RuntimeHandlerResolver for StaticRuntimeHandler {
    fn lookup(&self, _runtime_class_name: Option<&str>) -> Result<String> {
        Ok(self.0.clone())
    }
}
