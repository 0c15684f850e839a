//! Event sink capability.
//!
//! The reconciler reports user-visible lifecycle milestones and failures as
//! events on the pod. It neither owns nor discovers subscribers; the caller
//! injects a recorder and routes events wherever it wants.

use uuid::Uuid;

use crate::spec::PodTask;

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Reference to the pod an event is about.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRef {
    pub uid: Uuid,
    pub name: String,
    pub namespace: String,
}

impl ObjectRef {
    pub fn from_pod(pod: &PodTask) -> Self {
        Self {
            uid: pod.metadata.uid,
            name: pod.metadata.name.clone(),
            namespace: pod.metadata.namespace.clone(),
        }
    }
}

/// Sink for pod events. Implementations must be safe for concurrent use.
pub trait EventRecorder: Send + Sync {
    fn event(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str);
}

// Reasons attached to the events this crate records.
pub const SANDBOX_CHANGED: &str = "SandboxChanged";
pub const FAILED_CREATE_POD_SANDBOX: &str = "FailedCreatePodSandBox";
pub const FAILED_STATUS_POD_SANDBOX: &str = "FailedStatusPodSandBox";
pub const BACKOFF_START_CONTAINER: &str = "BackOff";
pub const CREATED_CONTAINER: &str = "Created";
pub const STARTED_CONTAINER: &str = "Started";
pub const KILLING_CONTAINER: &str = "Killing";
pub const FAILED_POST_START_HOOK: &str = "FailedPostStartHook";
pub const FAILED_PRE_STOP_HOOK: &str = "FailedPreStopHook";
