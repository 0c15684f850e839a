//! Pod runtime reconciler.
//!
//! Drives declarative pod specs toward the state a container runtime reports.
//! The planner ([`manager::actions::compute_pod_actions`]) turns a desired
//! [`PodTask`] and an observed [`PodStatus`] into a deterministic plan; the
//! executor ([`RuntimeManager::sync_pod`]) runs that plan against the runtime
//! with defined phase ordering, per-operation accounting, and restart
//! backoff. Collaborators that call back into the manager (image puller,
//! lifecycle hooks, liveness probing, event routing) are consumed through
//! narrow capability traits wired in at construction.
//!
//! The reconciler is blocking by contract: every runtime call is a single
//! blocking operation carrying the caller's deadline, and one sync cycle for
//! a pod runs to completion before the next. The caller serializes syncs per
//! pod UID; across pods the manager is safe for concurrent use.

pub mod backoff;
pub mod cache;
pub mod container;
pub mod cri;
pub mod error;
pub mod events;
pub mod hooks;
pub mod labels;
pub mod logreduction;
pub mod manager;
pub mod probe;
pub mod spec;
pub mod sync_result;

#[cfg(test)]
pub(crate) mod testing;

// re-export the public surface callers interact with
pub use backoff::Backoff;
pub use container::{ContainerState, ContainerStatus, Pod, PodStatus, RunningPod};
pub use error::SyncErrorKind;
pub use manager::actions::{ContainerToKill, PodActions};
pub use manager::{FeatureGates, RuntimeManager, RuntimeManagerConfig};
pub use spec::{ContainerSpec, PodSpec, PodTask, RestartPolicy};
pub use sync_result::{PodSyncResult, SyncAction, SyncResult};
