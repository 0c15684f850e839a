//! Liveness oracle consumed by the planner.
//!
//! Probing itself runs in an external manager; the reconciler only asks for
//! the latest verdict per container id. A missing verdict is treated as a
//! pass, since a container without probe history has nothing held against it.

use dashmap::DashMap;

/// Outcome of the most recent probe execution for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeResultType {
    Success,
    Failure,
    #[default]
    Unknown,
}

/// Read side of the liveness subsystem: latest verdict per container id.
///
/// Implementations must be safe for concurrent use.
pub trait LivenessManager: Send + Sync {
    fn get(&self, container_id: &str) -> Option<ProbeResultType>;
}

/// Caches the latest probe result per container id.
///
/// Callers feed verdicts in from their probe workers; the planner reads them
/// out. Also convenient as a test double.
#[derive(Default)]
pub struct ProbeResultCache {
    results: DashMap<String, ProbeResultType>,
}

impl ProbeResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the latest verdict for a container.
    pub fn set(&self, container_id: impl Into<String>, result: ProbeResultType) {
        self.results.insert(container_id.into(), result);
    }

    /// Drops the verdict for a container, e.g. once it has been removed.
    pub fn remove(&self, container_id: &str) {
        self.results.remove(container_id);
    }
}

impl LivenessManager for ProbeResultCache {
    fn get(&self, container_id: &str) -> Option<ProbeResultType> {
        self.results.get(container_id).map(|r| *r.value())
    }
}
