//! Per-operation accounting for one sync cycle.
//!
//! Every sandbox or container operation the executor attempts is recorded as
//! a [`SyncResult`]; the aggregate [`PodSyncResult`] is what the higher layer
//! inspects to decide whether the cycle converged and which operations
//! failed.

use crate::error::SyncErrorKind;

/// The operation a sync result describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    CreatePodSandbox,
    ConfigPodSandbox,
    KillPodSandbox,
    StartContainer,
    KillContainer,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::CreatePodSandbox => "CreatePodSandbox",
            SyncAction::ConfigPodSandbox => "ConfigPodSandbox",
            SyncAction::KillPodSandbox => "KillPodSandbox",
            SyncAction::StartContainer => "StartContainer",
            SyncAction::KillContainer => "KillContainer",
        }
    }
}

/// Outcome of a single sandbox or container operation.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub action: SyncAction,
    /// What the operation acted on: a container name or a sandbox id.
    pub target: String,
    pub error: Option<SyncErrorKind>,
    pub message: String,
}

impl SyncResult {
    pub fn new(action: SyncAction, target: impl Into<String>) -> Self {
        Self {
            action,
            target: target.into(),
            error: None,
            message: String::new(),
        }
    }

    /// Marks this operation as failed.
    pub fn fail(&mut self, error: SyncErrorKind, message: impl Into<String>) {
        self.error = Some(error);
        self.message = message.into();
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Aggregated result of one sync cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PodSyncResult {
    pub sync_results: Vec<SyncResult>,
    /// A cycle-level failure outside any single operation.
    pub sync_error: Option<String>,
}

impl PodSyncResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sync_result(&mut self, result: SyncResult) {
        self.sync_results.push(result);
    }

    /// Merges another aggregate into this one, e.g. the kill path's results
    /// into the overall sync.
    pub fn add_pod_sync_result(&mut self, other: PodSyncResult) {
        self.sync_results.extend(other.sync_results);
        if self.sync_error.is_none() {
            self.sync_error = other.sync_error;
        }
    }

    /// Records a cycle-level failure.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.sync_error = Some(message.into());
    }

    /// Summarizes the first failure of the cycle, if any operation or the
    /// cycle itself failed.
    pub fn error(&self) -> Option<String> {
        if let Some(message) = &self.sync_error {
            return Some(message.clone());
        }
        self.sync_results.iter().find(|r| r.is_failed()).map(|r| {
            format!(
                "{} of {} failed: {}",
                r.action.as_str(),
                r.target,
                r.message
            )
        })
    }
}
