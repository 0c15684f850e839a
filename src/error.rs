//! Typed failure kinds carried on per-operation sync results.

use thiserror::Error;

/// Distinguishable failure kinds for sandbox, container, and image
/// operations. Each maps to an outcome on a per-operation sync result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncErrorKind {
    #[error("runtime api version is not supported")]
    VersionNotSupported,
    #[error("failed to create pod sandbox")]
    CreatePodSandbox,
    #[error("failed to generate pod sandbox configuration")]
    ConfigPodSandbox,
    #[error("failed to stop pod sandbox")]
    KillPodSandbox,
    #[error("failed to start container")]
    StartContainer,
    #[error("failed to stop container")]
    KillContainer,
    #[error("container has run as root when it is required to run as non-root")]
    VerifyNonRoot,
    #[error("pre-start hook failed")]
    PreStartHook,
    #[error("post-start hook failed")]
    PostStartHook,
    #[error("pre-stop hook failed")]
    PreStopHook,
    #[error("failed to pull image")]
    ImagePull,
    #[error("image pull is backing off")]
    ImagePullBackOff,
    #[error("failed to inspect image")]
    ImageInspect,
    #[error("image registry is unavailable")]
    RegistryUnavailable,
    #[error("container restart is backing off")]
    CrashLoopBackOff,
}

/// A failed image pull with the kind the puller classified it as.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PullError {
    pub kind: SyncErrorKind,
    pub message: String,
}

impl PullError {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A failed container start with the kind recorded on its sync result.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StartError {
    pub kind: SyncErrorKind,
    pub message: String,
}

impl StartError {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<PullError> for StartError {
    fn from(err: PullError) -> Self {
        StartError {
            kind: err.kind,
            message: err.message,
        }
    }
}
