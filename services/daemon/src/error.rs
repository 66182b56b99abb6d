//! Daemon error taxonomy.
//!
//! Validation errors are produced before any backend call and never mutate
//! state. Backend and vault failures are converted here so that `?` carries
//! them to the RPC layer, which reports the stable `code()` per instance name.

use thiserror::Error;

use crate::daemon::InstanceState;
use crate::platform::PlatformError;
use crate::ssh::SshKeyError;
use crate::state::StateStoreError;
use crate::vault::VaultError;

/// Errors returned by daemon operations.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("instance \"{0}\" already exists")]
    NameConflict(String),

    #[error("instance \"{0}\" does not exist")]
    NameUnknown(String),

    #[error("invalid instance name \"{name}\": {reason}")]
    InvalidName { name: String, reason: String },

    #[error("cannot {command} instance \"{name}\" while it is {state}")]
    InvalidStateTransition {
        name: String,
        command: &'static str,
        state: String,
    },

    #[error("an operation is already in progress on instance \"{name}\" ({state})")]
    OperationInProgress { name: String, state: InstanceState },

    #[error("insufficient host resources: {0}")]
    ResourceUnavailable(String),

    #[error("image is not supported by this backend: {0}")]
    ImageIncompatible(String),

    #[error("image \"{0}\" not found")]
    ImageNotFound(String),

    #[error("image is corrupt: {0}")]
    ImageCorrupt(String),

    #[error("backend is unhealthy: {0}")]
    BackendUnhealthy(String),

    #[error("operation not supported by backend: {0}")]
    Unsupported(String),

    #[error("invalid resources: {0}")]
    InvalidResources(String),

    #[error("failed to persist registry: {0}")]
    PersistenceFailure(String),

    #[error("backend operation failed: {0}")]
    Backend(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    /// Stable machine-readable code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NameConflict(_) => "name_conflict",
            Self::NameUnknown(_) => "name_unknown",
            Self::InvalidName { .. } => "invalid_name",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::OperationInProgress { .. } => "operation_in_progress",
            Self::ResourceUnavailable(_) => "resource_unavailable",
            Self::ImageIncompatible(_) => "image_incompatible",
            Self::ImageNotFound(_) => "image_not_found",
            Self::ImageCorrupt(_) => "image_corrupt",
            Self::BackendUnhealthy(_) => "backend_unhealthy",
            Self::Unsupported(_) => "unsupported",
            Self::InvalidResources(_) => "invalid_resources",
            Self::PersistenceFailure(_) => "persistence_failure",
            Self::Backend(_) => "backend_failure",
            Self::Internal(_) => "internal",
        }
    }

    /// Returns true for errors detected before any state was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NameConflict(_)
                | Self::NameUnknown(_)
                | Self::InvalidName { .. }
                | Self::InvalidStateTransition { .. }
                | Self::OperationInProgress { .. }
                | Self::InvalidResources(_)
        )
    }

    pub(crate) fn invalid_transition(
        name: &str,
        command: &'static str,
        state: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidStateTransition {
            name: name.to_string(),
            command,
            state: state.to_string(),
        }
    }
}

impl From<PlatformError> for DaemonError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::ResourceUnavailable(msg) => Self::ResourceUnavailable(msg),
            PlatformError::ImageIncompatible(msg) => Self::ImageIncompatible(msg),
            PlatformError::Unsupported(msg) => Self::Unsupported(msg),
            PlatformError::Unhealthy(msg) => Self::BackendUnhealthy(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<VaultError> for DaemonError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::ImageNotFound(alias) => Self::ImageNotFound(alias),
            err @ VaultError::ImageCorrupt { .. } => Self::ImageCorrupt(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StateStoreError> for DaemonError {
    fn from(err: StateStoreError) -> Self {
        Self::PersistenceFailure(err.to_string())
    }
}

impl From<SshKeyError> for DaemonError {
    fn from(err: SshKeyError) -> Self {
        Self::Internal(err.to_string())
    }
}
