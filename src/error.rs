//! Error taxonomy for the orchestration core.
//!
//! Validation errors (`NotFound`, `InvalidState`, `InvalidConfiguration`) are
//! returned to the caller before any job exists. Failures that happen once a
//! job is running are recorded on the job record instead of being propagated.

use thiserror::Error;

use crate::core::models::ProtocolType;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification used by callers that only care about the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    InvalidConfiguration,
    TransportFailure,
    EngineFailure,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("share not found: {0}")]
    ShareNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("device {0} has no enabled shares")]
    NoEnabledShares(String),

    #[error("share {0} is disabled")]
    ShareDisabled(String),

    #[error("a backup of {target} is already running (job {running_job})")]
    JobConflict { target: String, running_job: String },

    #[error("invalid job state: {0}")]
    InvalidState(String),

    #[error("invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("invalid filter rules: {0}")]
    InvalidRules(String),

    #[error("no plugin registered for protocol {0}")]
    UnsupportedProtocol(ProtocolType),

    #[error("device {0} has wake-on-LAN enabled but no MAC address")]
    MissingWakeAddress(String),

    #[error("invalid MAC address '{0}'")]
    InvalidMacAddress(String),

    #[error("failed to resolve credentials: {0}")]
    Credentials(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("unmount failed: {0}")]
    UnmountFailed(String),

    #[error("wake-on-LAN failed: {0}")]
    WakeFailed(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("backup engine error: {0}")]
    Engine(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DeviceNotFound(_) | Error::ShareNotFound(_) | Error::JobNotFound(_) => {
                ErrorKind::NotFound
            }
            Error::NoEnabledShares(_)
            | Error::ShareDisabled(_)
            | Error::JobConflict { .. }
            | Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::InvalidSchedule { .. }
            | Error::InvalidRules(_)
            | Error::UnsupportedProtocol(_)
            | Error::MissingWakeAddress(_)
            | Error::InvalidMacAddress(_)
            | Error::Credentials(_) => ErrorKind::InvalidConfiguration,
            Error::MountFailed(_)
            | Error::UnmountFailed(_)
            | Error::WakeFailed(_)
            | Error::Connection(_)
            | Error::Io(_) => ErrorKind::TransportFailure,
            Error::Engine(_) => ErrorKind::EngineFailure,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn invalid_schedule(expression: &str, reason: impl Into<String>) -> Self {
        Error::InvalidSchedule {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}
