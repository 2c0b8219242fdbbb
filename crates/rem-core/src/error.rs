use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a registry command was refused.
#[derive(Clone, Debug, PartialEq)]
pub enum RegistryError {
    /// At the platform cap and the eviction policy declined.
    CapacityExceeded { capacity: usize },
    /// Already registered; unregister first.
    DuplicateId(String),
    InvalidRegion(String),
    /// The platform cannot monitor regions at all.
    MonitoringUnavailable,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::CapacityExceeded { capacity } => {
                write!(f, "region capacity of {capacity} exceeded")
            }
            RegistryError::DuplicateId(id) => write!(f, "region '{id}' is already registered"),
            RegistryError::InvalidRegion(msg) => write!(f, "invalid region: {msg}"),
            RegistryError::MonitoringUnavailable => {
                write!(f, "region monitoring is unavailable on this platform")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            RegistryError::DuplicateId(_) => ErrorKind::DuplicateId,
            RegistryError::InvalidRegion(_) => ErrorKind::PlatformCallFailure,
            RegistryError::MonitoringUnavailable => ErrorKind::MonitoringUnavailable,
        }
    }
}

/// Error category carried by `EngineEvent::EngineError`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    CapacityExceeded,
    DuplicateId,
    MonitoringUnavailable,
    TransientLocationError,
    PlatformCallFailure,
    StorageFailure,
}

/// Failure reported by the platform location provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum PlatformFailure {
    /// No fix right now (momentary signal loss).
    LocationUnknown,
    Network,
    /// The user revoked access.
    Denied,
    MonitoringUnavailable,
    RegionMonitoringFailed { region_id: String, message: String },
    Other { message: String },
}

/// How the engine treats a `PlatformFailure`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Swallowed; the next fix retries implicitly.
    Transient,
    /// Surfaced to consumers as an error event.
    Terminal,
}

impl PlatformFailure {
    pub fn class(&self) -> FailureClass {
        match self {
            PlatformFailure::LocationUnknown | PlatformFailure::Network => FailureClass::Transient,
            PlatformFailure::Denied
            | PlatformFailure::MonitoringUnavailable
            | PlatformFailure::RegionMonitoringFailed { .. }
            | PlatformFailure::Other { .. } => FailureClass::Terminal,
        }
    }
}

impl fmt::Display for PlatformFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformFailure::LocationUnknown => write!(f, "location unknown"),
            PlatformFailure::Network => write!(f, "network error"),
            PlatformFailure::Denied => write!(f, "location access denied"),
            PlatformFailure::MonitoringUnavailable => write!(f, "region monitoring unavailable"),
            PlatformFailure::RegionMonitoringFailed { region_id, message } => {
                write!(f, "monitoring failed for region '{region_id}': {message}")
            }
            PlatformFailure::Other { message } => write!(f, "platform error: {message}"),
        }
    }
}

/// Error returned by an external collaborator (storage).
#[derive(Clone, Debug, PartialEq)]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CollaboratorError {}

/// Error returned by `EngineHandle` commands.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandError {
    /// The engine task has shut down.
    Closed,
    Registry(RegistryError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Closed => write!(f, "location engine is not running"),
            CommandError::Registry(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<RegistryError> for CommandError {
    fn from(e: RegistryError) -> Self {
        CommandError::Registry(e)
    }
}
