use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Why a candidate port was refused. Checks run in the order listed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("port {0} is not free: something is already listening on it")]
    PortInUseLocally(u16),

    #[error("port {port} is not available: reserved by instance {id}")]
    PortReservedByInstance { port: u16, id: String },

    #[error("port {0} is not valid: must be between 1024 and 65535 (exclusive)")]
    PortOutOfRange(u16),
}

/// Which of the two instance ports a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Http,
    Event,
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRole::Http => f.write_str("http port"),
            PortRole::Event => f.write_str("longpolling port"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("{role} rejected: {source}")]
    Port {
        role: PortRole,
        #[source]
        source: PortError,
    },

    #[error("http port and longpolling port must differ (both are {0})")]
    PortsNotDistinct(u16),

    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("{step} failed: {detail}")]
    CollaboratorCallFailed { step: String, detail: String },

    #[error("unsupported version '{version}' (supported: {supported})")]
    UnsupportedVersion { version: String, supported: String },

    #[error("template '{name}' for {kind} not found")]
    TemplateNotFound { kind: String, name: String },

    #[error("{operation} must run as root: instance directories belong to their service accounts")]
    RootRequired { operation: &'static str },

    #[error("user '{user}' is already attached to instance '{id}'")]
    UserAlreadyAttached { id: String, user: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt instance record {}: {source}", path.display())]
    CorruptRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl ManagerError {
    pub fn collaborator(step: impl Into<String>, detail: impl fmt::Display) -> Self {
        ManagerError::CollaboratorCallFailed {
            step: step.into(),
            detail: detail.to_string(),
        }
    }

    /// The underlying port error, if this is a port validation failure.
    pub fn port_error(&self) -> Option<&PortError> {
        match self {
            ManagerError::Port { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
