//! Error types for maestro-core operations.
//!
//! Every variant maps onto a stable wire code through [`MaestroError::code`],
//! so the socket server can hand the same failure to a client without
//! inventing strings at the call site.

use std::path::PathBuf;

use maestro_protocol::{
    Channel, ErrorInfo, ParticipantId, ERROR_ALREADY_REGISTERED, ERROR_FORBIDDEN,
    ERROR_FORBIDDEN_CHANNEL, ERROR_INVALID_PARAMS, ERROR_NOT_FOUND, ERROR_NOT_REGISTERED,
    ERROR_POOL_EXHAUSTED, ERROR_REGISTRY_FULL,
};

/// All errors that can occur while running or joining a session.
#[derive(Debug, thiserror::Error)]
pub enum MaestroError {
    // ─────────────────────────────────────────────────────────────────────
    // World Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("No coordinator is running for world {index}")]
    NotRunning { index: u32 },

    #[error("A coordinator already owns world {index}")]
    AlreadyRunning { index: u32 },

    // ─────────────────────────────────────────────────────────────────────
    // Arena Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Memory pool of {requested} bytes is below the minimum of {minimum}")]
    PoolTooSmall { requested: usize, minimum: usize },

    #[error("Memory pool exhausted: requested {requested} bytes, {available} available")]
    PoolExhausted { requested: usize, available: usize },

    #[error("App registry is full ({capacity} records)")]
    RegistryFull { capacity: usize },

    #[error("OSK text of {len} bytes exceeds capacity of {capacity}")]
    OskTextTooLong { len: usize, capacity: usize },

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // ─────────────────────────────────────────────────────────────────────
    // Participant Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Participant {0} is not registered")]
    NotRegistered(ParticipantId),

    #[error("Connection is already registered as participant {0}")]
    AlreadyRegistered(ParticipantId),

    #[error("Participant {participant} may not use channel {channel}")]
    ForbiddenChannel {
        participant: ParticipantId,
        channel: Channel,
    },

    #[error("Participant {participant} may not {action}")]
    Forbidden {
        participant: ParticipantId,
        action: &'static str,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Supervisor Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{shell} exited before registering ({exit})")]
    ShellExited { shell: &'static str, exit: String },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Configuration invalid: {0}")]
    ConfigInvalid(String),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience type alias for Results using MaestroError.
pub type Result<T> = std::result::Result<T, MaestroError>;

impl MaestroError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        MaestroError::Io {
            context: context.into(),
            source,
        }
    }

    /// Wire code reported to clients for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            MaestroError::PoolExhausted { .. } | MaestroError::PoolTooSmall { .. } => {
                ERROR_POOL_EXHAUSTED
            }
            MaestroError::RegistryFull { .. } => ERROR_REGISTRY_FULL,
            MaestroError::OskTextTooLong { .. } => ERROR_INVALID_PARAMS,
            MaestroError::RecordNotFound(_) => ERROR_NOT_FOUND,
            MaestroError::NotRegistered(_) => ERROR_NOT_REGISTERED,
            MaestroError::AlreadyRegistered(_) => ERROR_ALREADY_REGISTERED,
            MaestroError::ForbiddenChannel { .. } => ERROR_FORBIDDEN_CHANNEL,
            MaestroError::Forbidden { .. } => ERROR_FORBIDDEN,
            MaestroError::NotRunning { .. }
            | MaestroError::AlreadyRunning { .. }
            | MaestroError::Spawn { .. }
            | MaestroError::ShellExited { .. }
            | MaestroError::HomeDirNotFound
            | MaestroError::ConfigMalformed { .. }
            | MaestroError::ConfigInvalid(_)
            | MaestroError::Io { .. } => "internal_error",
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.to_string())
    }
}

impl From<MaestroError> for ErrorInfo {
    fn from(err: MaestroError) -> Self {
        err.to_error_info()
    }
}
