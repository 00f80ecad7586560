use std::path::PathBuf;

use maestro_core::MaestroError;
use maestro_protocol::ErrorInfo;

#[derive(Debug, thiserror::Error)]
pub enum AppBaseError {
    #[error(transparent)]
    World(#[from] MaestroError),

    #[error("Failed to connect to maestro at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error talking to maestro: {0}")]
    Io(#[from] std::io::Error),

    #[error("maestro rejected {method}: {error}")]
    Rejected {
        method: &'static str,
        error: ErrorInfo,
    },

    #[error("Timed out waiting for maestro to answer {method}")]
    Timeout { method: &'static str },

    #[error("Connection to maestro closed")]
    Disconnected,

    /// Blocking calls from inside a delegate callback would stall the reactor
    /// that delivers their own response.
    #[error("{0} cannot wait for maestro from inside a reactor callback")]
    ReentrantCall(&'static str),

    #[error("Malformed response to {method}: {details}")]
    MalformedResponse {
        method: &'static str,
        details: String,
    },
}

impl AppBaseError {
    /// The wire error code, when maestro refused the request.
    pub fn code(&self) -> Option<&str> {
        match self {
            AppBaseError::Rejected { error, .. } => Some(error.code.as_str()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppBaseError>;
