//! Error types for shunt.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::types::SessionStatus;

/// Result type alias for shunt operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shunt.
#[derive(Error, Debug)]
pub enum Error {
    // Session start errors
    #[error("no valid target applications")]
    NoValidTargets,

    #[error("permission to create a virtual interface was denied: {0}")]
    PermissionDenied(String),

    #[error("virtual interface unavailable: {0}")]
    InterfaceUnavailable(String),

    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    // Collaborator errors
    #[error("tunnel engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Packet translation engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine not initialized")]
    NotInitialized,

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine failed to start: {0}")]
    StartFailed(String),

    #[error("engine failed to stop: {0}")]
    StopFailed(String),
}

/// Per-connection relay errors.
///
/// These never leave the connection task that produced them.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("header block exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },

    #[error("upstream {addr} connect failed: {reason}")]
    UpstreamConnect { addr: String, reason: String },

    #[error("upstream {addr} connect timed out after {secs}s")]
    UpstreamTimeout { addr: String, secs: u64 },

    #[error("upstream closed before completing its response")]
    UnterminatedResponse,

    #[error("upstream rejected tunnel: {0}")]
    TunnelRejected(String),
}

impl Error {
    /// Map a session start failure to the status code reported to callers.
    pub fn status(&self) -> SessionStatus {
        match self {
            Error::NoValidTargets => SessionStatus::NoValidTargets,
            Error::PermissionDenied(_) => SessionStatus::PermissionDenied,
            Error::InterfaceUnavailable(_) => SessionStatus::InterfaceUnavailable,
            Error::BindFailed { .. } | Error::Relay(_) => SessionStatus::BindFailed,
            Error::Io(_) => SessionStatus::InterfaceUnavailable,
            _ => SessionStatus::EngineUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::NoValidTargets.status(), SessionStatus::NoValidTargets);
        assert_eq!(
            Error::PermissionDenied("denied".into()).status(),
            SessionStatus::PermissionDenied
        );
        assert_eq!(
            Error::BindFailed {
                addr: "127.0.0.1:8888".parse().unwrap(),
                reason: "in use".into(),
            }
            .status(),
            SessionStatus::BindFailed
        );
        assert_eq!(
            Error::Engine(EngineError::StartFailed("boom".into())).status(),
            SessionStatus::EngineUnavailable
        );
    }

    #[test]
    fn test_io_and_relay_not_reported_as_engine() {
        let io = Error::Io(io::Error::new(io::ErrorKind::Other, "ioctl failed"));
        assert_eq!(io.status(), SessionStatus::InterfaceUnavailable);
        assert_eq!(
            Error::Relay(RelayError::UnterminatedResponse).status(),
            SessionStatus::BindFailed
        );
    }
}
