//! Error types for the knowledge mesh

use axum::http::StatusCode;
use thiserror::Error;

use crate::types::Identifier;

#[derive(Error, Debug)]
pub enum MeshError {
    /// The identifier could not be resolved anywhere that was reached.
    #[error("Object unknown: {0}")]
    NotFound(Identifier),

    /// A staged transfer file does not exist or was already served.
    #[error("Staged file not found: {0}")]
    StagedFileNotFound(String),

    /// A specific peer could not be contacted. Absorbed by the resolver.
    #[error("Peer unreachable: {peer}: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("Peer {host}:{port} already registered")]
    DuplicatePeer { host: String, port: u16 },

    /// Decoded content does not hash to the identifier it was stored or
    /// requested under. Never absorbed.
    #[error("Integrity violation: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server is not running")]
    ServerNotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, MeshError>;

impl MeshError {
    pub fn integrity(expected: &Identifier, actual: &Identifier) -> Self {
        Self::Integrity {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Status code used when this error ends an HTTP request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            MeshError::NotFound(_) | MeshError::StagedFileNotFound(_) => StatusCode::NOT_FOUND,
            MeshError::Protocol(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the resolver may treat this failure as "try the next peer".
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            MeshError::Unreachable { .. } | MeshError::Http(_) | MeshError::Protocol(_)
        )
    }
}
