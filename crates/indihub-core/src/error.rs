//! Agent-wide error type
//!
//! One `thiserror` enum covers the failure modes of the core pipelines.
//! Ordinary I/O trouble is recoverable and handled close to the socket;
//! these variants are what crosses module boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed XML element: {0}")]
    Xml(String),

    #[error("tunnel closed by the cloud")]
    TunnelClosed,

    #[error("tunnel transport error: {0}")]
    Tunnel(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("INDI-server manager error: {0}")]
    Manager(String),

    #[error("relay registration failed: {0}")]
    Registration(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown indihub-agent mode: {0}")]
    UnknownMode(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Tunnel(err.to_string())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AgentError>;
