//! src/error.rs

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Plugin '{0}' already added")]
    PluginExists(String),

    #[error("Plugin '{0}' not found")]
    PluginNotFound(String),

    #[error("Receiver {0} not found.")]
    ReceiverNotFound(String),

    #[error("connection {0} not found for method {1}")]
    ConnectionNotFound(String, String),

    #[error("Received unknown method: {0}")]
    UnknownMethod(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
