use crate::admission::HandshakeError;
use thiserror::Error;

/// Errors that end a connection or the accept loop.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Admission was refused.
    #[error("handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
