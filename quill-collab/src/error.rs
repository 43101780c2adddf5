//! Gateway-level error.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::session::SessionError;
use crate::storage::StoreError;

/// Anything that ends a connection or stops the server.
#[derive(Error, Debug)]
pub enum CollabError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
