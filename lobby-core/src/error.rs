use thiserror::Error;

/// Errors raised by the lobby core.
///
/// None of these are fatal: callers log them and wait for the next
/// consistent update from the document.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LobbyError {
    #[error("Malformed machine state: {0}")]
    MalformedState(String),
    #[error("Invalid color {0:?}, expected #rrggbb")]
    InvalidColor(String),
    #[error("Undecodable document update: {0}")]
    InvalidUpdate(String),
    #[error("Failed to apply document update: {0}")]
    ApplyUpdate(String),
    #[error("Undecodable state vector: {0}")]
    InvalidStateVector(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for LobbyError {
    fn from(e: serde_json::Error) -> Self {
        LobbyError::Serialization(e.to_string())
    }
}
