use std::error::Error;

use crate::{IdentifierError, SessionId};

#[derive(thiserror::Error, Debug)]
pub enum UptermError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session {0} already exists")]
    SessionAlreadyExists(SessionId),
    #[error("session {0} is not available yet")]
    SessionUnavailable(SessionId),
    #[error("authentication failure")]
    AuthFailure,
    #[error("routing misdirection")]
    RoutingMisdirection,
    #[error("permission denied: {0}")]
    PolicyDenied(String),
    #[error(transparent)]
    MalformedIdentifier(#[from] IdentifierError),
    #[error("inconsistent state error")]
    InconsistentState,
    #[error("session end")]
    SessionEnd,
    #[error(transparent)]
    Russh(#[from] russh::Error),
    #[error(transparent)]
    Keys(#[from] russh::keys::Error),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("deserialization failed: {0}")]
    DeserializeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl UptermError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }
}
