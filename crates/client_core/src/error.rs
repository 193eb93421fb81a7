use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy surfaced by the client runtime.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server rejected the credentials. The local session has been
    /// cleared; the user has to log in again.
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Validation or conflict rejections from the server.
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("no channel selected")]
    NoChannelSelected,
    #[error(transparent)]
    Local(#[from] anyhow::Error),
}

impl ClientError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::Timeout(_))
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthFailure(_))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
