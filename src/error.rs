use thiserror::Error;

pub type Result<T> = std::result::Result<T, AdminError>;

/// Errors surfaced by the admin client
#[derive(Debug, Error)]
pub enum AdminError {
    /// Refresh token missing or rejected; both tokens have been cleared
    #[error("Session expired. Please sign in again.")]
    AuthExpired,

    /// Request exceeded the configured deadline
    #[error("Request timed out")]
    Timeout,

    /// Realtime channel could not connect or has gone away
    #[error("Realtime channel error: {0}")]
    Transport(String),

    /// Input rejected before any network call
    #[error("{0}")]
    Validation(String),

    /// Server answered with a non-success status
    #[error("Server returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    /// Response body did not have the expected shape
    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Credential storage failed: {0:#}")]
    Storage(anyhow::Error),
}

impl AdminError {
    /// Whether the caller has to sign in again
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, AdminError::AuthExpired)
    }
}

impl From<reqwest::Error> for AdminError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdminError::Timeout
        } else if err.is_decode() {
            AdminError::Decode(err.to_string())
        } else {
            AdminError::Network(err)
        }
    }
}

impl From<serde_json::Error> for AdminError {
    fn from(err: serde_json::Error) -> Self {
        AdminError::Decode(err.to_string())
    }
}
