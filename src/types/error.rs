//! Error types for Keygate
//!
//! One enum covers both the key lifecycle failures (network, remote host,
//! capacity, registry, record store) and the lookup endpoint's HTTP errors.

use hyper::StatusCode;

/// Main error type for Keygate operations
#[derive(Debug, thiserror::Error)]
pub enum KeygateError {
    /// Transport failure or timeout talking to a host's management API
    #[error("Network error: {0}")]
    Network(String),

    /// Host answered with a non-success status
    #[error("Remote host rejected request with HTTP {0}")]
    RemoteRejected(u16),

    /// Host answered 2xx but the body is unusable
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("No host has a free slot")]
    CapacityExhausted,

    /// Revoke target is not bound to any user
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Host registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Record store error: {0}")]
    RecordStore(String),

    #[error("User not found: {0}")]
    UserNotFound(i64),

    /// Host did not confirm deletion with 204
    #[error("Key {key_id} was not deleted on host {host}")]
    DeleteFailed { host: String, key_id: String },

    #[error("Trial unavailable: {0}")]
    TrialUnavailable(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeygateError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Crypto(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) | Self::TrialUnavailable(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) | Self::UserNotFound(_) | Self::UnknownKey(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Network(_)
            | Self::RemoteRejected(_)
            | Self::MalformedResponse(_)
            | Self::DeleteFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::CapacityExhausted
            | Self::RegistryUnavailable(_)
            | Self::RecordStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text suitable for showing to the end user of the chat front end.
    ///
    /// Operational detail stays in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::CapacityExhausted => {
                "No free capacity right now, please contact support.".to_string()
            }
            Self::TrialUnavailable(reason) => reason.clone(),
            Self::UserNotFound(_) => "You are not registered yet.".to_string(),
            _ => "Something went wrong while issuing your key, please try again.".to_string(),
        }
    }

    /// Whether re-invoking the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::RemoteRejected(_)
                | Self::DeleteFailed { .. }
                | Self::RegistryUnavailable(_)
                | Self::RecordStore(_)
        )
    }
}

impl From<serde_json::Error> for KeygateError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<mongodb::error::Error> for KeygateError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::RecordStore(err.to_string())
    }
}

impl From<bson::ser::Error> for KeygateError {
    fn from(err: bson::ser::Error) -> Self {
        Self::RecordStore(format!("BSON encoding failed: {}", err))
    }
}

/// Result type alias for Keygate operations
pub type Result<T> = std::result::Result<T, KeygateError>;
