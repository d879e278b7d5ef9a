//! Error types for the request gateway.
//!
//! Business errors (non-2xx responses on ordinary calls) are not errors at this
//! layer: they come back as a plain [`Response`] for the caller to interpret.

use crate::transport::Response;
use thiserror::Error;

/// Failure to obtain any response from the remote endpoint.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Failure reading or writing the persisted session.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed session file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// No response at all; never retried.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Token refresh failed. The session has been wiped.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// The retried request was rejected again after a successful refresh.
    #[error("unauthorized after token refresh (HTTP {})", .0.status)]
    Unauthorized(Response),

    /// Business error returned by a login or signup call.
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected {
        status: u16,
        message: String,
        error_code: Option<String>,
    },

    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid response payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Build a `Rejected` error from a failed response, using the envelope
    /// message when the body carries one.
    pub fn rejected(response: &Response) -> Self {
        let envelope = crate::envelope::Envelope::from_response_lossy(response);
        GatewayError::Rejected {
            status: response.status,
            message: envelope.message,
            error_code: envelope.error_code,
        }
    }
}
