//! The portal API's uniform JSON envelope.
//!
//! Every resource answers with `{ success, data, message, error_code }`. The
//! gateway passes responses through untouched; callers decode the envelope.

use crate::transport::Response;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: String,
    pub error_code: Option<String>,
}

impl Envelope<Value> {
    /// Decode a response as an envelope, falling back to the raw body as the
    /// message when the server did not send one (proxies, HTML error pages).
    pub fn from_response_lossy(response: &Response) -> Self {
        match response.envelope::<Value>() {
            Ok(envelope) => envelope,
            Err(_) => Envelope {
                success: response.is_success(),
                data: None,
                message: response.body.trim().to_string(),
                error_code: None,
            },
        }
    }
}
