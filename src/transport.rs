//! Transport layer for talking to the portal API.
//!
//! The gateway only needs "send this request, give me the status and body".
//! [`Transport`] is that seam; [`HttpTransport`] implements it over `ureq`.

use crate::envelope::Envelope;
use crate::error::TransportError;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-built request, ready to go on the wire
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl Request {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// The bearer token carried by this request, if any
    pub fn bearer(&self) -> Option<&str> {
        self.header("Authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// Raw response from the remote endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// Decode the body as the API's standard envelope
    pub fn envelope<T: DeserializeOwned>(&self) -> Result<Envelope<T>, serde_json::Error> {
        self.json()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Anything that can deliver a request and hand back a response.
///
/// Non-2xx statuses are responses, not errors. `Err` is reserved for the case
/// where nothing came back at all.
pub trait Transport: Send + Sync {
    fn send(&self, request: &Request) -> Result<Response, TransportError>;
}

/// HTTP transport backed by a shared `ureq` agent
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    /// Create a transport whose every request (refresh included) is bounded by `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    fn convert(resp: ureq::Response) -> Result<Response, TransportError> {
        let status = resp.status();
        let headers = resp
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                let value = resp.header(&name)?.to_string();
                Some((name, value))
            })
            .collect();
        let body = resp
            .into_string()
            .map_err(|e| TransportError(format!("Failed to read response body: {}", e)))?;
        Ok(Response {
            headers,
            ..Response::new(status, body)
        })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let mut req = self.agent.request(request.method.as_str(), &request.url);
        for (name, value) in &request.headers {
            req = req.set(name, value);
        }

        let resp = match &request.body {
            Some(body) => req.send_string(body),
            None => req.call(),
        };

        match resp {
            Ok(r) => Self::convert(r),
            // ureq reports 4xx/5xx as errors; the gateway wants them as responses
            Err(ureq::Error::Status(_, r)) => Self::convert(r),
            Err(e) => Err(TransportError(format!("Request failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!(Method::from_str("get"), Some(Method::Get));
        assert_eq!(Method::from_str("PATCH"), Some(Method::Patch));
        assert_eq!(Method::from_str("Delete"), Some(Method::Delete));
        assert_eq!(Method::from_str("TRACE"), None);
        assert_eq!(Method::Post.to_string(), "POST");
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = Request {
            method: Method::Get,
            url: "http://localhost/api".to_string(),
            headers: vec![("authorization".to_string(), "Bearer abc".to_string())],
            body: None,
        };
        assert_eq!(request.header("Authorization"), Some("Bearer abc"));
        assert_eq!(request.bearer(), Some("abc"));
        assert!(request.header("Content-Type").is_none());
    }

    #[test]
    fn test_response_success_range() {
        assert!(Response::new(200, "").is_success());
        assert!(Response::new(204, "").is_success());
        assert!(!Response::new(301, "").is_success());
        assert!(!Response::new(401, "").is_success());
        assert!(!Response::new(500, "").is_success());
    }

    #[test]
    fn test_unreachable_host_is_transport_error() {
        let transport = HttpTransport::new(Duration::from_millis(500));
        let request = Request {
            method: Method::Get,
            url: "http://127.0.0.1:1/api/v1/students/dashboard".to_string(),
            headers: Vec::new(),
            body: None,
        };
        let err = transport.send(&request).unwrap_err();
        assert!(err.0.contains("Request failed"));
    }
}
