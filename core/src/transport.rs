//! The transport contract and its plain-data request/response types.
//!
//! # Design
//! The core never opens a socket. Requests and responses are described as
//! plain data with owned fields, and the actual exchange is performed by
//! whatever implements [`Transport`]: a real HTTP stack in production, a
//! scriptable fake in tests. Implementations receive the operation's
//! [`AbortSignal`] and should stop work early once it fires; the facade
//! additionally races the signal, so ignoring it only wastes effort.

use async_trait::async_trait;

use crate::cancel::AbortSignal;
use crate::error::ClientError;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP request described as plain data, with the URL fully resolved.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// A completed HTTP response described as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawResponse {
    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decode the body as JSON. An empty body decodes to `null`.
    pub fn json(&self) -> Result<serde_json::Value, ClientError> {
        if self.body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&self.body).map_err(|e| ClientError::Decode(e.to_string()))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The pluggable network primitive consumed by the facade.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute one request and return the completed response with its
    /// body already read. Transport-level failures (connection refused,
    /// closed mid-body) map to `ClientError::Network`; an abort observed
    /// through `signal` maps to `ClientError::Aborted`.
    async fn perform(&self, request: HttpRequest, signal: AbortSignal)
        -> Result<RawResponse, ClientError>;
}
