//! Error types for the data-access client.
//!
//! # Design
//! Template problems get their own enum because they are synchronous and
//! surface before any network activity. Everything else lands in
//! `ClientError`. All variants are `Clone`: a deduplicated read delivers
//! one underlying failure to every waiting subscriber, so the error must
//! be shareable rather than consumed by the first awaiter.

use std::sync::Arc;

use thiserror::Error;

use crate::cancel::DEFAULT_ABORT_REASON;
use crate::transport::RawResponse;

/// Path-parameter types accepted by the template engine, as named in
/// `TemplateError::InvalidParamType`.
pub const ALLOWED_PARAM_TYPES: &str = "boolean, string, number";

/// Errors raised while rendering a URL template. Always surfaced to the
/// immediate caller before a request is issued; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// A required `:name` placeholder had no usable parameter.
    #[error("missing required path parameter `{name}`")]
    MissingParam { name: String },

    /// The parameter exists but its type cannot appear in a path.
    #[error("path parameter `{name}` has type {actual}; allowed types are {allowed}")]
    InvalidParamType {
        name: String,
        actual: &'static str,
        allowed: &'static str,
    },

    /// The parameter is an empty or whitespace-only string. This fails
    /// even for optional placeholders; only true absence is omitted.
    #[error("path parameter `{name}` is an empty string")]
    EmptyParam { name: String },
}

/// Errors produced by the transport facade, the dedup registry and the
/// resource facade.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// A completed HTTP exchange with a non-success status. The raw
    /// response is kept for inspection.
    #[error("HTTP {}: {}", .response.status, .response.body)]
    Status { response: RawResponse },

    /// The transport could not complete the exchange.
    #[error("transport failure: {0}")]
    Network(String),

    /// The response body could not be decoded as JSON.
    #[error("response decode failed: {0}")]
    Decode(String),

    /// The request payload could not be serialized.
    #[error("request encode failed: {0}")]
    Encode(String),

    /// A user-supplied adapter failed; the original error is the source.
    #[error("adapter failure: {source}")]
    Adapter {
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// The operation was voluntarily canceled. At the resource layer this
    /// is resolved into an aborted envelope rather than returned as an
    /// error.
    #[error("aborted: {}", .reason.as_deref().unwrap_or(DEFAULT_ABORT_REASON))]
    Aborted { reason: Option<String> },
}

impl ClientError {
    /// Wrap an arbitrary adapter error.
    pub fn adapter(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ClientError::Adapter { source: Arc::new(err) }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, ClientError::Aborted { .. })
    }
}
