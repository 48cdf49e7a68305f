//! Deduplicating data-access client core.
//!
//! # Overview
//! URL template rendering, query-string serialization, and a
//! read-deduplication / cancellation layer over a pluggable HTTP
//! transport. Concurrent reads with the same parameter fingerprint share
//! one underlying network call; every caller gets its own result view
//! with independent cancellation, and only the last view to abort cancels
//! the real request.
//!
//! # Design
//! - The core never performs I/O itself: the network primitive is the
//!   [`Transport`] trait, and requests/responses are plain owned data.
//! - `template` is pure and usable on its own (link generation).
//! - Each [`HttpClient`]/[`Resource`] instance owns its own pending-read
//!   registry; separately scoped clients cannot cross-talk.
//! - Voluntary cancellation resolves to an aborted [`Envelope`], never to
//!   an error, so callers don't need error handling just to detect it.

pub mod cancel;
pub mod client;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod params;
pub mod resource;
pub mod template;
pub mod transport;

pub use cancel::{abort_channel, AbortHandle, AbortSignal, DEFAULT_ABORT_REASON};
pub use client::{HttpClient, Operation, RequestOptions, UrlSpec};
pub use dedup::{Dedup, DedupKey, ReadOutcome, ReadRegistry, ReadTicket, TicketControl};
pub use error::{ClientError, TemplateError, ALLOWED_PARAM_TYPES};
pub use fingerprint::{fingerprint, fingerprint_seeded};
pub use params::{ParamValue, Params};
pub use resource::{
    CallOptions, Envelope, HashFunction, Metadata, MetadataAdapter, RequestAdapter, Resource,
    ResourceConfig, ResourceHandle, ResponseAdapter,
};
pub use template::{
    build, path, query, render_path, serialize_query, ArrayFormat, QueryOptions, QueryOverrides,
    RenderedPath,
};
pub use transport::{HttpMethod, HttpRequest, RawResponse, Transport};
