//! Transport facade: verb methods over a pluggable transport.
//!
//! # Design
//! `HttpClient` holds an `Arc`'d [`Transport`] plus a set of base request
//! options (URL prefix, default headers, query-serialization defaults).
//! Each call resolves its URL spec through the template engine, merges
//! per-call options over the base, and spawns the exchange eagerly,
//! returning an [`Operation`] handle: the pending result plus an abort
//! handle and its signal. Template problems surface synchronously, before
//! any network activity.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::cancel::{abort_channel, AbortHandle, AbortSignal};
use crate::error::ClientError;
use crate::params::Params;
use crate::template::{self, QueryOptions, QueryOverrides};
use crate::transport::{HttpMethod, HttpRequest, RawResponse, Transport};

/// Either a literal URL/path or a template with parameters.
#[derive(Debug, Clone)]
pub enum UrlSpec {
    Raw(String),
    Template { template: String, params: Params },
}

impl UrlSpec {
    pub fn template(template: impl Into<String>, params: Params) -> Self {
        UrlSpec::Template { template: template.into(), params }
    }
}

impl From<&str> for UrlSpec {
    fn from(url: &str) -> Self {
        UrlSpec::Raw(url.to_string())
    }
}

impl From<String> for UrlSpec {
    fn from(url: String) -> Self {
        UrlSpec::Raw(url)
    }
}

/// Request-side configuration. Base options live on the client; per-call
/// options are merged over them (per-call wins, headers override by name,
/// query options merge field-wise).
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Prefix applied to non-absolute resolved URLs.
    pub base_url: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub query: QueryOverrides,
    /// Classify completed non-2xx exchanges as errors. Defaults to true.
    pub error_for_status: Option<bool>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn query(mut self, overrides: QueryOverrides) -> Self {
        self.query = overrides;
        self
    }

    pub fn error_for_status(mut self, enabled: bool) -> Self {
        self.error_for_status = Some(enabled);
        self
    }

    /// Merge `over` on top of `base`.
    pub fn merge(base: &Self, over: &Self) -> Self {
        Self {
            base_url: over.base_url.clone().or_else(|| base.base_url.clone()),
            headers: merge_headers(&base.headers, &over.headers),
            body: over.body.clone().or_else(|| base.body.clone()),
            query: base.query.overlay(&over.query),
            error_for_status: over.error_for_status.or(base.error_for_status),
        }
    }
}

fn merge_headers(base: &[(String, String)], over: &[(String, String)]) -> Vec<(String, String)> {
    let mut out = base.to_vec();
    for (name, value) in over {
        if let Some(slot) = out.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            slot.1 = value.clone();
        } else {
            out.push((name.clone(), value.clone()));
        }
    }
    out
}

/// A pluggable-transport HTTP facade.
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    options: RequestOptions,
}

impl HttpClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, options: RequestOptions::default() }
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: RequestOptions) -> Self {
        Self { transport, options }
    }

    /// Derive a new facade with `overrides` merged over this one's base
    /// options. The original instance and its in-flight operations are
    /// untouched.
    pub fn extend(&self, overrides: RequestOptions) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            options: RequestOptions::merge(&self.options, &overrides),
        }
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn get(&self, url: impl Into<UrlSpec>, options: Option<RequestOptions>) -> Result<Operation, ClientError> {
        self.request(HttpMethod::Get, url, options)
    }

    pub fn post(&self, url: impl Into<UrlSpec>, options: Option<RequestOptions>) -> Result<Operation, ClientError> {
        self.request(HttpMethod::Post, url, options)
    }

    pub fn put(&self, url: impl Into<UrlSpec>, options: Option<RequestOptions>) -> Result<Operation, ClientError> {
        self.request(HttpMethod::Put, url, options)
    }

    pub fn patch(&self, url: impl Into<UrlSpec>, options: Option<RequestOptions>) -> Result<Operation, ClientError> {
        self.request(HttpMethod::Patch, url, options)
    }

    pub fn delete(&self, url: impl Into<UrlSpec>, options: Option<RequestOptions>) -> Result<Operation, ClientError> {
        self.request(HttpMethod::Delete, url, options)
    }

    pub fn head(&self, url: impl Into<UrlSpec>, options: Option<RequestOptions>) -> Result<Operation, ClientError> {
        self.request(HttpMethod::Head, url, options)
    }

    /// Resolve the URL spec, merge options and issue the request. Must be
    /// called from within a Tokio runtime.
    pub fn request(
        &self,
        method: HttpMethod,
        url: impl Into<UrlSpec>,
        options: Option<RequestOptions>,
    ) -> Result<Operation, ClientError> {
        let (request, merged) = self.prepare(method, &url.into(), options.as_ref())?;
        Ok(self.dispatch(request, &merged))
    }

    /// Fail-fast half of `request`: resolve the URL and merge options
    /// without issuing anything.
    pub(crate) fn prepare(
        &self,
        method: HttpMethod,
        spec: &UrlSpec,
        overrides: Option<&RequestOptions>,
    ) -> Result<(HttpRequest, RequestOptions), ClientError> {
        let merged = match overrides {
            Some(over) => RequestOptions::merge(&self.options, over),
            None => self.options.clone(),
        };
        let url = self.resolve_url(spec, &merged)?;
        let request = HttpRequest {
            method,
            url,
            headers: merged.headers.clone(),
            body: merged.body.clone(),
        };
        Ok((request, merged))
    }

    fn resolve_url(&self, spec: &UrlSpec, options: &RequestOptions) -> Result<String, ClientError> {
        let rendered = match spec {
            UrlSpec::Raw(url) => url.clone(),
            UrlSpec::Template { template, params } => {
                let query_options = QueryOptions::default().apply(&options.query);
                template::build(template, params, &query_options)?
            }
        };
        Ok(match &options.base_url {
            Some(base) if !is_absolute(&rendered) => join_base(base, &rendered),
            _ => rendered,
        })
    }

    /// Issue a prepared request. The exchange runs eagerly in a spawned
    /// task; the returned handle races the abort signal against the
    /// transport, so an abort settles the operation even when the
    /// transport ignores its signal.
    pub(crate) fn dispatch(&self, request: HttpRequest, options: &RequestOptions) -> Operation {
        let (abort, signal) = abort_channel();
        let (tx, rx) = oneshot::channel();
        let transport = Arc::clone(&self.transport);
        let check_status = options.error_for_status.unwrap_or(true);
        let task_signal = signal.clone();
        debug!(method = %request.method, url = %request.url, "issuing request");

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = task_signal.cancelled() => {
                    Err(ClientError::Aborted { reason: task_signal.reason() })
                }
                result = transport.perform(request, task_signal.clone()) => match result {
                    Ok(response) if check_status && !response.is_success() => {
                        Err(ClientError::Status { response })
                    }
                    other => other,
                },
            };
            let _ = tx.send(outcome);
        });

        Operation { result: rx, abort, signal }
    }
}

fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn join_base(base: &str, rest: &str) -> String {
    let base = base.trim_end_matches('/');
    if rest.is_empty() {
        return base.to_string();
    }
    format!("{base}/{}", rest.trim_start_matches('/'))
}

/// One in-flight exchange: the pending response plus its cancellation
/// handles.
#[derive(Debug)]
pub struct Operation {
    result: oneshot::Receiver<Result<RawResponse, ClientError>>,
    abort: AbortHandle,
    signal: AbortSignal,
}

impl Operation {
    /// Request cancellation. A no-op once the operation has settled.
    pub fn abort(&self, reason: Option<&str>) {
        self.abort.abort(reason);
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Await the completed exchange. Cancellation resolves as
    /// `ClientError::Aborted`, never as a network failure.
    pub async fn response(self) -> Result<RawResponse, ClientError> {
        match self.result.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::Network("request task dropped before settling".to_string())),
        }
    }
}
