//! Repository-style resource facade.
//!
//! # Design
//! `Resource<T>` ties a URL template, base parameters and a set of
//! adapters to an [`HttpClient`] and its own [`ReadRegistry`]. Reads are
//! deduplicated through the registry; mutations never are. Adapters are
//! capability closures passed as configuration: one maps an outgoing item
//! to its wire form, one maps a decoded body to typed items, one extracts
//! out-of-band metadata from response headers. Each operation returns a
//! [`ResourceHandle`] that resolves to an [`Envelope`], where voluntary
//! cancellation is a resolved state rather than an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cancel::AbortSignal;
use crate::client::{HttpClient, RequestOptions, UrlSpec};
use crate::dedup::{Dedup, DedupKey, ReadOutcome, ReadRegistry, ReadTicket, TicketControl};
use crate::error::ClientError;
use crate::fingerprint::fingerprint;
use crate::params::Params;
use crate::transport::{HttpMethod, RawResponse};

/// Out-of-band response information extracted by the metadata adapter.
pub type Metadata = BTreeMap<String, Value>;

/// Maps an outgoing item to its wire form.
pub type RequestAdapter<T> = Arc<dyn Fn(&T) -> Result<Value, ClientError> + Send + Sync>;
/// Maps a decoded response body to typed items.
pub type ResponseAdapter<T> = Arc<dyn Fn(Value) -> Result<Vec<T>, ClientError> + Send + Sync>;
/// Extracts metadata from a completed response.
pub type MetadataAdapter = Arc<dyn Fn(&RawResponse) -> Option<Metadata> + Send + Sync>;
/// Maps a canonical parameter serialization to a dedup key hash.
pub type HashFunction = Arc<dyn Fn(&str) -> u64 + Send + Sync>;

fn items_of(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn default_response_adapter<T: DeserializeOwned + 'static>() -> ResponseAdapter<T> {
    Arc::new(|value: Value| {
        items_of(value)
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(|e| ClientError::Decode(e.to_string())))
            .collect()
    })
}

/// Collects `Content-Language`, `Accept-Language` and `X-Total-Count`
/// (parsed as a number when possible). Produces no map when none are
/// present.
fn default_metadata(response: &RawResponse) -> Option<Metadata> {
    let mut metadata = Metadata::new();
    for name in ["content-language", "accept-language"] {
        if let Some(value) = response.header(name) {
            metadata.insert(name.to_string(), Value::String(value.to_string()));
        }
    }
    if let Some(value) = response.header("x-total-count") {
        let parsed = value
            .trim()
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        metadata.insert("x-total-count".to_string(), parsed);
    }
    if metadata.is_empty() {
        None
    } else {
        Some(metadata)
    }
}

/// Configuration for a [`Resource`].
pub struct ResourceConfig<T> {
    template: String,
    base_params: Params,
    http_client_options: RequestOptions,
    request_adapter: RequestAdapter<T>,
    response_adapter: ResponseAdapter<T>,
    metadata_adapter: MetadataAdapter,
    hash_function: HashFunction,
}

impl<T> ResourceConfig<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            base_params: Params::new(),
            http_client_options: RequestOptions::default(),
            request_adapter: Arc::new(|item: &T| {
                serde_json::to_value(item).map_err(|e| ClientError::Encode(e.to_string()))
            }),
            response_adapter: default_response_adapter::<T>(),
            metadata_adapter: Arc::new(|response: &RawResponse| default_metadata(response)),
            hash_function: Arc::new(|input: &str| fingerprint(input)),
        }
    }

    /// Facade-level parameters merged under every call's parameters.
    pub fn base_params(mut self, params: Params) -> Self {
        self.base_params = params;
        self
    }

    /// Base request options merged under per-call options.
    pub fn http_client_options(mut self, options: RequestOptions) -> Self {
        self.http_client_options = options;
        self
    }

    pub fn request_adapter(
        mut self,
        adapter: impl Fn(&T) -> Result<Value, ClientError> + Send + Sync + 'static,
    ) -> Self {
        self.request_adapter = Arc::new(adapter);
        self
    }

    pub fn response_adapter(
        mut self,
        adapter: impl Fn(Value) -> Result<Vec<T>, ClientError> + Send + Sync + 'static,
    ) -> Self {
        self.response_adapter = Arc::new(adapter);
        self
    }

    /// Convenience equivalent to a response adapter that maps each raw
    /// element through `decode` (a constructor-style per-item adapter).
    pub fn item_decoder(
        self,
        decode: impl Fn(Value) -> Result<T, ClientError> + Send + Sync + 'static,
    ) -> Self {
        let decode = Arc::new(decode);
        self.response_adapter(move |value| items_of(value).into_iter().map(|item| decode(item)).collect())
    }

    pub fn metadata_adapter(
        mut self,
        adapter: impl Fn(&RawResponse) -> Option<Metadata> + Send + Sync + 'static,
    ) -> Self {
        self.metadata_adapter = Arc::new(adapter);
        self
    }

    /// Replace the fingerprint function used for auto dedup keys.
    pub fn hash_function(mut self, hash: impl Fn(&str) -> u64 + Send + Sync + 'static) -> Self {
        self.hash_function = Arc::new(hash);
        self
    }
}

impl<T> Clone for ResourceConfig<T> {
    fn clone(&self) -> Self {
        Self {
            template: self.template.clone(),
            base_params: self.base_params.clone(),
            http_client_options: self.http_client_options.clone(),
            request_adapter: Arc::clone(&self.request_adapter),
            response_adapter: Arc::clone(&self.response_adapter),
            metadata_adapter: Arc::clone(&self.metadata_adapter),
            hash_function: Arc::clone(&self.hash_function),
        }
    }
}

/// Per-call options for a resource operation.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub request: RequestOptions,
    /// Read deduplication mode; ignored by mutations.
    pub dedup: Dedup,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(mut self, options: RequestOptions) -> Self {
        self.request = options;
        self
    }

    pub fn dedup(mut self, dedup: Dedup) -> Self {
        self.dedup = dedup;
        self
    }
}

/// The resolved result of a resource operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub ok: bool,
    pub aborted: bool,
    pub abort_reason: Option<String>,
    /// Decoded items; empty for aborted envelopes and bodyless responses.
    pub data: Vec<T>,
    pub metadata: Option<Metadata>,
}

impl<T> Envelope<T> {
    fn aborted(reason: Option<String>) -> Self {
        Self { ok: false, aborted: true, abort_reason: reason, data: Vec::new(), metadata: None }
    }

    /// First decoded item, as a convenience for single-object endpoints.
    pub fn item(&self) -> Option<&T> {
        self.data.first()
    }

    pub fn into_item(mut self) -> Option<T> {
        if self.data.is_empty() {
            None
        } else {
            Some(self.data.swap_remove(0))
        }
    }
}

/// A pending resource operation: the eventual envelope plus independent
/// cancellation handles.
pub struct ResourceHandle<T> {
    ticket: ReadTicket,
    response_adapter: ResponseAdapter<T>,
    metadata_adapter: MetadataAdapter,
}

impl<T> ResourceHandle<T> {
    pub fn control(&self) -> TicketControl {
        self.ticket.control()
    }

    pub fn abort(&self, reason: Option<&str>) {
        self.ticket.abort(reason);
    }

    pub fn signal(&self) -> AbortSignal {
        self.ticket.signal()
    }

    /// Await the envelope. Voluntary cancellation resolves as an aborted
    /// envelope; transport, decode and adapter failures are errors.
    pub async fn envelope(self) -> Result<Envelope<T>, ClientError> {
        match self.ticket.outcome().await? {
            ReadOutcome::Aborted { reason } => Ok(Envelope::aborted(reason)),
            ReadOutcome::Completed(response) => {
                let value = response.json()?;
                let data = (self.response_adapter)(value)?;
                let metadata = (self.metadata_adapter)(response.as_ref());
                Ok(Envelope { ok: true, aborted: false, abort_reason: None, data, metadata })
            }
        }
    }
}

/// Repository-style access to one resource collection.
pub struct Resource<T> {
    client: HttpClient,
    registry: ReadRegistry,
    config: ResourceConfig<T>,
}

impl<T> Resource<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build a resource on top of `client`, layering the config's base
    /// options over the client's.
    pub fn new(client: HttpClient, config: ResourceConfig<T>) -> Self {
        let client = client.extend(config.http_client_options.clone());
        Self { client, registry: ReadRegistry::new(), config }
    }

    /// Number of deduplicated reads currently in flight.
    pub fn reads_in_flight(&self) -> usize {
        self.registry.in_flight()
    }

    /// Deduplicated read. Per-call parameters override same-named base
    /// parameters; the merged map is rendered into the URL and
    /// fingerprinted for the dedup key.
    pub fn read(&self, params: Params, call: CallOptions) -> Result<ResourceHandle<T>, ClientError> {
        let merged = self.config.base_params.merged(&params);
        let spec = UrlSpec::Template {
            template: self.config.template.clone(),
            params: merged.clone(),
        };
        let (request, options) = self.client.prepare(HttpMethod::Get, &spec, Some(&call.request))?;
        let ticket = match call.dedup {
            Dedup::Off => ReadTicket::direct(self.client.dispatch(request, &options)),
            mode => {
                let key = match mode {
                    Dedup::Key(key) => key,
                    _ => DedupKey::Hash((self.config.hash_function)(&merged.canonical())),
                };
                let client = self.client.clone();
                self.registry.join(key, move || client.dispatch(request, &options))
            }
        };
        Ok(self.handle(ticket))
    }

    /// POST the adapted items. Never deduplicated.
    pub fn create(
        &self,
        items: &[T],
        params: Params,
        call: CallOptions,
    ) -> Result<ResourceHandle<T>, ClientError> {
        self.mutate(HttpMethod::Post, Some(items), params, call)
    }

    /// PUT the adapted items. Never deduplicated.
    pub fn update(
        &self,
        items: &[T],
        params: Params,
        call: CallOptions,
    ) -> Result<ResourceHandle<T>, ClientError> {
        self.mutate(HttpMethod::Put, Some(items), params, call)
    }

    /// DELETE. Never deduplicated; the envelope's data is empty unless
    /// the server returns a body.
    pub fn remove(&self, params: Params, call: CallOptions) -> Result<ResourceHandle<T>, ClientError> {
        self.mutate(HttpMethod::Delete, None, params, call)
    }

    fn mutate(
        &self,
        method: HttpMethod,
        items: Option<&[T]>,
        params: Params,
        call: CallOptions,
    ) -> Result<ResourceHandle<T>, ClientError> {
        let merged = self.config.base_params.merged(&params);
        let spec = UrlSpec::Template { template: self.config.template.clone(), params: merged };
        let mut overrides = call.request;
        if let Some(items) = items {
            overrides.body = Some(self.encode_payload(items)?);
            let has_content_type = overrides
                .headers
                .iter()
                .chain(self.client.options().headers.iter())
                .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
            if !has_content_type {
                overrides.headers.push(("content-type".to_string(), "application/json".to_string()));
            }
        }
        let (request, options) = self.client.prepare(method, &spec, Some(&overrides))?;
        debug!(%method, url = %request.url, "issuing mutation");
        Ok(self.handle(ReadTicket::direct(self.client.dispatch(request, &options))))
    }

    /// Adapt each item; a single item serializes as a bare object, several
    /// as an array.
    fn encode_payload(&self, items: &[T]) -> Result<String, ClientError> {
        let mut adapted = Vec::with_capacity(items.len());
        for item in items {
            adapted.push((self.config.request_adapter)(item)?);
        }
        let body = if adapted.len() == 1 {
            adapted.into_iter().next().unwrap_or(Value::Null)
        } else {
            Value::Array(adapted)
        };
        serde_json::to_string(&body).map_err(|e| ClientError::Encode(e.to_string()))
    }

    fn handle(&self, ticket: ReadTicket) -> ResourceHandle<T> {
        ResourceHandle {
            ticket,
            response_adapter: Arc::clone(&self.config.response_adapter),
            metadata_adapter: Arc::clone(&self.config.metadata_adapter),
        }
    }
}
