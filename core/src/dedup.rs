//! Read deduplication registry.
//!
//! # Design
//! In-flight reads are tracked in a map keyed by a deduplication key
//! (usually the fingerprint of the canonical parameter serialization).
//! The first read for a key issues the underlying [`Operation`] and
//! stores a pending entry; reads arriving while it is in flight attach as
//! additional subscribers and get their own [`ReadTicket`], an independent
//! view with its own abort handle and signal.
//!
//! Reference counting is explicit: the subscriber table's size is the
//! refcount. Aborting a ticket detaches only that subscriber and resolves
//! its view immediately with an aborted outcome; when the table empties,
//! the registry cancels the underlying operation and removes the entry.
//! Settlement removes the entry exactly once and fans the shared outcome
//! out to every subscriber still attached, errors included, cloned per
//! subscriber rather than consumed by the first awaiter. A `settled` flag
//! checked under the entry lock keeps a late-settling operation from
//! overwriting views that already resolved as aborted.
//!
//! Each registry instance owns its own map; separately scoped clients get
//! separate registries and cannot cross-talk on a key collision.
//!
//! Lock order: the map's shard guard is always released before an entry's
//! mutex is taken, and map removals never run inside an entry's critical
//! section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cancel::{abort_channel, AbortHandle, AbortSignal};
use crate::client::Operation;
use crate::error::ClientError;
use crate::transport::RawResponse;

/// Key under which an in-flight read is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// Auto-computed fingerprint of the canonical parameter serialization.
    Hash(u64),
    /// Caller-supplied key, for deduplicating across calls the caller
    /// knows to be equivalent.
    Text(String),
}

impl From<u64> for DedupKey {
    fn from(hash: u64) -> Self {
        DedupKey::Hash(hash)
    }
}

impl From<&str> for DedupKey {
    fn from(key: &str) -> Self {
        DedupKey::Text(key.to_string())
    }
}

impl From<String> for DedupKey {
    fn from(key: String) -> Self {
        DedupKey::Text(key)
    }
}

/// Deduplication mode for a read call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Dedup {
    /// Fingerprint the merged parameters.
    #[default]
    Auto,
    /// Bypass the registry entirely.
    Off,
    /// Use an explicit key instead of the fingerprint.
    Key(DedupKey),
}

/// How a deduplicated read ended.
#[derive(Debug, Clone)]
pub enum ReadOutcome {
    /// The shared exchange completed; the response is shared between
    /// subscribers.
    Completed(Arc<RawResponse>),
    /// This view (or the underlying operation itself) was aborted.
    Aborted { reason: Option<String> },
}

type Settle = Result<ReadOutcome, ClientError>;

struct PendingRead {
    subscribers: HashMap<u64, oneshot::Sender<Settle>>,
    next_subscriber: u64,
    underlying: AbortHandle,
    settled: bool,
}

type PendingMap = DashMap<DedupKey, Arc<Mutex<PendingRead>>>;

/// Tracks in-flight reads for one client scope.
#[derive(Default)]
pub struct ReadRegistry {
    pending: Arc<PendingMap>,
}

impl ReadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Subscribe to the in-flight read under `key`, issuing a new
    /// underlying operation via `issue` if none is pending.
    pub fn join(&self, key: DedupKey, issue: impl FnOnce() -> Operation) -> ReadTicket {
        let mut issue = Some(issue);
        loop {
            // Fast path: attach to an existing entry. The map guard is
            // dropped before the entry mutex is taken.
            let existing = self.pending.get(&key).map(|slot| Arc::clone(slot.value()));
            if let Some(entry) = existing {
                let mut state = entry.lock().expect("pending read lock");
                if state.settled {
                    // Settled but not yet evicted; clear it and retry.
                    drop(state);
                    self.pending.remove_if(&key, |_, candidate| Arc::ptr_eq(candidate, &entry));
                    continue;
                }
                let (tx, rx) = oneshot::channel();
                let id = state.next_subscriber;
                state.next_subscriber += 1;
                state.subscribers.insert(id, tx);
                let refcount = state.subscribers.len();
                drop(state);
                debug!(?key, refcount, "joined in-flight read");
                return self.ticket(rx, key, id, entry);
            }

            match self.pending.entry(key.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let operation = issue.take().expect("issue consumed once")();
                    let (tx, rx) = oneshot::channel();
                    let mut subscribers = HashMap::new();
                    subscribers.insert(0, tx);
                    let entry = Arc::new(Mutex::new(PendingRead {
                        subscribers,
                        next_subscriber: 1,
                        underlying: operation.abort_handle(),
                        settled: false,
                    }));
                    slot.insert(Arc::clone(&entry));
                    debug!(?key, "issued new shared read");
                    self.spawn_driver(key.clone(), Arc::clone(&entry), operation);
                    return self.ticket(rx, key, 0, entry);
                }
            }
        }
    }

    fn ticket(
        &self,
        rx: oneshot::Receiver<Settle>,
        key: DedupKey,
        id: u64,
        entry: Arc<Mutex<PendingRead>>,
    ) -> ReadTicket {
        let (abort, signal) = abort_channel();
        let control = TicketControl {
            inner: ControlInner::Shared(Arc::new(SharedControl {
                key,
                id,
                entry,
                pending: Arc::clone(&self.pending),
                abort,
                signal,
            })),
        };
        ReadTicket { future: TicketFuture::Shared(rx), control }
    }

    /// Await the shared operation, then settle the entry and fan out.
    fn spawn_driver(&self, key: DedupKey, entry: Arc<Mutex<PendingRead>>, operation: Operation) {
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let settled: Settle = match operation.response().await {
                Ok(response) => Ok(ReadOutcome::Completed(Arc::new(response))),
                Err(ClientError::Aborted { reason }) => Ok(ReadOutcome::Aborted { reason }),
                Err(err) => {
                    warn!(?key, error = %err, "shared read failed");
                    Err(err)
                }
            };
            let subscribers = {
                let mut state = entry.lock().expect("pending read lock");
                if state.settled {
                    // Evicted by the last subscriber aborting; its views
                    // are already resolved and must stay that way.
                    return;
                }
                state.settled = true;
                std::mem::take(&mut state.subscribers)
            };
            pending.remove_if(&key, |_, candidate| Arc::ptr_eq(candidate, &entry));
            debug!(?key, fanout = subscribers.len(), "shared read settled");
            for (_, tx) in subscribers {
                let _ = tx.send(settled.clone());
            }
        });
    }
}

struct SharedControl {
    key: DedupKey,
    id: u64,
    entry: Arc<Mutex<PendingRead>>,
    pending: Arc<PendingMap>,
    abort: AbortHandle,
    signal: AbortSignal,
}

impl SharedControl {
    fn abort(&self, reason: Option<&str>) {
        let (own_tx, underlying) = {
            let mut state = self.entry.lock().expect("pending read lock");
            if state.settled {
                return;
            }
            let Some(tx) = state.subscribers.remove(&self.id) else {
                return;
            };
            let underlying = if state.subscribers.is_empty() {
                state.settled = true;
                Some(state.underlying.clone())
            } else {
                None
            };
            (tx, underlying)
        };

        self.abort.abort(reason);
        let _ = own_tx.send(Ok(ReadOutcome::Aborted { reason: self.signal.reason() }));

        if let Some(underlying) = underlying {
            self.pending.remove_if(&self.key, |_, candidate| Arc::ptr_eq(candidate, &self.entry));
            debug!(key = ?self.key, "last subscriber aborted; canceling shared read");
            underlying.abort(reason);
        } else {
            debug!(key = ?self.key, "subscriber aborted; shared read continues");
        }
    }
}

#[derive(Clone)]
enum ControlInner {
    Shared(Arc<SharedControl>),
    Direct { abort: AbortHandle, signal: AbortSignal },
}

/// Cloneable abort/signal handle for one ticket.
#[derive(Clone)]
pub struct TicketControl {
    inner: ControlInner,
}

impl TicketControl {
    /// Abort this subscriber's view. For a shared read this detaches only
    /// this subscriber unless it is the last one, in which case the
    /// underlying operation is canceled too. No-op once settled.
    pub fn abort(&self, reason: Option<&str>) {
        match &self.inner {
            ControlInner::Shared(shared) => shared.abort(reason),
            ControlInner::Direct { abort, .. } => abort.abort(reason),
        }
    }

    /// This view's own cancellation signal.
    pub fn signal(&self) -> AbortSignal {
        match &self.inner {
            ControlInner::Shared(shared) => shared.signal.clone(),
            ControlInner::Direct { signal, .. } => signal.clone(),
        }
    }
}

enum TicketFuture {
    Shared(oneshot::Receiver<Settle>),
    Direct(Operation),
}

/// One subscriber's view of a read: its pending outcome plus independent
/// cancellation handles.
pub struct ReadTicket {
    future: TicketFuture,
    control: TicketControl,
}

impl ReadTicket {
    /// Wrap a plain, non-deduplicated operation (registry bypassed).
    pub fn direct(operation: Operation) -> Self {
        let control = TicketControl {
            inner: ControlInner::Direct {
                abort: operation.abort_handle(),
                signal: operation.signal(),
            },
        };
        ReadTicket { future: TicketFuture::Direct(operation), control }
    }

    pub fn control(&self) -> TicketControl {
        self.control.clone()
    }

    pub fn abort(&self, reason: Option<&str>) {
        self.control.abort(reason);
    }

    pub fn signal(&self) -> AbortSignal {
        self.control.signal()
    }

    /// Await this view's outcome. Aborts of this view, or of the
    /// underlying operation itself, resolve as `ReadOutcome::Aborted`,
    /// never as an error.
    pub async fn outcome(self) -> Result<ReadOutcome, ClientError> {
        match self.future {
            TicketFuture::Shared(rx) => match rx.await {
                Ok(settled) => settled,
                Err(_) => Err(ClientError::Network("pending read dropped before settling".to_string())),
            },
            TicketFuture::Direct(operation) => match operation.response().await {
                Ok(response) => Ok(ReadOutcome::Completed(Arc::new(response))),
                Err(ClientError::Aborted { reason }) => Ok(ReadOutcome::Aborted { reason }),
                Err(err) => Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use crate::client::HttpClient;
    use crate::transport::{HttpMethod, HttpRequest, Transport};

    /// Counts calls and holds every response behind a gate so tests
    /// control exactly when the shared operation settles.
    struct GatedTransport {
        calls: AtomicUsize,
        gate: Semaphore,
        fail: bool,
    }

    impl GatedTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), gate: Semaphore::new(0), fail: false })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), gate: Semaphore::new(0), fail: true })
        }

        fn release(&self, permits: usize) {
            self.gate.add_permits(permits);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn perform(
            &self,
            request: HttpRequest,
            signal: AbortSignal,
        ) -> Result<RawResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                biased;
                () = signal.cancelled() => {
                    return Err(ClientError::Aborted { reason: signal.reason() });
                }
                permit = self.gate.acquire() => {
                    permit.expect("gate closed").forget();
                }
            }
            if self.fail {
                Err(ClientError::Network("connection reset".to_string()))
            } else {
                Ok(RawResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: format!(r#"{{"url":"{}"}}"#, request.url),
                })
            }
        }
    }

    fn issue_from(client: &HttpClient) -> impl FnOnce() -> Operation {
        let client = client.clone();
        move || client.request(HttpMethod::Get, "/alpha", None).expect("issue request")
    }

    async fn settle_in_flight() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_underlying_call() {
        let transport = GatedTransport::new();
        let client = HttpClient::new(transport.clone());
        let registry = ReadRegistry::new();

        let first = registry.join(DedupKey::Hash(7), issue_from(&client));
        let second = registry.join(DedupKey::Hash(7), issue_from(&client));
        assert_eq!(registry.in_flight(), 1);

        settle_in_flight().await;
        transport.release(1);

        let (a, b) = tokio::join!(first.outcome(), second.outcome());
        let (a, b) = (a.unwrap(), b.unwrap());
        match (&a, &b) {
            (ReadOutcome::Completed(left), ReadOutcome::Completed(right)) => {
                assert_eq!(left.body, right.body);
            }
            other => panic!("expected two completions, got {other:?}"),
        }
        assert_eq!(transport.calls(), 1);
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn partial_cancellation_leaves_other_subscribers_attached() {
        let transport = GatedTransport::new();
        let client = HttpClient::new(transport.clone());
        let registry = ReadRegistry::new();

        let first = registry.join(DedupKey::Hash(7), issue_from(&client));
        let second = registry.join(DedupKey::Hash(7), issue_from(&client));
        settle_in_flight().await;

        first.abort(Some("component unmounted"));
        match first.outcome().await.unwrap() {
            ReadOutcome::Aborted { reason } => {
                assert_eq!(reason.as_deref(), Some("component unmounted"));
            }
            other => panic!("expected aborted view, got {other:?}"),
        }
        // the shared call is still pending for the second subscriber
        assert_eq!(registry.in_flight(), 1);

        transport.release(1);
        match second.outcome().await.unwrap() {
            ReadOutcome::Completed(response) => assert_eq!(response.status, 200),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(transport.calls(), 1);
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn last_abort_cancels_the_underlying_operation() {
        let transport = GatedTransport::new();
        let client = HttpClient::new(transport.clone());
        let registry = ReadRegistry::new();

        let ticket = registry.join(DedupKey::Hash(7), issue_from(&client));
        let signal = ticket.signal();
        settle_in_flight().await;

        ticket.abort(None);
        match ticket.outcome().await.unwrap() {
            ReadOutcome::Aborted { reason } => assert_eq!(reason.as_deref(), Some("Aborted")),
            other => panic!("expected aborted view, got {other:?}"),
        }
        assert!(signal.is_aborted());
        assert_eq!(registry.in_flight(), 0);

        // the key is free again; a fresh read issues a fresh call
        let retry = registry.join(DedupKey::Hash(7), issue_from(&client));
        settle_in_flight().await;
        assert_eq!(transport.calls(), 2);
        transport.release(1);
        assert!(matches!(retry.outcome().await.unwrap(), ReadOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn failures_reach_every_subscriber() {
        let transport = GatedTransport::failing();
        let client = HttpClient::new(transport.clone());
        let registry = ReadRegistry::new();

        let first = registry.join(DedupKey::Hash(7), issue_from(&client));
        let second = registry.join(DedupKey::Hash(7), issue_from(&client));
        settle_in_flight().await;
        transport.release(1);

        let (a, b) = tokio::join!(first.outcome(), second.outcome());
        assert!(matches!(a, Err(ClientError::Network(_))));
        assert!(matches!(b, Err(ClientError::Network(_))));
        assert_eq!(transport.calls(), 1);
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn custom_text_keys_deduplicate() {
        let transport = GatedTransport::new();
        let client = HttpClient::new(transport.clone());
        let registry = ReadRegistry::new();

        let first = registry.join(DedupKey::from("shared-view"), issue_from(&client));
        let second = registry.join(DedupKey::from("shared-view"), issue_from(&client));
        settle_in_flight().await;
        transport.release(1);

        let (a, b) = tokio::join!(first.outcome(), second.outcome());
        assert!(matches!(a.unwrap(), ReadOutcome::Completed(_)));
        assert!(matches!(b.unwrap(), ReadOutcome::Completed(_)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_issue_distinct_calls() {
        let transport = GatedTransport::new();
        let client = HttpClient::new(transport.clone());
        let registry = ReadRegistry::new();

        let first = registry.join(DedupKey::Hash(1), issue_from(&client));
        let second = registry.join(DedupKey::Hash(2), issue_from(&client));
        settle_in_flight().await;
        assert_eq!(transport.calls(), 2);

        transport.release(2);
        let (a, b) = tokio::join!(first.outcome(), second.outcome());
        assert!(a.is_ok() && b.is_ok());
    }

    #[tokio::test]
    async fn registries_are_independent() {
        let transport = GatedTransport::new();
        let client = HttpClient::new(transport.clone());
        let left = ReadRegistry::new();
        let right = ReadRegistry::new();

        let first = left.join(DedupKey::Hash(7), issue_from(&client));
        let second = right.join(DedupKey::Hash(7), issue_from(&client));
        settle_in_flight().await;
        assert_eq!(transport.calls(), 2);

        transport.release(2);
        let (a, b) = tokio::join!(first.outcome(), second.outcome());
        assert!(a.is_ok() && b.is_ok());
    }

    #[tokio::test]
    async fn direct_tickets_bypass_the_registry() {
        let transport = GatedTransport::new();
        let client = HttpClient::new(transport.clone());

        let first = ReadTicket::direct(client.request(HttpMethod::Get, "/alpha", None).unwrap());
        let second = ReadTicket::direct(client.request(HttpMethod::Get, "/alpha", None).unwrap());
        settle_in_flight().await;
        assert_eq!(transport.calls(), 2);

        transport.release(2);
        let (a, b) = tokio::join!(first.outcome(), second.outcome());
        assert!(matches!(a.unwrap(), ReadOutcome::Completed(_)));
        assert!(matches!(b.unwrap(), ReadOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn direct_ticket_abort_resolves_as_aborted() {
        let transport = GatedTransport::new();
        let client = HttpClient::new(transport.clone());

        let ticket = ReadTicket::direct(client.request(HttpMethod::Get, "/alpha", None).unwrap());
        settle_in_flight().await;
        ticket.abort(Some("done"));
        match ticket.outcome().await.unwrap() {
            ReadOutcome::Aborted { reason } => assert_eq!(reason.as_deref(), Some("done")),
            other => panic!("expected aborted view, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn abort_after_settlement_is_a_no_op() {
        let transport = GatedTransport::new();
        let client = HttpClient::new(transport.clone());
        let registry = ReadRegistry::new();

        let ticket = registry.join(DedupKey::Hash(7), issue_from(&client));
        let control = ticket.control();
        settle_in_flight().await;
        transport.release(1);
        assert!(matches!(ticket.outcome().await.unwrap(), ReadOutcome::Completed(_)));

        control.abort(Some("too late"));
        assert_eq!(registry.in_flight(), 0);
        assert_eq!(transport.calls(), 1);
    }
}
