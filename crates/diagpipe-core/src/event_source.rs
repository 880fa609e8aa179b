//! Event source and diagnostic session boundaries.
//!
//! The core consumes a push-based callback interface over decoded trace
//! events: handlers register by (provider, event) identity, an adapter
//! turns "handler fired" into an awaitable one-shot completion, and a
//! `completed` signal fires once no more events will be delivered after a
//! stop request. The byte-level decoding that produces [`EventRecord`]s
//! lives behind [`DiagnosticSessionProvider`]; fakes drive the same surface
//! in tests.
//!
//! Handlers run on the dispatching task and must not register or remove
//! subscriptions from within a callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::{oneshot, watch};

use crate::error::Result;
use crate::events::EventRecord;
use crate::pipeline::BoxFuture;

// =============================================================================
// Session configuration
// =============================================================================

/// Event verbosity requested from a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Critical,
    Error,
    Warning,
    #[default]
    Informational,
    Verbose,
}

/// One provider subscription inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider (event source) name.
    pub name: String,
    /// Keyword bitmask; `u64::MAX` subscribes to everything.
    pub keywords: u64,
    /// Requested verbosity.
    pub level: EventLevel,
    /// Provider key/value arguments (e.g. `EventCounterIntervalSec`).
    pub arguments: HashMap<String, String>,
}

impl ProviderConfig {
    /// Subscribe to all keywords of `name` at informational level.
    #[must_use]
    pub fn all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keywords: u64::MAX,
            level: EventLevel::Informational,
            arguments: HashMap::new(),
        }
    }

    /// Set the counter sampling interval argument.
    #[must_use]
    pub fn with_counter_interval(mut self, seconds: f64) -> Self {
        self.arguments
            .insert("EventCounterIntervalSec".to_string(), seconds.to_string());
        self
    }
}

/// Full configuration for one diagnostic session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSpec {
    /// Providers to enable.
    pub providers: Vec<ProviderConfig>,
    /// Whether to request rundown events on stop (type/method resolution).
    pub request_rundown: bool,
}

impl SessionSpec {
    /// Spec enabling the given providers, without rundown.
    #[must_use]
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers,
            request_rundown: false,
        }
    }
}

// =============================================================================
// Event source
// =============================================================================

type Callback = Box<dyn FnMut(&EventRecord) + Send>;

enum HandlerKind {
    /// Invoked for every matching event until unsubscribed.
    Streaming(Callback),
    /// Resolves a waiter on the first matching event, then dies.
    OneShot(Option<oneshot::Sender<EventRecord>>),
}

struct Subscription {
    id: u64,
    /// `None` matches every provider.
    provider: Option<String>,
    /// `None` matches every event of the provider.
    event: Option<String>,
    kind: HandlerKind,
}

impl Subscription {
    fn matches(&self, record: &EventRecord) -> bool {
        self.provider
            .as_deref()
            .is_none_or(|p| p == record.provider_name)
            && self
                .event
                .as_deref()
                .is_none_or(|e| e == record.event_name)
    }
}

struct SourceInner {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    completed_tx: watch::Sender<bool>,
    completed_rx: watch::Receiver<bool>,
}

/// Push-based event callback registry with an end-of-stream signal.
///
/// Cheap to clone; all clones observe the same registry.
#[derive(Clone)]
pub struct EventSource {
    inner: Arc<SourceInner>,
}

impl Default for EventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("completed", &*self.inner.completed_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl EventSource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        let (completed_tx, completed_rx) = watch::channel(false);
        Self {
            inner: Arc::new(SourceInner {
                subscriptions: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                completed_tx,
                completed_rx,
            }),
        }
    }

    /// Register a streaming handler for `(provider, event)`.
    ///
    /// The guard deregisters on drop.
    pub fn subscribe(
        &self,
        provider: impl Into<String>,
        event: impl Into<String>,
        handler: impl FnMut(&EventRecord) + Send + 'static,
    ) -> SubscriptionGuard {
        self.register(
            Some(provider.into()),
            Some(event.into()),
            HandlerKind::Streaming(Box::new(handler)),
        )
    }

    /// Register a streaming handler observing every event.
    pub fn subscribe_all(
        &self,
        handler: impl FnMut(&EventRecord) + Send + 'static,
    ) -> SubscriptionGuard {
        self.register(None, None, HandlerKind::Streaming(Box::new(handler)))
    }

    /// Awaitable completion for the first `(provider, event)` occurrence.
    #[must_use]
    pub fn wait_for(&self, provider: impl Into<String>, event: impl Into<String>) -> EventWaiter {
        let (tx, rx) = oneshot::channel();
        let guard = self.register(
            Some(provider.into()),
            Some(event.into()),
            HandlerKind::OneShot(Some(tx)),
        );
        EventWaiter { rx, _guard: guard }
    }

    /// Awaitable completion for the first event of any kind.
    #[must_use]
    pub fn wait_for_any(&self) -> EventWaiter {
        let (tx, rx) = oneshot::channel();
        let guard = self.register(None, None, HandlerKind::OneShot(Some(tx)));
        EventWaiter { rx, _guard: guard }
    }

    fn register(
        &self,
        provider: Option<String>,
        event: Option<String>,
        kind: HandlerKind,
    ) -> SubscriptionGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .lock()
            .expect("subscription lock")
            .push(Subscription {
                id,
                provider,
                event,
                kind,
            });
        SubscriptionGuard {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Deliver one record to every matching subscription.
    pub fn dispatch(&self, record: &EventRecord) {
        let mut subscriptions = self.inner.subscriptions.lock().expect("subscription lock");
        subscriptions.retain_mut(|sub| {
            if !sub.matches(record) {
                return true;
            }
            match &mut sub.kind {
                HandlerKind::Streaming(callback) => {
                    callback(record);
                    true
                }
                HandlerKind::OneShot(sender) => {
                    if let Some(tx) = sender.take() {
                        let _ = tx.send(record.clone());
                    }
                    false
                }
            }
        });
    }

    /// Signal that no further events will be delivered.
    ///
    /// Pending one-shot waiters resolve as "source completed" (no event).
    pub fn complete(&self) {
        self.inner
            .subscriptions
            .lock()
            .expect("subscription lock")
            .clear();
        let _ = self.inner.completed_tx.send(true);
    }

    /// Whether the source has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        *self.inner.completed_rx.borrow()
    }

    /// Wait for the end-of-stream signal.
    pub async fn completed(&self) {
        let mut rx = self.inner.completed_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Deregisters its subscription on drop.
pub struct SubscriptionGuard {
    inner: Arc<SourceInner>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Ok(mut subscriptions) = self.inner.subscriptions.lock() {
            subscriptions.retain(|sub| sub.id != self.id);
        }
    }
}

/// One-shot awaitable for a subscribed event.
pub struct EventWaiter {
    rx: oneshot::Receiver<EventRecord>,
    _guard: SubscriptionGuard,
}

impl EventWaiter {
    /// Wait for the event.
    ///
    /// Resolves `None` when the source completes without delivering a
    /// matching event.
    pub async fn wait(self) -> Option<EventRecord> {
        self.rx.await.ok()
    }
}

// =============================================================================
// Diagnostic session boundary
// =============================================================================

/// Control surface of an open diagnostic session.
pub trait SessionControl: Send {
    /// Stop the session. Buffered events are flushed, not discarded; the
    /// session's [`EventSource`] completes once the flush has drained.
    fn stop<'a>(&'a mut self) -> BoxFuture<'a, Result<()>>;
}

/// An open session against a target process.
pub struct DiagnosticSession {
    /// Stop/flush control.
    pub control: Box<dyn SessionControl>,
    /// Decoded event delivery.
    pub source: EventSource,
    /// Raw session byte stream, for pipelines that egress it untouched.
    pub raw: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

impl std::fmt::Debug for DiagnosticSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticSession")
            .field("source", &self.source)
            .field("has_raw", &self.raw.is_some())
            .finish_non_exhaustive()
    }
}

/// Opens diagnostic sessions against a target process.
pub trait DiagnosticSessionProvider: Send + Sync + 'static {
    /// Start a session with the given provider subscriptions.
    fn start_session<'a>(&'a self, spec: &'a SessionSpec) -> BoxFuture<'a, Result<DiagnosticSession>>;
}
