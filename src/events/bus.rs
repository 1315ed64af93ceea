//! Publish/subscribe hub for pipeline events
//!
//! Listeners register against a single [`EventKind`] or against
//! [`Subject::Any`], which observes every emission. Delivery for one
//! emission always iterates a point-in-time snapshot of the subscriber
//! list, so handlers may subscribe or unsubscribe freely during dispatch.
//!
//! A failing handler never interrupts an emission: the failure is counted,
//! logged, and re-published as a [`EventKind::ListenerError`] diagnostic.

use super::{Event, EventKind, EventMetadata, EventPayload};
use crate::error::Result;
use futures::future::{join_all, BoxFuture};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Boxed async event handler.
pub type Listener = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Per-subscription filter predicate.
pub type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Wrap an async closure into a [`Listener`].
pub fn listener<F, Fut>(f: F) -> Listener
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// What a subscription listens to: one event kind, or every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Kind(EventKind),
    Any,
}

/// Identifier handed back on registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Options accepted by [`EventBus::on_with`].
#[derive(Default)]
pub struct SubscribeOptions {
    pub filter: Option<Filter>,
    /// Deliver matching buffered history before any live event.
    pub replay: bool,
    /// Higher-priority subscriptions are delivered first; equal priorities
    /// keep registration order.
    pub priority: i32,
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    subject: Subject,
    handler: Listener,
    filter: Option<Filter>,
    priority: i32,
    once: bool,
}

/// Bus delivery and subscription counters.
#[derive(Debug, Clone, Default)]
pub struct BusMetrics {
    pub total_events: u64,
    pub events_by_kind: HashMap<EventKind, u64>,
    pub listeners_by_kind: HashMap<EventKind, usize>,
    pub wildcard_listeners: usize,
    pub listener_errors: u64,
}

#[derive(Default)]
struct BusInner {
    listeners: HashMap<EventKind, Vec<Subscription>>,
    wildcard: Vec<Subscription>,
    replay: Option<VecDeque<Event>>,
    replay_capacity: usize,
    next_id: u64,
    total_events: u64,
    events_by_kind: HashMap<EventKind, u64>,
    listener_errors: u64,
}

/// Typed publish/subscribe hub.
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
        }
    }

    /// Retain the most recent `capacity` events for replay to late
    /// subscribers.
    pub fn enable_replay(&self, capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.replay_capacity = capacity;
        inner.replay = Some(VecDeque::with_capacity(capacity));
    }

    /// Register a handler with default options.
    pub fn on(&self, subject: Subject, handler: Listener) -> SubscriptionId {
        self.register(subject, handler, SubscribeOptions::default(), false)
            .0
    }

    /// Register a handler that self-removes after its first invocation.
    pub fn once(&self, subject: Subject, handler: Listener) -> SubscriptionId {
        self.register(subject, handler, SubscribeOptions::default(), true)
            .0
    }

    /// Register a handler with filter/replay/priority options.
    ///
    /// With `replay: true`, matching buffered history is delivered before
    /// this call returns, so the subscriber observes history strictly
    /// before any event published after registration.
    pub async fn on_with(
        &self,
        subject: Subject,
        handler: Listener,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let replay = options.replay;
        let (id, history) = self.register(subject, handler.clone(), options, false);
        if replay {
            for event in history {
                if let Err(err) = handler(event).await {
                    self.note_listener_error();
                    warn!(error = %err, "replay handler failed");
                }
            }
        }
        id
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn off(&self, subject: Subject, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let list = match subject {
            Subject::Any => &mut inner.wildcard,
            Subject::Kind(kind) => match inner.listeners.get_mut(&kind) {
                Some(list) => list,
                None => return false,
            },
        };
        let before = list.len();
        list.retain(|sub| sub.id != id);
        before != list.len()
    }

    /// Remove every subscription for `subject`, or all subscriptions when
    /// `subject` is `None`.
    pub fn remove_all_listeners(&self, subject: Option<Subject>) {
        let mut inner = self.inner.lock().unwrap();
        match subject {
            Some(Subject::Any) => inner.wildcard.clear(),
            Some(Subject::Kind(kind)) => {
                inner.listeners.remove(&kind);
            }
            None => {
                inner.listeners.clear();
                inner.wildcard.clear();
            }
        }
    }

    /// Publish an event, awaiting each handler sequentially: kind-specific
    /// listeners first, then wildcard listeners, in registration order
    /// within equal priority.
    pub async fn publish(&self, event: Event) {
        self.emit(event, true).await;
    }

    /// Publish an event, running the snapshot of handlers concurrently and
    /// awaiting every completion. One handler's failure does not block or
    /// fail the others.
    pub async fn publish_async(&self, event: Event) {
        let snapshot = self.prepare(&event);
        let applicable: Vec<Subscription> = snapshot
            .into_iter()
            .filter(|sub| sub.filter.as_ref().map_or(true, |f| f(&event)))
            .collect();

        let results = join_all(applicable.iter().map(|sub| {
            let handler = sub.handler.clone();
            let event = event.clone();
            async move { handler(event).await }
        }))
        .await;

        for (sub, result) in applicable.iter().zip(results) {
            if sub.once {
                self.off(sub.subject, sub.id);
            }
            if let Err(err) = result {
                self.note_listener_error();
                warn!(kind = ?event.kind, error = %err, "listener failed during async emission");
                if event.kind != EventKind::ListenerError {
                    self.emit(listener_diagnostic(&event, &err), false).await;
                }
            }
        }
    }

    /// Snapshot of delivery and subscription counters.
    pub fn metrics(&self) -> BusMetrics {
        let inner = self.inner.lock().unwrap();
        BusMetrics {
            total_events: inner.total_events,
            events_by_kind: inner.events_by_kind.clone(),
            listeners_by_kind: inner
                .listeners
                .iter()
                .filter(|(_, list)| !list.is_empty())
                .map(|(kind, list)| (*kind, list.len()))
                .collect(),
            wildcard_listeners: inner.wildcard.len(),
            listener_errors: inner.listener_errors,
        }
    }

    fn register(
        &self,
        subject: Subject,
        handler: Listener,
        options: SubscribeOptions,
        once: bool,
    ) -> (SubscriptionId, Vec<Event>) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        let sub = Subscription {
            id,
            subject,
            handler,
            filter: options.filter.clone(),
            priority: options.priority,
            once,
        };

        let history = if options.replay {
            inner
                .replay
                .iter()
                .flatten()
                .filter(|event| match subject {
                    Subject::Any => true,
                    Subject::Kind(kind) => event.kind == kind,
                })
                .filter(|event| options.filter.as_ref().map_or(true, |f| f(event)))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let list = match subject {
            Subject::Any => &mut inner.wildcard,
            Subject::Kind(kind) => inner.listeners.entry(kind).or_default(),
        };
        // Insert after every subscription of equal or higher priority so
        // equal priorities keep registration order.
        let at = list
            .iter()
            .position(|existing| existing.priority < sub.priority)
            .unwrap_or(list.len());
        list.insert(at, sub);

        (id, history)
    }

    /// Record the emission and snapshot its subscriber list.
    fn prepare(&self, event: &Event) -> Vec<Subscription> {
        let mut inner = self.inner.lock().unwrap();
        inner.total_events += 1;
        *inner.events_by_kind.entry(event.kind).or_insert(0) += 1;

        let capacity = inner.replay_capacity;
        if let Some(buffer) = inner.replay.as_mut() {
            if capacity > 0 {
                if buffer.len() == capacity {
                    buffer.pop_front();
                }
                buffer.push_back(event.clone());
            }
        }

        let mut snapshot: Vec<Subscription> = inner
            .listeners
            .get(&event.kind)
            .map(|list| list.to_vec())
            .unwrap_or_default();
        snapshot.extend(inner.wildcard.iter().cloned());
        snapshot
    }

    fn note_listener_error(&self) {
        self.inner.lock().unwrap().listener_errors += 1;
    }

    /// Sequential delivery. `report` controls whether handler failures are
    /// re-published as diagnostics; diagnostics themselves are emitted with
    /// `report: false` so a failing error-channel handler cannot recurse.
    fn emit(&self, event: Event, report: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let snapshot = self.prepare(&event);
            for sub in snapshot {
                if let Some(filter) = &sub.filter {
                    if !filter(&event) {
                        continue;
                    }
                }
                let result = (sub.handler)(event.clone()).await;
                if sub.once {
                    self.off(sub.subject, sub.id);
                }
                if let Err(err) = result {
                    self.note_listener_error();
                    warn!(kind = ?event.kind, error = %err, "listener failed during emission");
                    if report && event.kind != EventKind::ListenerError {
                        self.emit(listener_diagnostic(&event, &err), false).await;
                    }
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn listener_diagnostic(event: &Event, err: &crate::error::Error) -> Event {
    Event::new(
        EventPayload::ListenerError {
            message: "listener failed during emission".to_string(),
            cause: err.to_string(),
            event_kind: event.kind,
            event_id: event.id.clone(),
        },
        EventMetadata {
            correlation_id: event.metadata.correlation_id.clone(),
            session_id: event.metadata.session_id.clone(),
            source: "event_bus".to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        },
    )
}
