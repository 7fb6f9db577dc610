//! Process-wide publish/subscribe hub.
//!
//! Decouples producers of state changes (the download queue, cache
//! maintenance, application glue) from their consumers (history recorders,
//! progress indicators, notification senders). Construct one [`EventBus`]
//! at the composition root and hand clones to every component that needs to
//! publish or subscribe; the handle is cheap to clone and share.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Well-known event names published by the crate.
///
/// Names follow the `domain:action` convention; downstream applications are
/// expected to extend the catalogue the same way for their own domains.
pub mod topic {
  pub const QUEUE_TASK_ADDED: &str = "queue:task_added";
  pub const QUEUE_TASK_REMOVED: &str = "queue:task_removed";
  pub const QUEUE_STARTED: &str = "queue:started";
  pub const QUEUE_STOPPED: &str = "queue:stopped";
  pub const QUEUE_CLEARED: &str = "queue:cleared";

  pub const DOWNLOAD_STARTED: &str = "download:started";
  pub const DOWNLOAD_PROGRESS: &str = "download:progress";
  pub const DOWNLOAD_COMPLETED: &str = "download:completed";
  pub const DOWNLOAD_FAILED: &str = "download:failed";
  pub const DOWNLOAD_CANCELLED: &str = "download:cancelled";
}

/// An immutable event value delivered to subscribers.
///
/// Never mutated after publish; subscribers receive a shared reference and
/// clone what they need to keep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  /// Event name (`domain:action`).
  pub name: String,
  /// Arbitrary JSON payload; by convention an object mapping keys to values.
  pub data: Value,
  /// When the event was constructed by `publish`.
  pub timestamp: DateTime<Utc>,
  /// Optional identifier of the publishing component.
  pub source: Option<String>,
}

impl Event {
  pub fn new(name: impl Into<String>, data: Value, source: Option<&str>) -> Self {
    Self {
      name: name.into(),
      data,
      timestamp: Utc::now(),
      source: source.map(str::to_string),
    }
  }
}

type EventHandler = dyn Fn(&Event) + Send + Sync + 'static;

#[derive(Clone)]
struct Subscriber {
  id: u64,
  handler: Arc<EventHandler>,
  once: bool,
}

struct BusInner {
  subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
  next_id: AtomicU64,
  // Async delivery loop state. `async_tx` present iff the loop is enabled.
  async_tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
  delivery_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BusInner {
  /// Delivers an event to every subscriber currently registered for its
  /// name, in registration order. A handler that panics is caught and
  /// logged; delivery continues with the remaining handlers, and the panic
  /// never reaches the publisher.
  fn dispatch(&self, event: &Event) {
    let batch: Vec<Subscriber> = {
      let registry = self.subscribers.lock();
      match registry.get(&event.name) {
        Some(subs) => subs.clone(),
        None => return,
      }
    };

    let mut fired_once: Vec<u64> = Vec::new();
    for sub in &batch {
      if catch_unwind(AssertUnwindSafe(|| (sub.handler)(event))).is_err() {
        error!(
          event = %event.name,
          subscriber_id = sub.id,
          "Event handler panicked; continuing delivery to remaining handlers."
        );
      }
      if sub.once {
        fired_once.push(sub.id);
      }
    }

    if !fired_once.is_empty() {
      let mut registry = self.subscribers.lock();
      if let Some(subs) = registry.get_mut(&event.name) {
        subs.retain(|s| !fired_once.contains(&s.id));
      }
    }
  }

  fn remove(&self, event_name: &str, id: u64) {
    let mut registry = self.subscribers.lock();
    if let Some(subs) = registry.get_mut(event_name) {
      subs.retain(|s| s.id != id);
    }
  }
}

/// Publish/subscribe event bus.
///
/// Synchronous publishes deliver on the caller's own execution context
/// before `publish` returns. Asynchronous publishes (once the delivery loop
/// is enabled via [`EventBus::enable_async`]) are queued and delivered by a
/// single dedicated loop: handler order per publish is registration order,
/// but handlers on that loop execute one at a time and block each other, so
/// they must not stall.
#[derive(Clone)]
pub struct EventBus {
  inner: Arc<BusInner>,
}

impl EventBus {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(BusInner {
        subscribers: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        async_tx: Mutex::new(None),
        delivery_handle: Mutex::new(None),
      }),
    }
  }

  /// Registers `handler` for `event_name` and returns the subscription
  /// handle controlling its lifetime.
  ///
  /// Dropping the handle unsubscribes, so a subscriber whose natural
  /// lifetime ends needs no explicit bookkeeping; call
  /// [`Subscription::detach`] to keep the subscription alive for the bus's
  /// lifetime instead.
  pub fn subscribe<F>(&self, event_name: &str, handler: F) -> Subscription
  where
    F: Fn(&Event) + Send + Sync + 'static,
  {
    self.register(event_name, Arc::new(handler), false)
  }

  /// Registers `handler` for a single delivery: after the first event it
  /// receives, the subscription is removed automatically.
  pub fn once<F>(&self, event_name: &str, handler: F) -> Subscription
  where
    F: Fn(&Event) + Send + Sync + 'static,
  {
    self.register(event_name, Arc::new(handler), true)
  }

  fn register(&self, event_name: &str, handler: Arc<EventHandler>, once: bool) -> Subscription {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    {
      let mut registry = self.inner.subscribers.lock();
      registry
        .entry(event_name.to_string())
        .or_default()
        .push(Subscriber { id, handler, once });
    }
    debug!(event = event_name, subscriber_id = id, "Subscribed.");
    Subscription {
      inner: Arc::downgrade(&self.inner),
      event_name: event_name.to_string(),
      id,
      active: true,
    }
  }

  /// Publishes an event synchronously: every currently-registered handler
  /// for `name` runs on the caller's context before this returns.
  /// Publishing with zero subscribers is a no-op.
  pub fn publish(&self, name: &str, data: Value) {
    self.inner.dispatch(&Event::new(name, data, None));
  }

  /// Like [`EventBus::publish`], tagging the event with a source identifier.
  pub fn publish_from(&self, name: &str, data: Value, source: &str) {
    self.inner.dispatch(&Event::new(name, data, Some(source)));
  }

  /// Publishes an event through the asynchronous delivery loop.
  ///
  /// Falls back to synchronous delivery while the loop is not enabled (or
  /// when it is shutting down), so the event is never silently lost.
  pub fn publish_async(&self, name: &str, data: Value) {
    let event = Event::new(name, data, None);
    let queued = {
      let tx = self.inner.async_tx.lock();
      match tx.as_ref() {
        Some(tx) => tx.send(event.clone()).is_ok(),
        None => false,
      }
    };
    if !queued {
      self.inner.dispatch(&event);
    }
  }

  /// Removes every subscription, optionally scoped to one event name.
  pub fn unsubscribe_all(&self, event_name: Option<&str>) {
    let mut registry = self.inner.subscribers.lock();
    match event_name {
      Some(name) => {
        registry.remove(name);
        debug!(event = name, "Removed all subscriptions for event.");
      }
      None => {
        registry.clear();
        debug!("Removed all subscriptions.");
      }
    }
  }

  /// Number of registered subscriptions, for one event name or in total.
  pub fn subscriber_count(&self, event_name: Option<&str>) -> usize {
    let registry = self.inner.subscribers.lock();
    match event_name {
      Some(name) => registry.get(name).map_or(0, Vec::len),
      None => registry.values().map(Vec::len).sum(),
    }
  }

  /// Event names that currently have at least one subscriber.
  pub fn subscribed_events(&self) -> Vec<String> {
    let registry = self.inner.subscribers.lock();
    registry
      .iter()
      .filter(|(_, subs)| !subs.is_empty())
      .map(|(name, _)| name.clone())
      .collect()
  }

  /// Removes all subscriptions. Events still queued for asynchronous
  /// delivery are not dropped, but will find an empty registry.
  /// Intended for test isolation.
  pub fn clear(&self) {
    self.inner.subscribers.lock().clear();
    info!("Event bus cleared.");
  }

  /// Starts the asynchronous delivery loop. Idempotent. Must be called
  /// within a Tokio runtime.
  pub fn enable_async(&self) {
    let mut tx_slot = self.inner.async_tx.lock();
    if tx_slot.is_some() {
      return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    *tx_slot = Some(tx);
    drop(tx_slot);

    let inner = self.inner.clone();
    let handle = tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        inner.dispatch(&event);
      }
      debug!("Async event delivery loop exiting.");
    });
    *self.inner.delivery_handle.lock() = Some(handle);
    info!("Async event delivery enabled.");
  }

  /// Stops the asynchronous delivery loop, waiting briefly for queued
  /// events to drain. Idempotent; subsequent `publish_async` calls fall
  /// back to synchronous delivery.
  pub async fn disable_async(&self) {
    let tx = self.inner.async_tx.lock().take();
    if tx.is_none() {
      return;
    }
    drop(tx); // Closing the channel lets the loop drain and exit.

    let handle = self.inner.delivery_handle.lock().take();
    if let Some(handle) = handle {
      if tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .is_err()
      {
        warn!("Async event delivery loop did not drain within 2s; detaching.");
      }
    }
    info!("Async event delivery disabled.");
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for EventBus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EventBus")
      .field("subscribers", &self.subscriber_count(None))
      .finish()
  }
}

/// Capability to remove a subscription registered via
/// [`EventBus::subscribe`] or [`EventBus::once`].
///
/// Dropping the handle unsubscribes. Holding it is how a subscriber scopes
/// its interest to its own lifetime; [`Subscription::detach`] relinquishes
/// that scoping and leaves the subscription in place until the bus itself
/// is cleared.
#[must_use = "dropping a Subscription immediately unsubscribes; call detach() to keep it"]
pub struct Subscription {
  inner: Weak<BusInner>,
  event_name: String,
  id: u64,
  active: bool,
}

impl Subscription {
  /// Removes the subscription now.
  pub fn unsubscribe(mut self) {
    self.remove();
    self.active = false;
  }

  /// Leaves the subscription registered for the lifetime of the bus and
  /// consumes the handle without unsubscribing.
  pub fn detach(mut self) {
    self.active = false;
  }

  fn remove(&self) {
    if let Some(inner) = self.inner.upgrade() {
      inner.remove(&self.event_name, self.id);
      debug!(event = %self.event_name, subscriber_id = self.id, "Unsubscribed.");
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if self.active {
      self.remove();
    }
  }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("event_name", &self.event_name)
      .field("id", &self.id)
      .finish()
  }
}
