//! EventBus: pub/sub for status transitions (spec.md §4.4). Per-`doc_id`
//! delivery is in publish order; across `doc_id`s order is unspecified.
//! Each subscriber has a bounded buffer; when full, the incoming event is
//! dropped and logged (oldest-wins: what's already queued is kept).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::status::ProcessingStatus;

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
  pub doc_id: String,
  pub status: ProcessingStatus,
}

impl StatusEvent {
  pub fn from_status(status: &ProcessingStatus) -> Self {
    Self { doc_id: status.doc_id.clone(), status: status.clone() }
  }
}

type Predicate = Box<dyn Fn(&StatusEvent) -> bool + Send + Sync>;

struct Subscriber {
  id: u64,
  predicate: Predicate,
  tx: mpsc::Sender<StatusEvent>,
}

pub struct Subscription {
  id: u64,
  pub rx: mpsc::Receiver<StatusEvent>,
}

impl Subscription {
  pub fn id(&self) -> u64 {
    self.id
  }
}

pub struct EventBus {
  subscribers: Mutex<Vec<Subscriber>>,
  next_id: AtomicU64,
  buffer_size: usize,
}

impl EventBus {
  pub fn new(buffer_size: usize) -> Self {
    Self { subscribers: Mutex::new(Vec::new()), next_id: AtomicU64::new(0), buffer_size }
  }

  /// Subscribe with a predicate filtering by doc_id or state. Returns a
  /// handle whose `rx` yields matching events until [`EventBus::unsubscribe`]
  /// is called or the bus is dropped.
  pub fn subscribe(&self, predicate: impl Fn(&StatusEvent) -> bool + Send + Sync + 'static) -> Subscription {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(self.buffer_size);
    self.subscribers.lock().expect("event bus poisoned").push(Subscriber { id, predicate: Box::new(predicate), tx });
    Subscription { id, rx }
  }

  pub fn unsubscribe(&self, subscription: &Subscription) {
    self.subscribers.lock().expect("event bus poisoned").retain(|s| s.id != subscription.id());
  }

  /// Non-blocking publish. A subscriber whose buffer is full drops this
  /// event and the drop is logged; the subscriber list is never blocked on.
  pub fn publish(&self, event: StatusEvent) {
    let subscribers = self.subscribers.lock().expect("event bus poisoned");
    for subscriber in subscribers.iter() {
      if !(subscriber.predicate)(&event) {
        continue;
      }
      if let Err(mpsc::error::TrySendError::Full(_)) = subscriber.tx.try_send(event.clone()) {
        warn!(doc_id = %event.doc_id, subscriber = subscriber.id, "event dropped: subscriber buffer full");
      }
    }
  }
}

pub fn by_doc_id(doc_id: impl Into<String>) -> impl Fn(&StatusEvent) -> bool + Send + Sync {
  let doc_id = doc_id.into();
  move |event: &StatusEvent| event.doc_id == doc_id
}

pub fn all() -> impl Fn(&StatusEvent) -> bool + Send + Sync {
  |_: &StatusEvent| true
}
