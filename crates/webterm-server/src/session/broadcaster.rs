//! Fan-out of one session's output stream to any number of viewers.
//!
//! The producer (the session reader) and every subscribe call go through the
//! same short critical section, so a new subscriber's replay snapshot and its
//! live stream meet exactly: no event is missing between them and none is
//! delivered twice. Live delivery uses a bounded broadcast queue per
//! subscriber; a viewer that falls behind loses its oldest events and is told
//! how many, while the producer and the other viewers are unaffected.

use super::ring_buffer::{EventPayload, OutputEvent, RingBuffer};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tracing::{debug, trace};
use webterm_core::{SessionStatus, Viewer};

/// Lifecycle change as seen by viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
}

/// Item on the live queue.
#[derive(Debug, Clone)]
enum Delivery {
    Event(OutputEvent),
    Status(StatusUpdate),
}

/// What a subscriber observes, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// Buffered history at the time of subscribing; always first.
    Replay(Vec<OutputEvent>),
    Event(OutputEvent),
    Status(StatusUpdate),
    /// `missed` events were dropped because this subscriber fell behind.
    Gap { missed: u64 },
}

struct SubscriberInfo {
    label: String,
    registered_at: DateTime<Utc>,
}

struct Inner {
    replay: RingBuffer,
    /// `None` once the producer has shut down.
    tx: Option<broadcast::Sender<Delivery>>,
    next_seq: u64,
    status: StatusUpdate,
    subscribers: HashMap<u64, SubscriberInfo>,
    next_subscriber_id: u64,
}

/// Single-producer, multi-subscriber output fan-out with replay.
pub struct OutputBroadcaster {
    inner: Arc<Mutex<Inner>>,
}

impl OutputBroadcaster {
    /// `replay_bytes` bounds the history kept for new subscribers;
    /// `queue_capacity` bounds each subscriber's live backlog (in events).
    pub fn new(replay_bytes: usize, queue_capacity: usize, status: StatusUpdate) -> Self {
        let (tx, _) = broadcast::channel(queue_capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(Inner {
                replay: RingBuffer::new(replay_bytes),
                tx: Some(tx),
                next_seq: 1,
                status,
                subscribers: HashMap::new(),
                next_subscriber_id: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish one payload. Returns its sequence number, or `None` after `close`.
    ///
    /// Never waits on subscribers.
    pub fn publish(&self, payload: EventPayload) -> Option<u64> {
        Self::publish_locked(&mut self.lock(), payload)
    }

    fn publish_locked(inner: &mut Inner, payload: EventPayload) -> Option<u64> {
        let tx = inner.tx.clone()?;
        let event = OutputEvent {
            seq: inner.next_seq,
            payload,
        };
        inner.next_seq += 1;
        inner.replay.push(event.clone());
        // Err only means nobody is listening right now.
        let _ = tx.send(Delivery::Event(event.clone()));
        trace!(seq = event.seq, "published output event");
        Some(event.seq)
    }

    /// Record a status change and notify live subscribers.
    pub fn publish_status(&self, update: StatusUpdate) {
        let mut inner = self.lock();
        inner.status = update;
        if let Some(tx) = &inner.tx {
            let _ = tx.send(Delivery::Status(update));
        }
    }

    /// Shut the producer side down. Subscribers drain what is queued and then
    /// see the end of the stream; later subscribers still get the replay.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.tx.take().is_some() {
            debug!(subscribers = inner.subscribers.len(), "broadcaster closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().tx.is_none()
    }

    /// Register a subscriber. It first receives the replay snapshot and the
    /// current status, then every event published after this call.
    pub fn subscribe(&self, label: impl Into<String>) -> Subscription {
        let mut inner = self.lock();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.insert(
            id,
            SubscriberInfo {
                label: label.into(),
                registered_at: Utc::now(),
            },
        );
        let replay = inner.replay.snapshot();
        let rx = inner.tx.as_ref().map(|tx| tx.subscribe());
        debug!(subscriber = id, replay_events = replay.len(), "subscriber attached");

        Subscription {
            id,
            replay: Some(replay),
            status: Some(inner.status),
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Sequence number the next event will get.
    pub fn next_seq(&self) -> u64 {
        self.lock().next_seq
    }

    pub fn status(&self) -> StatusUpdate {
        self.lock().status
    }

    /// Attached viewers in registration order.
    pub fn viewers(&self) -> Vec<Viewer> {
        let inner = self.lock();
        let mut ids: Vec<_> = inner.subscribers.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| inner.subscribers.get(&id))
            .map(|info| Viewer {
                connection: info.label.clone(),
                attached_at: info.registered_at,
            })
            .collect()
    }

    /// Drop buffered history and publish `marker` as its first event, in
    /// one step with respect to other publishes and subscribes.
    pub fn restart_replay(&self, marker: EventPayload) -> Option<u64> {
        let mut inner = self.lock();
        inner.replay.clear();
        Self::publish_locked(&mut inner, marker)
    }
}

/// One viewer's registration. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    replay: Option<Vec<OutputEvent>>,
    status: Option<StatusUpdate>,
    rx: Option<broadcast::Receiver<Delivery>>,
    inner: Weak<Mutex<Inner>>,
}

impl Subscription {
    /// Next item for this subscriber; `None` once the stream has ended or
    /// after `unsubscribe`.
    pub async fn recv(&mut self) -> Option<Received> {
        if let Some(replay) = self.replay.take() {
            return Some(Received::Replay(replay));
        }
        if let Some(status) = self.status.take() {
            return Some(Received::Status(status));
        }
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Ok(Delivery::Event(event)) => Some(Received::Event(event)),
            Ok(Delivery::Status(status)) => Some(Received::Status(status)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(subscriber = self.id, missed, "subscriber lagged");
                Some(Received::Gap { missed })
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.rx = None;
                None
            }
        }
    }

    /// Remove this subscriber. Idempotent, and safe after the producer closed.
    pub fn unsubscribe(&mut self) {
        self.replay = None;
        self.status = None;
        self.rx = None;
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.subscribers.remove(&self.id).is_some() {
                debug!(subscriber = self.id, "subscriber detached");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
