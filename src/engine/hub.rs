use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, info};

use crate::engine::types::ChangeEvent;

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Identifier handed out by [`BroadcastHub::subscribe`].
pub type SubscriberId = u64;

/// Receiving end of a subscription. Dropping it closes the subscriber; the
/// hub notices on the next publish or liveness sweep.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<ChangeEvent>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next event. `None` once the hub closed this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<ChangeEvent>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Arc<ChangeEvent>, TryRecvError> {
        self.rx.try_recv()
    }

    /// Everything already queued, without waiting.
    pub fn drain(&mut self) -> Vec<Arc<ChangeEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Outcome of one [`BroadcastHub::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscribers whose queue was full; they miss this event but stay.
    pub lagged: usize,
    /// Subscribers found closed and removed.
    pub removed: usize,
}

struct Subscriber {
    tx: mpsc::Sender<Arc<ChangeEvent>>,
    missed: u64,
}

/// Fan-out of change events to live subscribers.
///
/// Publishing never waits: a full queue drops the event for that subscriber
/// only, a closed queue removes the subscriber.
pub struct BroadcastHub {
    subscribers: BTreeMap<SubscriberId, Subscriber>,
    next_id: SubscriberId,
    buffer: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl BroadcastHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: BTreeMap::new(),
            next_id: 1,
            buffer: buffer.max(1),
        }
    }

    /// Register a subscriber and queue `snapshot` as its first event.
    pub fn subscribe(&mut self, snapshot: ChangeEvent) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id;
        self.next_id += 1;

        // Fresh channel with capacity >= 1, so this cannot fail.
        let _ = tx.try_send(Arc::new(snapshot));

        self.subscribers.insert(id, Subscriber { tx, missed: 0 });
        info!(subscriber = id, total = self.subscribers.len(), "Subscriber connected");

        Subscription { id, rx }
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            info!(subscriber = id, total = self.subscribers.len(), "Subscriber removed");
        }
        removed
    }

    pub fn publish(&mut self, event: ChangeEvent) -> PublishReport {
        let event = Arc::new(event);
        let mut report = PublishReport::default();
        let mut closed = Vec::new();

        for (id, subscriber) in self.subscribers.iter_mut() {
            match subscriber.tx.try_send(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    subscriber.missed += 1;
                    report.lagged += 1;
                    debug!(subscriber = id, missed = subscriber.missed, "Subscriber lagging, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
            report.removed += 1;
            debug!(subscriber = id, "Subscriber closed, removed during publish");
        }

        report
    }

    /// Drop subscribers whose receiving side is gone.
    pub fn sweep_closed(&mut self) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|_, s| !s.tx.is_closed());
        let removed = before - self.subscribers.len();
        if removed > 0 {
            info!(removed, total = self.subscribers.len(), "Cleaned up disconnected subscribers");
        }
        removed
    }

    /// Close every subscriber. Their streams end after the queued events.
    pub fn close_all(&mut self) -> usize {
        let count = self.subscribers.len();
        self.subscribers.clear();
        count
    }

    /// Events this subscriber missed because its queue was full.
    pub fn missed(&self, id: SubscriberId) -> Option<u64> {
        self.subscribers.get(&id).map(|s| s.missed)
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
