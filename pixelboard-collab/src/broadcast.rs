//! Fan-out of accepted pixel changes to every live subscriber.
//!
//! Each subscriber owns a bounded mpsc queue sized independently of the
//! others. `publish` only ever calls `try_send`: when a queue is full the new
//! message is dropped for that subscriber and counted, so a stalled viewer
//! can never hold up the write path. Dropped messages are recovered by the
//! viewer's next full snapshot.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::protocol::PixelMessage;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters, read through [`BroadcastHub::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Receiving half handed to one subscriber.
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::Receiver<Arc<PixelMessage>>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next queued message in FIFO order. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Arc<PixelMessage>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<PixelMessage>> {
        self.receiver.try_recv().ok()
    }
}

pub struct BroadcastHub {
    subscribers: DashMap<Uuid, mpsc::Sender<Arc<PixelMessage>>>,
    /// Queue depth used by [`BroadcastHub::subscribe`]
    default_capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastHub {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            default_capacity: default_capacity.max(1),
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(self.default_capacity)
    }

    /// Register a subscriber whose queue holds up to `capacity` messages.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = Uuid::new_v4();
        self.subscribers.insert(id, sender);
        log::debug!("Subscriber {id} registered (queue {capacity})");
        Subscription { id, receiver }
    }

    /// Remove a subscriber. Messages still queued for it are discarded
    /// together with its receiver.
    pub fn unsubscribe(&self, id: &Uuid) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            log::debug!("Subscriber {id} unregistered");
        }
        removed
    }

    /// Offer `msg` to every subscriber without waiting on any of them.
    ///
    /// Returns the number of queues that accepted it.
    pub fn publish(&self, msg: PixelMessage) -> usize {
        let msg = Arc::new(msg);
        let mut delivered = 0u64;
        let mut dropped = 0u64;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.value().try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    log::warn!(
                        "Subscriber {} queue full, dropping update for {}",
                        entry.key(),
                        msg.cell()
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        // Removal happens after iteration; DashMap shards are read-locked above.
        for id in closed {
            self.subscribers.remove(&id);
            log::debug!("Subscriber {id} gone, removed during publish");
        }

        self.atomic_stats.messages_published.fetch_add(1, Ordering::Relaxed);
        self.atomic_stats.messages_delivered.fetch_add(delivered, Ordering::Relaxed);
        self.atomic_stats.messages_dropped.fetch_add(dropped, Ordering::Relaxed);
        delivered as usize
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_subscribed(&self, id: &Uuid) -> bool {
        self.subscribers.contains_key(id)
    }

    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_published: self.atomic_stats.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.atomic_stats.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.len(),
        }
    }
}
