use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::event::{Event, EventType};

/// Delivery counters of a tracer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Events handed to a subscriber channel.
    pub delivered: u64,
    /// Deliveries dropped because the subscriber channel was full.
    pub dropped: u64,
    /// Samples the kernel reported as lost before they reached user space.
    pub lost: u64,
}

/// Per-type subscriber table shared by the reader threads.
///
/// Dispatch never blocks: a full channel loses that one delivery.
#[derive(Debug, Default)]
pub struct Subscribers {
    table: DashMap<EventType, Vec<mpsc::Sender<Arc<Event>>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    lost: AtomicU64,
}

impl Subscribers {
    pub fn subscribe(&self, kind: EventType, tx: mpsc::Sender<Arc<Event>>) {
        self.table.entry(kind).or_default().push(tx);
    }

    /// Hands `event` to every subscriber of its type.
    pub fn dispatch(&self, event: Event) {
        // Clone the senders so the shard lock is not held while sending.
        let senders = match self.table.get(&event.kind) {
            Some(senders) => senders.clone(),
            None => return,
        };

        let event = Arc::new(event);
        for tx in senders {
            match tx.try_send(Arc::clone(&event)) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    log::debug!(
                        "subscriber channel full, dropped {} event ({} drops total)",
                        event.kind,
                        dropped
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn record_lost(&self, count: u64) {
        self.lost.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> Stats {
        Stats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }
}
