//! Event fan-out.
//!
//! [`Observers`] keeps an explicit registry of `(handle, sender)` pairs.
//! Subscribers receive every event emitted after they subscribe; a
//! subscriber whose receiver was dropped is removed on the next emit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::identity::{HostId, PublicKey};

const SUBSCRIBER_BUFFER: usize = 64;

/// A logical network was joined or left.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    Added { key: PublicKey },
    Removed { key: PublicKey },
}

/// A peer was bound to (or unbound from) a logical network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerNetworkEvent {
    Added { key: PublicKey, host_id: HostId },
    Removed { key: PublicKey, host_id: HostId },
}

pub struct Observers<T> {
    next_handle: AtomicU64,
    subscribers: Mutex<Vec<(u64, mpsc::Sender<T>)>>,
}

impl<T: Clone> Observers<T> {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber; returns its handle and receiver.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, tx));
        (handle, rx)
    }

    pub fn unsubscribe(&self, handle: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(h, _)| *h != handle);
    }

    /// Deliver `event` to every live subscriber. A full subscriber misses the
    /// event; a closed one is dropped.
    pub fn emit(&self, event: T) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(_, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("observer queue full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_every_subscriber() {
        let observers = Observers::new();
        let (_, mut a) = observers.subscribe();
        let (_, mut b) = observers.subscribe();

        observers.emit(NetworkEvent::Added { key: [1; 32] });
        assert_eq!(a.recv().await, Some(NetworkEvent::Added { key: [1; 32] }));
        assert_eq!(b.recv().await, Some(NetworkEvent::Added { key: [1; 32] }));
    }

    #[test]
    fn closed_subscribers_are_dropped_on_emit() {
        let observers: Observers<u32> = Observers::new();
        let (_, rx) = observers.subscribe();
        let (_, _kept) = observers.subscribe();
        drop(rx);

        observers.emit(1);
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn unsubscribe_removes_handle() {
        let observers: Observers<u32> = Observers::new();
        let (handle, _rx) = observers.subscribe();
        observers.unsubscribe(handle);
        assert!(observers.is_empty());
    }
}
