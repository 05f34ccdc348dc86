//! Bounded queue of discovery events.

use super::PeerFound;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};

/// Bounded FIFO of [`PeerFound`] events with drop-oldest backpressure.
///
/// Producers never wait. When the queue is full the oldest event is
/// discarded: a fresh announcement is more likely to describe a reachable
/// peer than a stale one.
#[derive(Debug)]
pub struct PeerQueue {
    events: Mutex<VecDeque<PeerFound>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl PeerQueue {
    /// Create a queue holding at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an event, returning the event evicted to make room, if any.
    pub async fn push(&self, event: PeerFound) -> Option<PeerFound> {
        let evicted = {
            let mut events = self.events.lock().await;
            let evicted = if events.len() >= self.capacity {
                events.pop_front()
            } else {
                None
            };
            events.push_back(event);
            evicted
        };

        if let Some(old) = &evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(addr = %old.addr, "Discovery queue full, dropped oldest event");
        }
        self.notify.notify_one();
        evicted
    }

    /// Wait for the next event.
    pub async fn pop(&self) -> PeerFound {
        loop {
            if let Some(event) = self.try_pop().await {
                return event;
            }
            self.notify.notified().await;
        }
    }

    /// Take the next event if one is queued.
    pub async fn try_pop(&self) -> Option<PeerFound> {
        self.events.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    fn event(port: u16) -> PeerFound {
        PeerFound {
            node_id: None,
            addr: SocketAddr::from(([10, 0, 0, 1], port)),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = PeerQueue::new(4);
        queue.push(event(1)).await;
        queue.push(event(2)).await;
        assert_eq!(queue.pop().await, event(1));
        assert_eq!(queue.pop().await, event(2));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_drops_oldest_when_full() {
        let queue = PeerQueue::new(2);
        assert_eq!(queue.push(event(1)).await, None);
        assert_eq!(queue.push(event(2)).await, None);
        assert_eq!(queue.push(event(3)).await, Some(event(1)));

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().await, event(2));
        assert_eq!(queue.pop().await, event(3));
    }

    #[tokio::test]
    async fn test_zero_capacity_holds_one() {
        let queue = PeerQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(event(1)).await;
        queue.push(event(2)).await;
        assert_eq!(queue.try_pop().await, Some(event(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(PeerQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.push(event(7)).await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, event(7));
    }
}
