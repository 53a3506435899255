//! Recent-change ring.
//!
//! [`ChangeRing`] is the plain fixed-capacity buffer. [`RingHandle`] puts one
//! behind a task so many producers and readers can share it without locks.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Fixed-capacity buffer that drops its oldest item when full.
#[derive(Debug, Clone)]
pub struct ChangeRing<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> ChangeRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Everything retained, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// At most `n` of the newest items, oldest first.
    pub fn latest(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

enum RingRequest<T> {
    Add(T),
    Snapshot(oneshot::Sender<Vec<T>>),
    Latest(usize, oneshot::Sender<Vec<T>>),
}

/// Shared handle to a ring owned by a background task.
///
/// The task exits once every handle is dropped. Reads against a stopped ring
/// answer with an empty list.
pub struct RingHandle<T> {
    tx: mpsc::UnboundedSender<RingRequest<T>>,
}

impl<T> Clone for RingHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> RingHandle<T> {
    /// Spawn the owning task.
    pub fn spawn(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RingRequest<T>>();

        tokio::spawn(async move {
            let mut ring = ChangeRing::new(capacity);
            while let Some(request) = rx.recv().await {
                match request {
                    RingRequest::Add(item) => ring.push(item),
                    RingRequest::Snapshot(reply) => {
                        let _ = reply.send(ring.snapshot());
                    }
                    RingRequest::Latest(n, reply) => {
                        let _ = reply.send(ring.latest(n));
                    }
                }
            }
            debug!("Recent-change ring stopped");
        });

        Self { tx }
    }

    /// Record an item. Never waits.
    pub fn add(&self, item: T) {
        let _ = self.tx.send(RingRequest::Add(item));
    }

    pub async fn snapshot(&self) -> Vec<T> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RingRequest::Snapshot(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn latest(&self, n: usize) -> Vec<T> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RingRequest::Latest(n, reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_overwrites_oldest() {
        let mut ring = ChangeRing::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.snapshot(), vec![2, 3, 4]);
        assert_eq!(ring.latest(10), vec![2, 3, 4]);
        assert_eq!(ring.latest(2), vec![3, 4]);
        assert_eq!(ring.latest(0), Vec::<i32>::new());
    }

    #[test]
    fn test_empty_ring() {
        let ring: ChangeRing<i32> = ChangeRing::new(3);
        assert!(ring.snapshot().is_empty());
        assert!(ring.latest(5).is_empty());

        let mut zero = ChangeRing::new(0);
        zero.push(1);
        assert!(zero.is_empty());
    }

    #[test]
    fn test_partial_ring_keeps_insertion_order() {
        let mut ring = ChangeRing::new(5);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.snapshot(), vec!["a", "b"]);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.capacity(), 5);
    }

    #[tokio::test]
    async fn test_ring_handle_serves_reads() {
        let ring = RingHandle::spawn(3);
        assert!(ring.snapshot().await.is_empty());

        for i in 0..5 {
            ring.add(i);
        }
        assert_eq!(ring.snapshot().await, vec![2, 3, 4]);
        assert_eq!(ring.latest(2).await, vec![3, 4]);
        assert_eq!(ring.clone().latest(10).await, vec![2, 3, 4]);
    }
}
