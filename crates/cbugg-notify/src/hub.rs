//! Broadcast hub for live subscribers.
//!
//! One task owns the subscriber table; register, unregister and submit are
//! messages to it. Delivery is a non-blocking offer: a subscriber whose
//! buffer is full (or whose receiver is gone) is evicted on the spot and its
//! channel closed, so one slow reader never stalls the rest.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use cbugg_core::{Error, Result};

pub type SubscriberId = u64;

/// Receiving end handed to a live subscriber.
#[derive(Debug)]
pub struct Subscription<T> {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<T>,
}

enum HubCommand<T> {
    Register {
        capacity: usize,
        reply: oneshot::Sender<Subscription<T>>,
    },
    Unregister(SubscriberId),
    Submit(T),
    Count(oneshot::Sender<usize>),
}

/// Handle to the hub task. Cheap to clone.
pub struct BroadcastHub<T> {
    tx: mpsc::UnboundedSender<HubCommand<T>>,
}

impl<T> Clone for BroadcastHub<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> BroadcastHub<T> {
    /// Spawn the hub task. It runs until every handle is dropped.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Add a subscriber with an outbound buffer of `capacity` events.
    pub async fn register(&self, capacity: usize) -> Result<Subscription<T>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Register { capacity, reply })
            .map_err(|_| Error::Internal("broadcast hub stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("broadcast hub stopped".to_string()))
    }

    /// Remove a subscriber and close its channel. Unknown ids are ignored.
    pub fn unregister(&self, id: SubscriberId) {
        let _ = self.tx.send(HubCommand::Unregister(id));
    }

    /// Offer `event` to every subscriber. Never waits.
    pub fn submit(&self, event: T) {
        if self.tx.send(HubCommand::Submit(event)).is_err() {
            debug!("Broadcast hub stopped, dropping live event");
        }
    }

    /// Current number of subscribers.
    pub async fn subscriber_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubCommand::Count(reply)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn run<T: Clone + Send + 'static>(mut rx: mpsc::UnboundedReceiver<HubCommand<T>>) {
    let mut subscribers: HashMap<SubscriberId, mpsc::Sender<T>> = HashMap::new();
    let mut next_id: SubscriberId = 0;

    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Register { capacity, reply } => {
                next_id += 1;
                let (tx, sub_rx) = mpsc::channel(capacity.max(1));
                subscribers.insert(next_id, tx);
                debug!(subscriber = next_id, capacity, "Live subscriber registered");
                let _ = reply.send(Subscription {
                    id: next_id,
                    rx: sub_rx,
                });
            }
            HubCommand::Unregister(id) => {
                if subscribers.remove(&id).is_some() {
                    debug!(subscriber = id, "Live subscriber unregistered");
                }
            }
            HubCommand::Submit(event) => {
                subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber = *id, "Live subscriber fell behind, evicting");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(subscriber = *id, "Live subscriber went away");
                        false
                    }
                });
            }
            HubCommand::Count(reply) => {
                let _ = reply.send(subscribers.len());
            }
        }
    }

    info!(remaining = subscribers.len(), "Broadcast hub stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_reaches_every_subscriber() {
        let hub = BroadcastHub::spawn();
        let mut a = hub.register(4).await.unwrap();
        let mut b = hub.register(4).await.unwrap();
        assert_ne!(a.id, b.id);

        hub.submit("hello");
        assert_eq!(a.rx.recv().await, Some("hello"));
        assert_eq!(b.rx.recv().await, Some("hello"));
    }

    #[tokio::test]
    async fn test_full_subscriber_is_evicted_without_blocking() {
        let hub = BroadcastHub::spawn();
        let mut slow = hub.register(2).await.unwrap();
        let mut fast = hub.register(16).await.unwrap();

        for i in 0..5 {
            hub.submit(i);
            assert_eq!(fast.rx.recv().await, Some(i));
        }

        // The slow reader got what fit, then its channel was closed.
        assert_eq!(slow.rx.recv().await, Some(0));
        assert_eq!(slow.rx.recv().await, Some(1));
        assert_eq!(slow.rx.recv().await, None);
        assert_eq!(hub.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_unregister_closes_channel() {
        let hub: BroadcastHub<u8> = BroadcastHub::spawn();
        let mut sub = hub.register(1).await.unwrap();
        hub.unregister(sub.id);
        assert_eq!(sub.rx.recv().await, None);
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned_on_next_submit() {
        let hub = BroadcastHub::spawn();
        let sub = hub.register(1).await.unwrap();
        drop(sub);
        hub.submit(1u8);
        assert_eq!(hub.subscriber_count().await, 0);
    }
}
