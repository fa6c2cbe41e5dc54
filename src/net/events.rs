//! Typed publish/subscribe for transfer events
//!
//! Every event is delivered on a process-wide channel and on a channel keyed
//! by its [`TransferId`]. Per-transfer channels are opened when the record is
//! registered, so a subscriber created through
//! [`TransferRegistry::watch`](super::transfer::TransferRegistry::watch) never
//! races the first event.

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::transfer::{TransferId, TransferRecord};

/// An observable change to a transfer
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Fired on every status transition, including registration.
    Updated(TransferRecord),
    /// Fired for every throttled progress sample.
    Progress(TransferRecord),
}

impl TransferEvent {
    pub fn record(&self) -> &TransferRecord {
        match self {
            TransferEvent::Updated(record) | TransferEvent::Progress(record) => record,
        }
    }

    pub fn transfer_id(&self) -> TransferId {
        self.record().id
    }

    pub fn is_progress(&self) -> bool {
        matches!(self, TransferEvent::Progress(_))
    }

    /// True for the status update that moves a transfer into a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferEvent::Updated(record) if record.is_terminal())
    }
}

#[derive(Debug)]
pub struct EventBus {
    all: broadcast::Sender<TransferEvent>,
    per_transfer: DashMap<TransferId, broadcast::Sender<TransferEvent>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            all,
            per_transfer: DashMap::new(),
            capacity,
        }
    }

    pub(crate) fn open(&self, id: TransferId) {
        self.per_transfer
            .entry(id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    pub(crate) fn close(&self, id: TransferId) {
        self.per_transfer.remove(&id);
    }

    /// Sending never blocks; events nobody listens to are dropped.
    pub(crate) fn publish(&self, event: TransferEvent) {
        if let Some(sender) = self.per_transfer.get(&event.transfer_id()) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
    }

    /// Receives events for every transfer
    pub fn subscribe_all(&self) -> broadcast::Receiver<TransferEvent> {
        self.all.subscribe()
    }

    pub(crate) fn subscribe(&self, id: TransferId, finished: bool) -> Option<TransferSubscription> {
        let rx = self.per_transfer.get(&id)?.subscribe();
        Some(TransferSubscription {
            id,
            rx,
            done: finished,
        })
    }
}

/// Stream of events for a single transfer, ending after its terminal event
#[derive(Debug)]
pub struct TransferSubscription {
    id: TransferId,
    rx: broadcast::Receiver<TransferEvent>,
    done: bool,
}

impl TransferSubscription {
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Waits for the next event; `None` once the transfer has finished.
    pub async fn next(&mut self) -> Option<TransferEvent> {
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(transfer_id = %self.id, skipped, "Subscriber lagging, events dropped");
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transfer::{TransferDirection, TransferRegistry, TransferStatus};
    use crate::net::transport::Locator;

    #[tokio::test]
    async fn test_subscribe_all_sees_every_transfer() {
        let registry = TransferRegistry::new(16);
        let mut rx = registry.events().subscribe_all();

        let a = registry.create(TransferDirection::Send, "a", 1, Locator::from("la"));
        let b = registry.create(TransferDirection::Receive, "b", 1, Locator::from("lb"));

        assert_eq!(rx.recv().await.unwrap().transfer_id(), a);
        assert_eq!(rx.recv().await.unwrap().transfer_id(), b);
    }

    #[tokio::test]
    async fn test_subscription_is_keyed_by_transfer() {
        let registry = TransferRegistry::new(16);
        let a = registry.create(TransferDirection::Send, "a", 1, Locator::from("la"));
        let b = registry.create(TransferDirection::Send, "b", 1, Locator::from("lb"));
        let (_, mut sub) = registry.watch(a).unwrap();

        registry.complete(b).unwrap();
        registry.complete(a).unwrap();

        let event = sub.next().await.unwrap();
        assert_eq!(event.transfer_id(), a);
        assert!(event.is_terminal());
        assert_eq!(event.record().status, TransferStatus::Completed);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_recovers() {
        let registry = TransferRegistry::new(2);
        let id = registry.create(TransferDirection::Receive, "a", 100, Locator::from("l"));
        let (_, mut sub) = registry.watch(id).unwrap();

        for bytes in 1..=50 {
            registry.update_progress(id, bytes, None, None).unwrap();
        }
        registry.complete(id).unwrap();

        let mut last = None;
        while let Some(event) = sub.next().await {
            last = Some(event);
        }
        assert!(last.unwrap().is_terminal());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let bus = EventBus::new(0);
        assert_eq!(bus.capacity, 1);
    }
}
