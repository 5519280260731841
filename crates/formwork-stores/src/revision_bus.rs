//! Revision event bus
//!
//! Broadcast channel carrying one event per committed revision.
//! Subscribers (the watcher monitor) attach and detach freely;
//! publishing with no subscribers is a no-op, not an error.

use tokio::sync::broadcast;

use formwork_core::store::RevisionEvent;

/// Broadcast bus over committed revisions.
#[derive(Debug, Clone)]
pub struct RevisionBus {
    sender: broadcast::Sender<RevisionEvent>,
}

impl RevisionBus {
    /// Create a bus with a bounded backlog per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: RevisionEvent) {
        // SendError only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RevisionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RevisionBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formwork_core::types::{SectionName, WriterId};

    fn event(revision: u64) -> RevisionEvent {
        RevisionEvent {
            section: SectionName::plan(),
            revision,
            writer: WriterId::new("planning"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = RevisionBus::new(8);
        bus.publish(event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_receives_in_order() {
        tokio_test::block_on(async {
            let bus = RevisionBus::new(8);
            let mut rx = bus.subscribe();
            bus.publish(event(1));
            bus.publish(event(2));
            assert_eq!(rx.recv().await.unwrap().revision, 1);
            assert_eq!(rx.recv().await.unwrap().revision, 2);
        });
    }
}
