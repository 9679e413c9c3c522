//! Event Subscription Module
//!
//! Notifications emitted by successful dispenser operations.

use drip_common::types::{amount_string, Address, Amount, Timestamp};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event types emitted by the dispenser
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FaucetEvent {
    /// Tokens were dispensed
    Requested {
        recipient: Address,
        #[serde(with = "amount_string")]
        amount: Amount,
        timestamp: Timestamp,
    },
    /// Dispensing was suspended
    Paused { account: Address },
    /// Dispensing was resumed
    Unpaused { account: Address },
    /// Ownership changed hands (or was renounced to the zero address)
    OwnershipTransferred {
        previous_owner: Address,
        new_owner: Address,
    },
}

/// Event subscriber handle
pub struct EventSubscriber {
    receiver: broadcast::Receiver<FaucetEvent>,
}

impl EventSubscriber {
    /// Receive next event, skipping over any the subscriber lagged behind on.
    pub async fn recv(&mut self) -> Option<FaucetEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive an already-published event without waiting.
    pub fn try_recv(&mut self) -> Option<FaucetEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Event publisher for dispenser events
pub struct EventPublisher {
    sender: broadcast::Sender<FaucetEvent>,
}

impl EventPublisher {
    /// Create new event publisher
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish event to all subscribers
    pub fn publish(&self, event: FaucetEvent) {
        if let Err(e) = self.sender.send(event) {
            debug!("No subscribers to receive event: {:?}", e.0);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let publisher = EventPublisher::new(16);
        let mut sub = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);

        let event = FaucetEvent::Paused {
            account: Address([1; 20]),
        };
        publisher.publish(event.clone());

        assert_eq!(sub.recv().await, Some(event));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let publisher = EventPublisher::default();
        publisher.publish(FaucetEvent::Unpaused {
            account: Address::ZERO,
        });
    }

    #[test]
    fn test_requested_event_json_shape() {
        let event = FaucetEvent::Requested {
            recipient: Address([0x11; 20]),
            amount: 500_000_000_000_000_000,
            timestamp: 1_700_000_000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "requested");
        assert_eq!(json["amount"], "500000000000000000");
        assert_eq!(json["timestamp"], 1_700_000_000u64);
    }
}
