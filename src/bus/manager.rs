//! LocalEventBus implementation

use crate::bus::error::BusError;
use crate::bus::event::{EventFilter, LocalEvent};
use crate::bus::BusResult;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

struct SubscriberInfo {
    filter: EventFilter,
    sender: UnboundedSender<LocalEvent>,
}

/// Synchronous multicast event bus
///
/// Publishing walks the subscriber registry and sends a clone of the event
/// to every subscriber whose filter accepts it. The send itself never
/// blocks; subscribers consume from their receiver at their own pace.
///
/// # Thread Safety
///
/// The bus is shared as `Arc<LocalEventBus>`; the registry is protected by
/// a mutex that is only held for the duration of a publish or subscribe
/// call, never across an await point.
pub struct LocalEventBus {
    subscribers: Mutex<HashMap<String, SubscriberInfo>>,
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a subscriber and return its event receiver
    ///
    /// Re-subscribing with an existing id replaces the previous
    /// registration (the old receiver stops getting events).
    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        filter: EventFilter,
    ) -> UnboundedReceiver<LocalEvent> {
        let subscriber_id = subscriber_id.into();
        let (sender, receiver) = unbounded_channel();

        let mut subscribers = self.subscribers.lock().unwrap();
        if subscribers
            .insert(subscriber_id.clone(), SubscriberInfo { filter, sender })
            .is_some()
        {
            log::warn!("Subscriber '{}' replaced an existing subscription", subscriber_id);
        }

        receiver
    }

    /// Subscribe to every event on the bus
    pub fn subscribe_all(&self, subscriber_id: impl Into<String>) -> UnboundedReceiver<LocalEvent> {
        self.subscribe(subscriber_id, EventFilter::All)
    }

    /// Multicast an event to all matching subscribers
    ///
    /// Subscribers whose channel has closed are removed; their ids are
    /// reported in the returned error. Delivery to the remaining
    /// subscribers is unaffected.
    pub fn publish(&self, event: LocalEvent) -> BusResult<()> {
        let mut failed_subscribers = Vec::new();
        let mut subscribers = self.subscribers.lock().unwrap();

        for (subscriber_id, info) in subscribers.iter() {
            if info.filter.accepts(&event) && info.sender.send(event.clone()).is_err() {
                failed_subscribers.push(subscriber_id.clone());
            }
        }

        for subscriber_id in &failed_subscribers {
            subscribers.remove(subscriber_id);
        }

        if failed_subscribers.is_empty() {
            Ok(())
        } else {
            Err(BusError::PublishFailed {
                event_name: event.name,
                failed_subscribers,
            })
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    pub fn has_subscriber(&self, subscriber_id: &str) -> bool {
        self.subscribers.lock().unwrap().contains_key(subscriber_id)
    }
}
