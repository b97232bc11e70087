use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{ReservationEvent, ResourceId, ResourceKind};

const CHANNEL_CAPACITY: usize = 256;

/// Receives reservation lifecycle events. Delivery (mail, PDF) is the
/// implementor's concern.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, event: ReservationEvent);
}

/// Broadcast hub: one firehose plus one channel per resource.
pub struct NotifyHub {
    all: broadcast::Sender<ReservationEvent>,
    channels: DashMap<(ResourceKind, ResourceId), broadcast::Sender<ReservationEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            channels: DashMap::new(),
        }
    }

    /// Every event, for the mail/PDF dispatcher.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ReservationEvent> {
        self.all.subscribe()
    }

    /// Events touching one resource, as primary resource or attached equipment.
    pub fn subscribe(&self, kind: ResourceKind, resource_id: ResourceId) -> broadcast::Receiver<ReservationEvent> {
        self.channels
            .entry((kind, resource_id))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop a resource channel (e.g. when the resource is retired).
    pub fn remove(&self, kind: ResourceKind, resource_id: ResourceId) {
        self.channels.remove(&(kind, resource_id));
    }
}

impl NotificationDispatcher for NotifyHub {
    /// No-op for channels nobody listens on.
    fn dispatch(&self, event: ReservationEvent) {
        for key in event.reservation.day_keys() {
            if let Some(sender) = self.channels.get(&(key.kind, key.resource_id)) {
                let _ = sender.send(event.clone());
            }
        }
        let _ = self.all.send(event);
    }
}
