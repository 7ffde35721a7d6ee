use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub of committed appointment events, one channel per clinician.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Follow a clinician's calendar. Creates the channel if needed.
    pub fn subscribe(&self, clinician_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(clinician_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening. Channels whose receivers all hung up are dropped.
    pub fn send(&self, clinician_id: Ulid, event: &Event) {
        let closed = match self.channels.get(&clinician_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => return,
        };
        if closed {
            self.channels
                .remove_if(&clinician_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn subscriber_count(&self, clinician_id: &Ulid) -> usize {
        self.channels
            .get(clinician_id)
            .map_or(0, |sender| sender.receiver_count())
    }
}
