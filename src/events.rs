//! Event bus backing `Request::EventStream` (§6): a fan-out broadcaster
//! shared by the Engine and every live Session/Guest Forwarder, so a
//! captured keystroke or relay outcome can be published straight from the
//! worker thread that observed it.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use kbd_proto::Event;

/// Unbounded per subscriber: a slow listener never blocks a publisher, and
/// a subscriber is dropped only once its receiver disconnects, never
/// because of a full buffer — there isn't one.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(Event::StateTransitioned { session: kbd_proto::SessionId(1), state: "Active" });
        assert!(matches!(rx.recv().unwrap(), Event::StateTransitioned { .. }));
    }

    #[test]
    fn dropped_receiver_is_pruned_on_next_publish() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe();
        }
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
        bus.publish(Event::StateTransitioned { session: kbd_proto::SessionId(1), state: "Active" });
        assert_eq!(bus.subscribers.lock().unwrap().len(), 0);
    }
}
