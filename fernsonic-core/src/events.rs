//! Per-context events.
//!
//! The audio thread records occurrences such as a generator looping or
//! finishing; external code polls them. Delivery is fire-and-forget: nothing
//! on the audio thread ever waits for a consumer.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::handle::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A looping generator wrapped around.
    Looped,
    /// A non-looping generator reached the end of its data.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// Handle of the object the event is about; 0 if it was never exposed.
    pub source: Handle,
}

pub(crate) struct EventQueue {
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub(crate) fn emit(&self, kind: EventKind, source: Handle) {
        let _ = self.tx.send(Event { kind, source });
    }

    pub(crate) fn poll(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_poll_in_order() {
        let queue = EventQueue::new();
        queue.emit(EventKind::Looped, 7);
        queue.emit(EventKind::Finished, 7);
        assert_eq!(
            queue.poll(),
            Some(Event {
                kind: EventKind::Looped,
                source: 7
            })
        );
        assert_eq!(
            queue.poll(),
            Some(Event {
                kind: EventKind::Finished,
                source: 7
            })
        );
        assert_eq!(queue.poll(), None);
    }
}
