use std::collections::HashMap;

/// Kinds of events the transcoder's log parser can raise. Kept as an enum
/// key rather than a string so the bus can't be driven by typos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Progress,
    Output,
}

#[derive(Debug, Clone)]
pub enum Event {
    Progress(u8),
    Output { transcode_completed: bool },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Progress(_) => EventKind::Progress,
            Event::Output { .. } => EventKind::Output,
        }
    }
}

pub trait Observer: Send {
    fn notify(&mut self, event: &Event);
}

/// Topic-keyed fan-out, replacing the inheritance-based `Observable` the
/// original log parser mixed into itself.
#[derive(Default)]
pub struct EventBus {
    observers: HashMap<EventKind, Vec<Box<dyn Observer>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: EventKind, observer: Box<dyn Observer>) {
        self.observers.entry(kind).or_default().push(observer);
    }

    pub fn notify(&mut self, event: Event) {
        if let Some(observers) = self.observers.get_mut(&event.kind()) {
            for observer in observers.iter_mut() {
                observer.notify(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Counter(Arc<Mutex<u32>>);
    impl Observer for Counter {
        fn notify(&mut self, _event: &Event) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn only_registered_topic_is_notified() {
        let count = Arc::new(Mutex::new(0));
        let mut bus = EventBus::new();
        bus.register(EventKind::Progress, Box::new(Counter(count.clone())));
        bus.notify(Event::Output {
            transcode_completed: true,
        });
        assert_eq!(*count.lock().unwrap(), 0);
        bus.notify(Event::Progress(50));
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
