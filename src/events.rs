//! Typed lifecycle events and the synchronous bus that delivers them.
//!
//! Observers are invoked in registration order on the emitting thread.
//! An observer may emit further events; delivery does not hold the
//! registry lock, so nested emission cannot deadlock.

use crate::models::{Message, MessageKey, ProjectId, QueuedSeries, ResultOwner, ResultStatus};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyTarget {
    Project(ProjectId),
    Message(MessageKey),
}

#[derive(Debug, Clone)]
pub enum Event {
    MessageAdded {
        message: Message,
    },
    SeriesComplete {
        project: ProjectId,
        series: Message,
    },
    SeriesMerged {
        project: ProjectId,
        series: Message,
    },
    TagsUpdate {
        series: Message,
    },
    SetProperty {
        target: PropertyTarget,
        name: String,
        value: Option<Value>,
        old_value: Option<Value>,
    },
    ResultUpdate {
        owner: ResultOwner,
        name: String,
        old_status: Option<ResultStatus>,
        status: ResultStatus,
    },
    MessageQueued {
        entry: QueuedSeries,
    },
    MessageDropped {
        entry: QueuedSeries,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::MessageAdded { .. } => "MessageAdded",
            Event::SeriesComplete { .. } => "SeriesComplete",
            Event::SeriesMerged { .. } => "SeriesMerged",
            Event::TagsUpdate { .. } => "TagsUpdate",
            Event::SetProperty { .. } => "SetProperty",
            Event::ResultUpdate { .. } => "ResultUpdate",
            Event::MessageQueued { .. } => "MessageQueued",
            Event::MessageDropped { .. } => "MessageDropped",
        }
    }
}

pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventObserver for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    observers: Arc<RwLock<Vec<Arc<dyn EventObserver>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn EventObserver>) {
        self.observers.write().push(observer);
    }

    /// Deliver `event` to every observer, returning how many saw it.
    pub fn emit(&self, event: Event) -> usize {
        let observers: Vec<Arc<dyn EventObserver>> = self.observers.read().clone();
        log::trace!("emitting {} to {} observers", event.name(), observers.len());
        for observer in &observers {
            observer.on_event(&event);
        }
        observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn queued() -> Event {
        Event::MessageQueued {
            entry: QueuedSeries {
                user: "alice".into(),
                message: MessageKey::new(1, "a@b"),
                name: "accept".into(),
            },
        }
    }

    #[test]
    fn observers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.register(Arc::new(move |_: &Event| seen.lock().push(label)));
        }

        assert_eq!(bus.emit(queued()), 3);
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn observers_may_emit_nested_events() {
        let bus = EventBus::new();
        let names = Arc::new(Mutex::new(Vec::new()));

        let inner_bus = bus.clone();
        bus.register(Arc::new(move |event: &Event| {
            if let Event::MessageQueued { entry } = event {
                inner_bus.emit(Event::MessageDropped {
                    entry: entry.clone(),
                });
            }
        }));
        let recorded = names.clone();
        bus.register(Arc::new(move |event: &Event| recorded.lock().push(event.name())));

        bus.emit(queued());
        assert_eq!(*names.lock(), vec!["MessageDropped", "MessageQueued"]);
    }
}
