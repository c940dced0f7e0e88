use std::sync::{Arc, Mutex, PoisonError};

use log::Level;

use crate::nt_interface::{Event, EventSink, NodeId, NtTime};

/// Forwards node events to the `log` facade as structured lines:
/// `type=<kind> node=<id> peer=<id|-> t=<tick> <content>`
pub struct LogEventSink {
    level: Level,
    /// Message traffic is logged one level below protocol notices
    traffic_level: Level,
}

impl LogEventSink {
    pub fn new() -> Self {
        Self {
            level: Level::Info,
            traffic_level: Level::Debug,
        }
    }
}

impl Default for LogEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for LogEventSink {
    fn log(&mut self, time: NtTime, node: NodeId, event: Event) {
        let level = match event {
            Event::MessageSent { .. } | Event::MessageReceived { .. } => self.traffic_level,
            _ => self.level,
        };
        let peer = event
            .peer()
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        log::log!(
            level,
            "type={} node={} peer={} t={} {}",
            event.kind(),
            node,
            peer,
            time,
            event
        );
    }
}

/// Recorded event: (tick, node, event)
pub type RecordedEvent = (NtTime, NodeId, Event);

/// Shared in-memory sink; clones append to the same record
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded events matching `predicate`
    pub fn count<F: Fn(NodeId, &Event) -> bool>(&self, predicate: F) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, node, event)| predicate(*node, event))
            .count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for MemorySink {
    fn log(&mut self, time: NtTime, node: NodeId, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((time, node, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_clones_share_record() {
        let sink = MemorySink::new();
        let mut a: Box<dyn EventSink> = Box::new(sink.clone());
        let mut b: Box<dyn EventSink> = Box::new(sink.clone());

        a.log(1, 1, Event::TokenPassed { to: 2 });
        b.log(2, 2, Event::TokenAcquired { from: 1 });
        b.log(2, 2, Event::CriticalSectionEntered { cnt: 0 });

        assert_eq!(sink.events().len(), 3);
        assert_eq!(
            sink.count(|node, e| node == 2 && matches!(e, Event::TokenAcquired { .. })),
            1
        );

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_structured_fields() {
        let event = Event::RequestForwarded {
            requester: 3,
            to: 2,
        };
        assert_eq!(event.kind(), "forward");
        assert_eq!(event.peer(), Some(3));
        assert_eq!(event.to_string(), "forward request of 3 to 2");
        assert_eq!(Event::TokenRegenerated.peer(), None);

        // logging without an installed logger is a no-op
        let mut sink = LogEventSink::new();
        sink.log(0, 1, event);
    }
}
