//! Event channel shared by every component
//!
//! Each component owns an [`EventChannel`]. Subscribers are invoked
//! synchronously, in subscription order, on the task that publishes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::Error;

/// Source address used for events raised by the local component itself
pub const INTERNAL_SOURCE: &str = "127.0.0.1";

/// Kind of event delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A message received over a TCP connection
    Communication,
    /// A UDP beacon
    Beacon,
    /// A file transfer session finished
    FileTransferComplete,
    /// Status information
    Info,
    /// Something went wrong
    Error,
}

/// Immutable notification published by a component
#[derive(Debug, Clone)]
pub struct Event {
    kind: EventKind,
    source_address: String,
    content: String,
    cause: Option<Arc<Error>>,
}

impl Event {
    pub fn new(kind: EventKind, source_address: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind,
            source_address: source_address.into(),
            content: content.into(),
            cause: None,
        }
    }

    /// A message received from `source_address`
    pub fn communication(source_address: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(EventKind::Communication, source_address, content)
    }

    /// A beacon received from `source_address`
    pub fn beacon(source_address: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(EventKind::Beacon, source_address, content)
    }

    pub fn info(content: impl Into<String>) -> Self {
        Self::new(EventKind::Info, INTERNAL_SOURCE, content)
    }

    pub fn transfer_complete(content: impl Into<String>) -> Self {
        Self::new(EventKind::FileTransferComplete, INTERNAL_SOURCE, content)
    }

    /// An error event; the content is the error's display text
    pub fn error(cause: Error) -> Self {
        Self {
            kind: EventKind::Error,
            source_address: INTERNAL_SOURCE.to_string(),
            content: cause.to_string(),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn source_address(&self) -> &str {
        &self.source_address
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.kind, self.source_address, self.content)
    }
}

/// Anything that can consume events
pub trait Subscriber: Send + Sync {
    fn handle(&self, event: &Event);
}

impl<F> Subscriber for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle(&self, event: &Event) {
        self(event)
    }
}

/// Ordered list of subscribers with synchronous fan-out
#[derive(Default)]
pub struct EventChannel {
    subscribers: Mutex<Vec<Arc<dyn Subscriber>>>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber. The same subscriber may be added more than once.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.lock().push(subscriber);
    }

    /// Remove the first registration of `subscriber` (by pointer identity).
    /// Returns whether one was removed.
    pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) -> bool {
        let mut subscribers = self.subscribers.lock();
        match subscribers.iter().position(|s| Arc::ptr_eq(s, subscriber)) {
            Some(index) => {
                subscribers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to every current subscriber, in order.
    ///
    /// The list is snapshotted first; handlers run without the lock held so
    /// they may publish or (un)subscribe themselves.
    pub fn publish(&self, event: Event) {
        let snapshot = self.subscribers();
        for subscriber in &snapshot {
            subscriber.handle(&event);
        }
    }

    /// Snapshot of the current subscribers
    pub fn subscribers(&self) -> Vec<Arc<dyn Subscriber>> {
        self.subscribers.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("subscribers", &self.len())
            .finish()
    }
}

/// Records every event it receives
#[derive(Debug, Default)]
pub struct Collector {
    events: Mutex<Vec<Event>>,
}

impl Collector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events of one kind, in arrival order
    pub fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

impl Subscriber for Collector {
    fn handle(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

/// Writes every event to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSubscriber;

impl Subscriber for LogSubscriber {
    fn handle(&self, event: &Event) {
        let source = event.source_address();
        let content = event.content();
        match event.kind() {
            EventKind::Communication => info!(from = %source, "message: {}", content),
            EventKind::Beacon => debug!(from = %source, "beacon: {}", content),
            EventKind::FileTransferComplete => info!("transfer complete: {}", content),
            EventKind::Info => info!("{}", content),
            EventKind::Error => match event.cause() {
                Some(cause) if !cause.is_fatal() => warn!("{}", content),
                _ => error!("{}", content),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_publish_in_subscription_order() {
        let channel = EventChannel::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let order = order.clone();
            channel.subscribe(Arc::new(move |_: &Event| order.lock().push(id)));
        }

        channel.publish(Event::info("hello"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_duplicates_receive_twice() {
        let channel = EventChannel::new();
        let collector = Collector::new();
        let subscriber: Arc<dyn Subscriber> = collector.clone();

        channel.subscribe(subscriber.clone());
        channel.subscribe(subscriber.clone());
        channel.publish(Event::beacon("10.0.0.2", "ping"));

        assert_eq!(collector.count(EventKind::Beacon), 2);
    }

    #[test]
    fn test_unsubscribe_removes_first_match_only() {
        let channel = EventChannel::new();
        let collector = Collector::new();
        let subscriber: Arc<dyn Subscriber> = collector.clone();

        channel.subscribe(subscriber.clone());
        channel.subscribe(subscriber.clone());
        assert!(channel.unsubscribe(&subscriber));
        assert_eq!(channel.len(), 1);

        channel.publish(Event::info("once"));
        assert_eq!(collector.events().len(), 1);

        assert!(channel.unsubscribe(&subscriber));
        assert!(!channel.unsubscribe(&subscriber));
        assert!(channel.is_empty());
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let channel = EventChannel::new();
        channel.publish(Event::info("before"));

        let collector = Collector::new();
        channel.subscribe(collector.clone());
        channel.publish(Event::info("after"));

        let events = collector.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content(), "after");
    }

    #[test]
    fn test_reentrant_publish() {
        let channel = Arc::new(EventChannel::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = channel.clone();
        let counter = calls.clone();
        channel.subscribe(Arc::new(move |event: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            if event.kind() == EventKind::Info {
                inner.publish(Event::beacon(INTERNAL_SOURCE, "echo"));
            }
        }));

        channel.publish(Event::info("start"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_event_carries_cause() {
        let event = Event::error(Error::NotConnected);
        assert_eq!(event.kind(), EventKind::Error);
        assert_eq!(event.source_address(), INTERNAL_SOURCE);
        assert_eq!(event.content(), "Not connected");
        assert!(matches!(event.cause(), Some(Error::NotConnected)));
    }
}
