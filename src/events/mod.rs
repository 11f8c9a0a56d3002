//! Event system for session status notifications
//!
//! Handlers are registered per [`EventKind`] and invoked synchronously, in
//! registration order, on every [`EventBus::emit`]. A handler that fails or
//! panics is logged and skipped; the remaining handlers still run.
//!
//! Async consumers can instead [`EventBus::subscribe`] to a broadcast channel
//! that carries every emitted event.

pub mod types;

pub use types::{EventKind, SessionEvent};

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, warn};

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Observer interface for session events
///
/// Implemented for any `Fn(&SessionEvent) -> anyhow::Result<()>`.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &SessionEvent) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &SessionEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Registration handle returned by [`EventBus::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type HandlerList = Vec<(HandlerId, Arc<dyn EventHandler>)>;

/// Session event bus
///
/// # Example
///
/// ```no_run
/// use rtc_session::events::{EventBus, EventKind, SessionEvent};
///
/// let bus = EventBus::new();
///
/// let id = bus.on(EventKind::StreamingStarted, |event: &SessionEvent| {
///     println!("started: {:?}", event);
///     Ok(())
/// });
///
/// bus.emit(SessionEvent::StreamingStarted {
///     stream_id: "room42".to_string(),
/// });
///
/// bus.off(EventKind::StreamingStarted, id);
/// ```
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, HandlerList>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    /// Register a closure for one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_handler(kind, Arc::new(handler))
    }

    /// Register a shared observer for one event kind
    pub fn on_handler(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().entry(kind).or_default().push((id, handler));
        id
    }

    /// Deregister a handler
    ///
    /// Returns `false` if the handler was not registered for `kind`.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Dispatch an event to its handlers, then to broadcast subscribers
    pub fn emit(&self, event: SessionEvent) {
        let kind = event.kind();

        // Snapshot so handlers may call on()/off() without deadlocking
        let handlers: HandlerList = self
            .handlers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Event handler {:?} for {} failed: {}", id, kind, e);
                }
                Err(panic) => {
                    error!(
                        "Event handler {:?} for {} panicked: {}",
                        id,
                        kind,
                        panic_message(&*panic)
                    );
                }
            }
        }

        // No subscribers is normal
        let _ = self.tx.send(event);
    }

    /// Subscribe to every event
    ///
    /// The receiver uses a ring buffer; a subscriber that falls too far
    /// behind receives a `Lagged` error and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Number of handlers registered for `kind`
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn started() -> SessionEvent {
        SessionEvent::StreamingStarted {
            stream_id: "room42".to_string(),
        }
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::StreamingStarted, |_: &SessionEvent| {
            panic!("handler blew up");
        });
        let counter = calls.clone();
        bus.on(EventKind::StreamingStarted, move |_: &SessionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(started());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        bus.emit(started());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_returning_handler_does_not_block_others() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::StreamingStarted, |_: &SessionEvent| {
            anyhow::bail!("consumer rejected event")
        });
        let counter = calls.clone();
        bus.on(EventKind::StreamingStarted, move |_: &SessionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(started());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handlers_only_see_their_kind() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        bus.on(EventKind::StreamingStopped, move |_: &SessionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(started());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_off_removes_handler() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let id = bus.on(EventKind::StreamingStarted, move |_: &SessionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(bus.handler_count(EventKind::StreamingStarted), 1);

        assert!(bus.off(EventKind::StreamingStarted, id));
        assert!(!bus.off(EventKind::StreamingStarted, id));
        assert_eq!(bus.handler_count(EventKind::StreamingStarted), 0);

        bus.emit(started());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_can_deregister_during_emit() {
        let bus = Arc::new(EventBus::new());
        let slot = Arc::new(parking_lot::Mutex::new(None::<HandlerId>));

        let bus_ref = Arc::downgrade(&bus);
        let slot_ref = slot.clone();
        let id = bus.on(EventKind::StreamingStarted, move |_: &SessionEvent| {
            if let (Some(bus), Some(id)) = (bus_ref.upgrade(), *slot_ref.lock()) {
                bus.off(EventKind::StreamingStarted, id);
            }
            Ok(())
        });
        *slot.lock() = Some(id);

        bus.emit(started());
        assert_eq!(bus.handler_count(EventKind::StreamingStarted), 0);
    }

    #[tokio::test]
    async fn test_subscribe_receives_all_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(started());
        bus.emit(SessionEvent::SignalingError {
            message: "test".to_string(),
        });

        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::StreamingStarted);
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::SignalingError);
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        // Should not panic when emitting with no handlers or subscribers
        bus.emit(started());
    }
}
