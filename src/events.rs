//! In-process typed event bus
//!
//! Connects the broker client to the RPC engine without either knowing the
//! other: the client publishes lifecycle events such as
//! [`ConnectionRecovered`], and interested parties subscribe by event type.
//! Callbacks run synchronously on whichever thread publishes, so handlers
//! must be quick and must not block.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Broker channel a lifecycle event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Channel used for publishing
    Producer,
    /// Channel deliveries are consumed on
    Consumer,
}

/// Raised by the broker client once a dropped connection has been
/// re-established and the given channel is usable again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRecovered {
    /// Which channel recovered
    pub channel: ChannelKind,
}

struct RegisteredHandler {
    id: u64,
    callback: Box<dyn Any + Send + Sync>,
}

/// Typed publish/subscribe registry
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<TypeId, Vec<RegisteredHandler>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for events of type `E`
    ///
    /// The handler stays registered until the returned guard is dropped or
    /// [`unsubscribed`](EventStreamSubscription::unsubscribe).
    pub fn subscribe<E, F>(self: &Arc<Self>, handler: F) -> EventStreamSubscription
    where
        E: Send + Sync + 'static,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let callback: Arc<dyn Fn(&E) + Send + Sync> = Arc::new(handler);

        self.handlers
            .lock()
            .unwrap()
            .entry(TypeId::of::<E>())
            .or_default()
            .push(RegisteredHandler {
                id,
                callback: Box::new(callback),
            });

        EventStreamSubscription {
            bus: Arc::downgrade(self),
            event: TypeId::of::<E>(),
            id,
        }
    }

    /// Delivers an event to every handler registered for its type
    pub fn publish<E: Send + Sync + 'static>(&self, event: &E) {
        // Handlers are cloned out so a callback may subscribe or unsubscribe
        let callbacks: Vec<Arc<dyn Fn(&E) + Send + Sync>> = {
            let handlers = self.handlers.lock().unwrap();
            handlers
                .get(&TypeId::of::<E>())
                .map(|registered| {
                    registered
                        .iter()
                        .filter_map(|handler| {
                            handler
                                .callback
                                .downcast_ref::<Arc<dyn Fn(&E) + Send + Sync>>()
                                .cloned()
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        for callback in callbacks {
            callback(event);
        }
    }

    fn unsubscribe(&self, event: &TypeId, id: u64) {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(registered) = handlers.get_mut(event) {
            registered.retain(|handler| handler.id != id);
        }
    }
}

/// Guard for a handler registration; dropping it removes the handler
pub struct EventStreamSubscription {
    bus: Weak<EventBus>,
    event: TypeId,
    id: u64,
}

impl EventStreamSubscription {
    /// Removes the handler immediately
    pub fn unsubscribe(self) {}
}

impl Drop for EventStreamSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.event, self.id);
        }
    }
}
