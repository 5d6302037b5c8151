//! Typed publish/subscribe used for message lifecycle, interrupts and the
//! per-subsystem download events.
//!
//! Handlers run synchronously on the triggering thread, in subscription
//! order. Subscribing the same closure twice registers it twice. An
//! unsubscribe is serialised with trigger and takes effect from the next
//! trigger, so a handler may unsubscribe itself without corrupting an
//! in-progress dispatch.
//!
//! Handlers must not block the engine and must not call back into blocking
//! engine operations on the same connection.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

type Handler = Arc<dyn Fn(i32) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription<E> {
    kind: E,
    id: u64,
}

struct BusInner<E> {
    next_id: u64,
    handlers: HashMap<E, Vec<(u64, Handler)>>,
}

/// Ordered handler registry for one family of event kinds.
pub struct EventBus<E> {
    inner: Mutex<BusInner<E>>,
}

impl<E: Copy + Eq + Hash> EventBus<E> {
    pub fn new() -> EventBus<E> {
        EventBus {
            inner: Mutex::new(BusInner {
                next_id: 1,
                handlers: HashMap::new(),
            }),
        }
    }

    pub fn subscribe<F>(&self, kind: E, handler: F) -> Subscription<E>
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription { kind, id }
    }

    pub fn unsubscribe(&self, sub: &Subscription<E>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(list) = inner.handlers.get_mut(&sub.kind) {
            list.retain(|(id, _)| *id != sub.id);
        }
    }

    /// Invokes every handler registered for `kind` with `param`.
    ///
    /// The handler list is snapshotted under the lock and invoked outside
    /// it, so handlers may subscribe or unsubscribe for subsequent triggers.
    pub fn trigger(&self, kind: E, param: i32) {
        let snapshot: Vec<Handler> = {
            let inner = self.inner.lock().unwrap();
            match inner.handlers.get(&kind) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        for handler in snapshot {
            handler(param);
        }
    }
}

impl<E: Copy + Eq + Hash> Default for EventBus<E> {
    fn default() -> Self {
        EventBus::new()
    }
}

/// Message lifecycle events raised by the connection engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageEvent {
    /// A well-formed response was matched to an outstanding message.
    ResponseReceived,
    /// No response arrived within the receive timeout.
    ResponseTimedOut,
    /// Transmission did not complete within the send timeout.
    TimedOutOnSend,
    /// The transport reported a fatal send failure.
    SendError,
    /// A response arrived intact but carried a device error flag.
    ResponseErrorValid,
    /// A response frame failed its CRC check.
    ResponseErrorCrc,
    /// A response frame matched no outstanding message.
    ResponseErrorInvalid,
    /// An asynchronous interrupt report arrived.
    InterruptReceived,
    /// A bulk memory transfer finished; parameter is bytes transferred.
    MemoryTransferComplete,
    /// A bulk memory transfer failed.
    MemoryTransferError,
    /// A bulk transfer was requested while one was already active.
    MemoryTransferNotIdle,
    /// The auxiliary transfer channel could not be reached.
    DeviceNotAvailable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        bus.subscribe(MessageEvent::ResponseReceived, move |_| {
            o.lock().unwrap().push(1)
        });
        let o = order.clone();
        bus.subscribe(MessageEvent::ResponseReceived, move |_| {
            o.lock().unwrap().push(2)
        });

        bus.trigger(MessageEvent::ResponseReceived, 0);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn double_subscribe_registers_twice() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler = move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        };
        bus.subscribe(MessageEvent::InterruptReceived, handler.clone());
        bus.subscribe(MessageEvent::InterruptReceived, handler);
        bus.trigger(MessageEvent::InterruptReceived, 0);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_takes_effect_before_next_trigger() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = bus.subscribe(MessageEvent::SendError, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.trigger(MessageEvent::SendError, -1);
        bus.unsubscribe(&sub);
        bus.trigger(MessageEvent::SendError, -1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn trigger_carries_parameter() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        bus.subscribe(MessageEvent::MemoryTransferComplete, move |param| {
            *s.lock().unwrap() = param;
        });
        bus.trigger(MessageEvent::MemoryTransferComplete, 1_048_576);
        assert_eq!(*seen.lock().unwrap(), 1_048_576);
    }
}
