//! Contains the events and functionality for monitoring internal `Client` behavior.
//!
//! Handlers are registered on a [`Client`](crate::Client) in one of two ways:
//!
//! * as an object implementing [`CommandEventHandler`](command::CommandEventHandler) or
//!   [`SdamEventHandler`](sdam::SdamEventHandler). The client only keeps a weak reference to it,
//!   so the caller owns the handler and must keep it alive for as long as it wants events.
//! * as a callback closure. The client owns the closure for the rest of its lifetime.
//!
//! Events are delivered to handlers in registration order, on the thread that produced the
//! event. A handler that panics is not caught.

pub mod command;
pub mod sdam;

use std::sync::{Arc, PoisonError, RwLock, Weak};

use derive_where::derive_where;

/// A registered handler, tagged by how the client holds it.
#[derive_where(Clone)]
pub(crate) enum Registration<H: ?Sized, E> {
    /// An object owned by the caller.
    Observer(Weak<H>),
    /// A closure owned by the client.
    Callback(Arc<dyn Fn(E) + Send + Sync>),
}

/// An ordered list of handlers for one family of events.
pub(crate) struct HandlerRegistry<H: ?Sized, E> {
    handlers: RwLock<Vec<Registration<H, E>>>,
}

impl<H: ?Sized, E> std::fmt::Debug for HandlerRegistry<H, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

impl<H: ?Sized, E> Default for HandlerRegistry<H, E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<H: ?Sized, E> HandlerRegistry<H, E> {
    pub(crate) fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<H: ?Sized, E: Clone> HandlerRegistry<H, E> {
    pub(crate) fn add_observer(&self, handler: Weak<H>) {
        self.write().push(Registration::Observer(handler));
    }

    pub(crate) fn add_callback(&self, callback: impl Fn(E) + Send + Sync + 'static) {
        self.write().push(Registration::Callback(Arc::new(callback)));
    }

    /// Delivers the event produced by `make_event` to every live handler. `deliver` maps an event
    /// onto the matching method of an observer. The event is only built if someone is listening.
    pub(crate) fn emit(&self, make_event: impl FnOnce() -> E, deliver: impl Fn(&H, E)) {
        // Snapshot so that handlers may register further handlers without deadlocking.
        let snapshot: Vec<Registration<H, E>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if snapshot.is_empty() {
            return;
        }

        let event = make_event();
        let mut saw_dead_observer = false;
        for registration in snapshot {
            match registration {
                Registration::Observer(weak) => match weak.upgrade() {
                    Some(handler) => deliver(&*handler, event.clone()),
                    None => saw_dead_observer = true,
                },
                Registration::Callback(callback) => callback(event.clone()),
            }
        }

        if saw_dead_observer {
            self.write().retain(|registration| match registration {
                Registration::Observer(weak) => weak.strong_count() > 0,
                Registration::Callback(_) => true,
            });
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Registration<H, E>>> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
