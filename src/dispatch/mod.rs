//! Serial event dispatch on owned threads.

pub(crate) mod core;
pub(crate) mod queue;

pub use self::core::Dispatcher;

use crate::error::DispatchError;
use crate::event::{EventId, EventRef, ReceiverKey, ReceiverRef};

use std::sync::Arc;

/// Capability set shared by everything that can dispatch events:
/// [`Dispatcher`] and [`Selector`](crate::selector::Selector).
///
/// A dispatcher owns one thread and a FIFO queue. Events posted from
/// any thread execute serially on the owned thread, in post order.
pub trait EventDispatcher: Send + Sync {
    /// Enqueues an event for `target` without waiting.
    ///
    /// Fails with [`Unroutable`](DispatchError::Unroutable) once the
    /// dispatcher is stopping or stopped.
    fn post(&self, event: EventRef, target: ReceiverRef) -> Result<(), DispatchError>;

    /// Enqueues an event and blocks until its handler has returned.
    ///
    /// Calling this from the dispatcher's own thread would wait on
    /// itself; the core detects that and fails with
    /// [`WouldDeadlock`](DispatchError::WouldDeadlock).
    fn send(&self, event: EventRef, target: ReceiverRef) -> Result<(), DispatchError>;

    /// Removes pending events matching `id` (or every id, for
    /// [`EventId::INVALID`]) and `target` (or any target, when absent).
    ///
    /// The event currently being dispatched is never affected. Fails
    /// with [`NotFound`](DispatchError::NotFound) when nothing matched.
    fn remove_events(
        &self,
        id: EventId,
        target: Option<&ReceiverRef>,
    ) -> Result<(), DispatchError>;

    /// Removes pending agent-style events whose ultimate receiver is
    /// `receiver` (see [`receiver_key`](crate::event::receiver_key)).
    fn remove_by_receiver(&self, receiver: ReceiverKey) -> Result<(), DispatchError>;

    /// True when called on the dispatcher's owned thread.
    fn is_dispatcher_thread(&self) -> bool;

    /// Stops the dispatch loop. Idempotent.
    ///
    /// From a foreign thread this enqueues the shutdown event and joins
    /// the owned thread, so everything posted earlier still runs. From
    /// the owned thread it only marks the loop as stopping; the loop
    /// exits after the current event.
    fn shutdown(&self) -> Result<(), DispatchError>;
}

/// Shared handle to any dispatcher.
pub type DispatcherRef = Arc<dyn EventDispatcher>;
