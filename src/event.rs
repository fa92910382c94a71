//! Events, receivers and their identities.
//!
//! An [`Event`] is a reference-counted unit of work with a stable
//! [`EventId`]. Events travel behind an [`EventRef`] handle: cloning the
//! handle retains the event, dropping it releases it, and the event is
//! destroyed when the last handle goes away. Dispatchers bind each
//! posted event to an [`EventReceiver`], which is invoked serially on
//! the dispatcher's owned thread.

use std::any::Any;
use std::sync::Arc;

/// Stable identity of an [`Event`].
///
/// Ids are opaque integers chosen by the event author, typically a type
/// tag. Ids below [`EventId::FIRST_USER`] are reserved for the core's
/// control events.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EventId(pub u64);

impl EventId {
    /// Sentinel meaning "no id". Removal calls treat it as a wildcard
    /// matching every pending event.
    pub const INVALID: EventId = EventId(0);

    /// Internal control event that stops a dispatch loop.
    pub(crate) const SHUTDOWN: EventId = EventId(1);

    /// First id available to user event types.
    pub const FIRST_USER: EventId = EventId(16);
}

/// Opaque identity of a receiver or listener, used for bulk removal of
/// agent-style events.
pub type ReceiverKey = usize;

/// Returns the identity key of a reference-counted object.
///
/// The key is the address of the shared allocation; it is stable for as
/// long as any handle to the object is alive.
pub fn receiver_key<T: ?Sized>(target: &Arc<T>) -> ReceiverKey {
    Arc::as_ptr(target) as *const () as ReceiverKey
}

/// A unit of work with a stable identity.
pub trait Event: Send + Sync + 'static {
    /// The stable identity of this event.
    fn id(&self) -> EventId;

    /// The ultimate receiver of an agent-style event, if any.
    ///
    /// Events that report a key here can be removed in bulk with
    /// `remove_by_receiver` / `remove_agents_by_receiver` before they
    /// run.
    fn receiver_key(&self) -> Option<ReceiverKey> {
        None
    }

    /// Concrete-type access for receivers that need the payload.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to an event.
pub type EventRef = Arc<dyn Event>;

/// Target of a dispatched event.
pub trait EventReceiver: Send + Sync {
    /// Called on the dispatcher's owned thread, serially with every
    /// other event dispatched there.
    fn receive_event(&self, event: &EventRef);
}

/// Shared handle to a receiver.
pub type ReceiverRef = Arc<dyn EventReceiver>;

/// Agent-style event: a closure plus the identity of the object the
/// closure acts on, so a whole batch can be cancelled with
/// `remove_by_receiver` before any of it runs.
pub struct FnEvent {
    id: EventId,
    receiver: ReceiverKey,
    f: Box<dyn Fn() + Send + Sync>,
}

impl FnEvent {
    /// Wraps `f` as an event acting on `receiver`.
    pub fn new<T: ?Sized>(
        id: EventId,
        receiver: &Arc<T>,
        f: impl Fn() + Send + Sync + 'static,
    ) -> EventRef {
        Arc::new(FnEvent {
            id,
            receiver: receiver_key(receiver),
            f: Box::new(f),
        })
    }

    /// Runs the wrapped closure.
    pub fn invoke(&self) {
        (self.f)()
    }
}

impl Event for FnEvent {
    fn id(&self) -> EventId {
        self.id
    }

    fn receiver_key(&self) -> Option<ReceiverKey> {
        Some(self.receiver)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Receiver that runs [`FnEvent`]s. Events of any other type are
/// ignored.
pub struct FnEventReceiver;

impl EventReceiver for FnEventReceiver {
    fn receive_event(&self, event: &EventRef) {
        if let Some(agent) = event.as_any().downcast_ref::<FnEvent>() {
            agent.invoke();
        }
    }
}

/// Control event that transitions the owning dispatch loop to Stopping.
///
/// Posted by `shutdown` so that everything enqueued before the call is
/// still dispatched first.
pub(crate) struct ShutdownEvent;

impl Event for ShutdownEvent {
    fn id(&self) -> EventId {
        EventId::SHUTDOWN
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
