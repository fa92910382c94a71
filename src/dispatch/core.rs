use super::queue::{Completion, DispatchCore, WorkItem};
use super::EventDispatcher;
use crate::error::DispatchError;
use crate::event::{EventId, EventRef, ReceiverKey, ReceiverRef, ShutdownEvent};

use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// A thread owning a FIFO work queue.
///
/// The thread is named after the dispatcher for debugging and starts in
/// the constructor; [`Dispatcher::new`] returns once it is running.
/// Dropping the last handle shuts the thread down.
pub struct Dispatcher {
    core: Arc<DispatchCore>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Creates a dispatcher and starts its thread.
    pub fn new(name: &str) -> Arc<Dispatcher> {
        let core = Arc::new(DispatchCore::new(name, None));

        let loop_core = core.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || dispatch_loop(loop_core))
            .expect("failed to spawn dispatcher thread");

        core.wait_running();

        Arc::new(Dispatcher {
            core,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// The name given at construction, also the thread name.
    pub fn name(&self) -> &str {
        self.core.name()
    }
}

impl EventDispatcher for Dispatcher {
    fn post(&self, event: EventRef, target: ReceiverRef) -> Result<(), DispatchError> {
        post_to(&self.core, event, target)
    }

    fn send(&self, event: EventRef, target: ReceiverRef) -> Result<(), DispatchError> {
        send_to(&self.core, event, target)
    }

    fn remove_events(
        &self,
        id: EventId,
        target: Option<&ReceiverRef>,
    ) -> Result<(), DispatchError> {
        self.core.remove_events(id, target)
    }

    fn remove_by_receiver(&self, receiver: ReceiverKey) -> Result<(), DispatchError> {
        self.core.remove_by_receiver(receiver)
    }

    fn is_dispatcher_thread(&self) -> bool {
        self.core.is_dispatcher_thread()
    }

    fn shutdown(&self) -> Result<(), DispatchError> {
        shutdown_dispatch(&self.core, &self.thread)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = shutdown_dispatch(&self.core, &self.thread);
    }
}

/// The dispatch loop: FIFO pop, invoke, repeat until stopping; then
/// drain whatever is left without invoking handlers.
fn dispatch_loop(core: Arc<DispatchCore>) {
    core.register_thread();
    debug!("{}: dispatcher running", core.name());

    while let Some(item) = core.wait_for_work() {
        core.dispatch_item(item);
    }

    core.drain_without_dispatch();
    core.set_stopped();
    debug!("{}: dispatcher stopped", core.name());
}

pub(crate) fn post_to(
    core: &DispatchCore,
    event: EventRef,
    target: ReceiverRef,
) -> Result<(), DispatchError> {
    core.enqueue(WorkItem {
        event,
        target: Some(target),
        done: None,
    })
}

pub(crate) fn send_to(
    core: &DispatchCore,
    event: EventRef,
    target: ReceiverRef,
) -> Result<(), DispatchError> {
    if core.is_dispatcher_thread() {
        return Err(DispatchError::WouldDeadlock);
    }

    let done = Completion::new();
    core.enqueue(WorkItem {
        event,
        target: Some(target),
        done: Some(done.clone()),
    })?;
    done.wait();
    Ok(())
}

/// Shutdown shared by [`Dispatcher`] and the selector.
///
/// Foreign threads post the shutdown event and join; the owned thread
/// degrades to marking the loop as stopping so it cannot wait on
/// itself.
pub(crate) fn shutdown_dispatch(
    core: &DispatchCore,
    thread: &Mutex<Option<JoinHandle<()>>>,
) -> Result<(), DispatchError> {
    if core.is_dispatcher_thread() {
        core.set_stopping();
        return Ok(());
    }

    // Unroutable here just means another shutdown beat us to it.
    let _ = core.enqueue(WorkItem {
        event: Arc::new(ShutdownEvent),
        target: None,
        done: None,
    });

    let handle = thread.lock().unwrap().take();
    if let Some(handle) = handle {
        if handle.join().is_err() {
            warn!("{}: dispatch thread panicked", core.name());
        }
    }
    Ok(())
}
