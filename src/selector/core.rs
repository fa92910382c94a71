use super::SelectorListener;
use crate::dispatch::core::{post_to, send_to, shutdown_dispatch};
use crate::dispatch::queue::DispatchCore;
use crate::dispatch::EventDispatcher;
use crate::error::DispatchError;
use crate::event::{receiver_key, EventId, EventRef, ReceiverKey, ReceiverRef};
use crate::sys::{self, Waker, FORCED_EVENTS};

use log::{debug, error};
use std::os::fd::RawFd;
use std::process;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// How many descriptors one selector can poll at once, wake pipe
/// included. Exceeding the cap is fatal: selector fan-out is a fixed
/// design bound, not a tunable.
pub const MAX_POLL_FDS: usize = 64;

/// A dispatcher whose loop multiplexes file-descriptor readiness.
///
/// Construction starts the thread; [`Selector::new`] returns once it is
/// polling. The full [`EventDispatcher`] surface is available and
/// behaves exactly as on a plain [`Dispatcher`](crate::Dispatcher):
/// posted events run on the selector's thread between polls.
pub struct Selector {
    core: Arc<DispatchCore>,
    shared: Arc<SelectorShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// State shared with the poll thread.
struct SelectorShared {
    listeners: Mutex<ListenerTable>,
    wake: Waker,
    pipe_read: RawFd,
}

impl Drop for SelectorShared {
    fn drop(&mut self) {
        sys::sys_close(self.pipe_read);
        sys::sys_close(self.wake.0);
    }
}

struct ListenerTable {
    /// Insertion order is dispatch order; duplicate fds are allowed and
    /// get one poll slot each.
    entries: Vec<ListenerEntry>,
    /// Set whenever `entries` changes while the thread may be inside
    /// poll; the descriptor array is rebuilt before the next poll.
    update_needed: bool,
}

#[derive(Clone)]
struct ListenerEntry {
    fd: RawFd,
    mask: i16,
    listener: Arc<dyn SelectorListener>,
    cookie: usize,
}

impl Selector {
    /// Creates a selector and starts its poll thread.
    pub fn new(name: &str) -> Result<Arc<Selector>, DispatchError> {
        let (pipe_read, pipe_write) = sys::sys_pipe()?;

        let core = Arc::new(DispatchCore::new(name, Some(Waker(pipe_write))));
        let shared = Arc::new(SelectorShared {
            listeners: Mutex::new(ListenerTable {
                entries: Vec::new(),
                update_needed: true,
            }),
            wake: Waker(pipe_write),
            pipe_read,
        });

        let loop_core = core.clone();
        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || poll_loop(loop_core, loop_shared))
            .expect("failed to spawn selector thread");

        core.wait_running();

        Ok(Arc::new(Selector {
            core,
            shared,
            thread: Mutex::new(Some(handle)),
        }))
    }

    /// The name given at construction, also the thread name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Registers a listener for a set of poll events on `fd`.
    ///
    /// May be called from any thread, including a listener callback;
    /// the registration takes effect on the next poll iteration.
    /// `cookie` is echoed back on every notification.
    pub fn add_listener(
        &self,
        fd: RawFd,
        mask: i16,
        listener: Arc<dyn SelectorListener>,
        cookie: usize,
    ) {
        let mut table = self.shared.listeners.lock().unwrap();
        if table.entries.len() + 1 >= MAX_POLL_FDS {
            error!(
                "{}: {} ({} listeners, cap {})",
                self.core.name(),
                DispatchError::Overflow,
                table.entries.len(),
                MAX_POLL_FDS
            );
            process::abort();
        }
        table.entries.push(ListenerEntry {
            fd,
            mask,
            listener,
            cookie,
        });
        table.update_needed = true;
        drop(table);

        self.shared.wake.wake();
    }

    /// Removes every registration matching `(fd, listener)`.
    pub fn remove_listener(
        &self,
        fd: RawFd,
        listener: &Arc<dyn SelectorListener>,
    ) -> Result<(), DispatchError> {
        let key = receiver_key(listener);
        let mut table = self.shared.listeners.lock().unwrap();
        let before = table.entries.len();
        table
            .entries
            .retain(|e| !(e.fd == fd && receiver_key(&e.listener) == key));
        if table.entries.len() == before {
            return Err(DispatchError::NotFound);
        }
        table.update_needed = true;
        drop(table);

        self.shared.wake.wake();
        Ok(())
    }

    /// Number of registered listener entries.
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.lock().unwrap().entries.len()
    }

    /// Number of listener entries registered for `fd`.
    pub fn listeners_for(&self, fd: RawFd) -> usize {
        self.shared
            .listeners
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| e.fd == fd)
            .count()
    }
}

impl EventDispatcher for Selector {
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

impl Drop for Selector {
    fn drop(&mut self) {
        let _ = shutdown_dispatch(&self.core, &self.thread);
    }
}

/// The poll loop: rebuild the descriptor array when listeners changed,
/// block in poll, deliver readiness to a snapshot of the table, then
/// drain the work queue so events posted by listeners run promptly.
fn poll_loop(core: Arc<DispatchCore>, shared: Arc<SelectorShared>) {
    core.register_thread();
    debug!("{}: selector running", core.name());

    let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(MAX_POLL_FDS);

    loop {
        {
            let mut table = shared.listeners.lock().unwrap();
            if table.update_needed {
                fill_pollfds(core.name(), &mut table, shared.pipe_read, &mut pollfds);
            }
        }

        let ready = match sys::sys_poll(&mut pollfds) {
            Ok(n) => n,
            Err(err) => {
                error!("{}: poll failed: {}", core.name(), err);
                break;
            }
        };

        if ready > 0 {
            // The notified set is the set registered when this pass
            // starts; callbacks may mutate the table but the change
            // applies to the next iteration.
            let snapshot: Vec<ListenerEntry> =
                shared.listeners.lock().unwrap().entries.clone();

            if pollfds[0].revents != 0 {
                sys::sys_drain_wake(shared.pipe_read);
            }

            // Each slot only reports the bits its own mask requested,
            // so combine revents across slots sharing an fd; every
            // matching entry then sees the union.
            let mut ready_fds: Vec<(RawFd, i16)> = Vec::new();
            for slot in 1..pollfds.len() {
                let (fd, revents) = (pollfds[slot].fd, pollfds[slot].revents);
                if revents == 0 {
                    continue;
                }
                if let Some(combined) = ready_fds.iter_mut().find(|c| c.0 == fd) {
                    combined.1 |= revents;
                } else {
                    ready_fds.push((fd, revents));
                }
            }

            for (fd, revents) in ready_fds {
                for entry in snapshot.iter().filter(|e| e.fd == fd) {
                    let delivered = revents & (entry.mask | FORCED_EVENTS);
                    if delivered != 0 {
                        entry.listener.process_file_events(fd, delivered, entry.cookie);
                    }
                }
            }
        }

        while let Some(item) = core.try_pop() {
            core.dispatch_item(item);
        }

        if core.is_stopping() {
            break;
        }
    }

    core.drain_without_dispatch();
    core.set_stopped();
    debug!("{}: selector stopped", core.name());
}

/// Rebuilds the pollfd array: the wake pipe first, then one slot per
/// listener entry.
fn fill_pollfds(
    name: &str,
    table: &mut ListenerTable,
    pipe_read: RawFd,
    fds: &mut Vec<libc::pollfd>,
) {
    if table.entries.len() + 1 > MAX_POLL_FDS {
        error!(
            "{}: {} ({} listeners, cap {})",
            name,
            DispatchError::Overflow,
            table.entries.len(),
            MAX_POLL_FDS
        );
        process::abort();
    }

    fds.clear();
    fds.push(libc::pollfd {
        fd: pipe_read,
        events: libc::POLLIN,
        revents: 0,
    });
    for entry in &table.entries {
        fds.push(libc::pollfd {
            fd: entry.fd,
            events: entry.mask,
            revents: 0,
        });
    }
    table.update_needed = false;
}
