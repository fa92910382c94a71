//! The work queue shared by every dispatch loop.
//!
//! A [`DispatchCore`] holds the FIFO, the lifecycle state and the
//! identity of the owned thread. [`Dispatcher`](super::Dispatcher) and
//! [`Selector`](crate::selector::Selector) both embed one; only the
//! thread body differs. Any thread may enqueue under the queue lock;
//! only the owned thread dequeues.

use crate::error::DispatchError;
use crate::event::{receiver_key, EventId, EventRef, ReceiverKey, ReceiverRef};
use crate::sys::Waker;

use log::trace;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, ThreadId};

/// One-shot completion signal a `send` caller blocks on.
///
/// `signal` and `wait` pair a mutex with a condition variable, so the
/// caller observes everything the handler wrote before `send` returns.
pub(crate) struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Completion {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn signal(&self) {
        *self.done.lock().unwrap() = true;
        self.cond.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cond.wait(done).unwrap();
        }
    }
}

/// Lifecycle of a dispatch loop. Transitions are monotone:
/// Created -> Running -> Stopping -> Stopped.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum State {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// A queued unit of work: the event, the receiver it is bound to, and
/// the completion signal when the producer is blocked in `send`.
///
/// Control events carry no target.
pub(crate) struct WorkItem {
    pub(crate) event: EventRef,
    pub(crate) target: Option<ReceiverRef>,
    pub(crate) done: Option<Arc<Completion>>,
}

impl WorkItem {
    fn matches_receiver(&self, key: ReceiverKey) -> bool {
        if let Some(target) = &self.target {
            if receiver_key(target) == key {
                return true;
            }
        }
        self.event.receiver_key() == Some(key)
    }
}

struct Inner {
    queue: VecDeque<WorkItem>,
    state: State,
    /// Event currently being dispatched, if any. Never in `queue`, so
    /// removal calls cannot touch it.
    current: Option<EventId>,
}

/// State shared between a dispatcher's public handle and its owned
/// thread.
pub(crate) struct DispatchCore {
    name: String,
    inner: Mutex<Inner>,
    /// Signaled when the queue becomes non-empty or the state changes.
    wakeup: Condvar,
    /// Set once by the owned thread before it enters its loop.
    thread_id: OnceLock<ThreadId>,
    /// Interrupts a blocking poll when work arrives (selectors only).
    waker: Option<Waker>,
}

impl DispatchCore {
    pub(crate) fn new(name: &str, waker: Option<Waker>) -> Self {
        DispatchCore {
            name: name.to_string(),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                state: State::Created,
                current: None,
            }),
            wakeup: Condvar::new(),
            thread_id: OnceLock::new(),
            waker,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Claims the calling thread as the owner and enters Running.
    /// First thing a dispatch loop does.
    pub(crate) fn register_thread(&self) {
        let _ = self.thread_id.set(thread::current().id());
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Created {
            inner.state = State::Running;
        }
        self.wakeup.notify_all();
    }

    /// Blocks until the owned thread has entered its loop. Called by
    /// constructors so a freshly built dispatcher is already routable.
    pub(crate) fn wait_running(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.state == State::Created {
            inner = self.wakeup.wait(inner).unwrap();
        }
    }

    pub(crate) fn is_dispatcher_thread(&self) -> bool {
        self.thread_id.get().copied() == Some(thread::current().id())
    }

    pub(crate) fn is_stopping(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state == State::Stopping || inner.state == State::Stopped
    }

    /// Enqueues a work item, failing with `Unroutable` once the loop is
    /// on its way down.
    pub(crate) fn enqueue(&self, item: WorkItem) -> Result<(), DispatchError> {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                State::Stopping | State::Stopped => return Err(DispatchError::Unroutable),
                State::Created | State::Running => inner.queue.push_back(item),
            }
            self.wakeup.notify_one();
        }
        if let Some(waker) = &self.waker {
            waker.wake();
        }
        Ok(())
    }

    /// Blocking dequeue for the plain dispatch loop. Returns `None`
    /// once the loop should exit.
    pub(crate) fn wait_for_work(&self) -> Option<WorkItem> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.state {
                State::Stopping | State::Stopped => return None,
                State::Created | State::Running => {}
            }
            if let Some(item) = inner.queue.pop_front() {
                inner.current = Some(item.event.id());
                return Some(item);
            }
            inner = self.wakeup.wait(inner).unwrap();
        }
    }

    /// Non-blocking dequeue for the selector's drain pass.
    pub(crate) fn try_pop(&self) -> Option<WorkItem> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Stopping | State::Stopped => return None,
            State::Created | State::Running => {}
        }
        let item = inner.queue.pop_front()?;
        inner.current = Some(item.event.id());
        Some(item)
    }

    /// Dispatches one dequeued item on the owned thread.
    ///
    /// The completion signal and the event release ride a guard, so
    /// they happen even when the handler unwinds.
    pub(crate) fn dispatch_item(&self, item: WorkItem) {
        let guard = DispatchGuard {
            core: self,
            done: item.done,
        };
        if item.event.id() == EventId::SHUTDOWN {
            self.set_stopping();
        } else if let Some(target) = &item.target {
            target.receive_event(&item.event);
        }
        drop(guard);
    }

    /// Releases everything still queued without invoking handlers.
    /// Blocked senders are unblocked; their events never ran.
    pub(crate) fn drain_without_dispatch(&self) {
        let drained: Vec<WorkItem> = {
            let mut inner = self.inner.lock().unwrap();
            inner.queue.drain(..).collect()
        };
        for item in drained {
            if let Some(done) = &item.done {
                done.signal();
            }
        }
    }

    pub(crate) fn set_stopping(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == State::Created || inner.state == State::Running {
                inner.state = State::Stopping;
            }
            self.wakeup.notify_all();
        }
        if let Some(waker) = &self.waker {
            waker.wake();
        }
    }

    pub(crate) fn set_stopped(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = State::Stopped;
        self.wakeup.notify_all();
    }

    /// Removes pending events by id and optionally by target.
    /// `EventId::INVALID` matches every id; an absent target matches
    /// any. The in-flight event is not in the queue and is unaffected.
    pub(crate) fn remove_events(
        &self,
        id: EventId,
        target: Option<&ReceiverRef>,
    ) -> Result<(), DispatchError> {
        let target_key = target.map(receiver_key);
        self.remove_where(|item| {
            let id_match = id == EventId::INVALID || item.event.id() == id;
            let target_match = match target_key {
                None => true,
                Some(key) => item
                    .target
                    .as_ref()
                    .is_some_and(|t| receiver_key(t) == key),
            };
            id_match && target_match
        })
    }

    /// Removes pending agent-style events bound for `receiver`.
    pub(crate) fn remove_by_receiver(&self, receiver: ReceiverKey) -> Result<(), DispatchError> {
        self.remove_where(|item| item.matches_receiver(receiver))
    }

    fn remove_where(
        &self,
        predicate: impl Fn(&WorkItem) -> bool,
    ) -> Result<(), DispatchError> {
        let removed: Vec<WorkItem> = {
            let mut inner = self.inner.lock().unwrap();
            let mut kept = VecDeque::with_capacity(inner.queue.len());
            let mut removed = Vec::new();
            for item in inner.queue.drain(..) {
                if predicate(&item) {
                    removed.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            inner.queue = kept;
            removed
        };

        if removed.is_empty() {
            return Err(DispatchError::NotFound);
        }
        // A sender blocked on a removed event must not hang forever.
        for item in &removed {
            if let Some(done) = &item.done {
                done.signal();
            }
        }
        Ok(())
    }
}

/// Runs the out-of-handler path for one dispatched item: signal the
/// completion, clear the in-flight marker. Dropping the guard does this
/// on panic unwinds too.
struct DispatchGuard<'a> {
    core: &'a DispatchCore,
    done: Option<Arc<Completion>>,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if let Some(done) = &self.done {
            done.signal();
        }
        let mut inner = self.core.inner.lock().unwrap();
        if let Some(id) = inner.current.take() {
            trace!("{}: dispatched event {:?}", self.core.name, id);
        }
    }
}
