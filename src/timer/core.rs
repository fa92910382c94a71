use super::TimerListener;
use crate::dispatch::DispatcherRef;
use crate::error::DispatchError;
use crate::event::{receiver_key, EventId, EventRef, ReceiverKey, ReceiverRef};

use log::{debug, warn};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Tick-driven scheduler.
///
/// A timer owns a thread that wakes every `tick_ms` milliseconds,
/// advancing a tick counter against absolute deadlines on the monotonic
/// clock so the rate does not drift. Due entries either post an event
/// to a dispatcher or invoke a [`TimerListener`] directly on the timer
/// thread. Every client of one timer shares its tick resolution.
///
/// The thread starts in the constructor. Dropping the last handle stops
/// it even when the timer is not `stoppable`.
pub struct Timer {
    inner: Arc<TimerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct TimerInner {
    tick_ms: u64,
    stoppable: bool,
    state: Mutex<TimerState>,
    cond: Condvar,
}

struct TimerState {
    running: bool,
    stopping: bool,
    /// Ticks seen since the epoch; reset with the entry list.
    ticks: u64,
    epoch: Instant,
    entries: Vec<TimerNode>,
}

/// One pending deadline.
struct TimerNode {
    payload: TimerPayload,
    /// Tick that fires this node.
    fire_tick: u64,
    /// Repeat period in ms, or 0 for one-shot.
    repeat_ms: u64,
    /// Sub-tick remainder carried between repeats so the long-term
    /// rate equals 1/repeat_ms even when the period is not a multiple
    /// of the tick.
    carry_ms: i64,
}

#[derive(Clone)]
enum TimerPayload {
    Event {
        event: EventRef,
        target: ReceiverRef,
        dispatcher: DispatcherRef,
    },
    Listener {
        listener: Arc<dyn TimerListener>,
        cookie: usize,
    },
}

impl TimerNode {
    /// Advances a repeating node past `fire_tick`, folding the sub-tick
    /// remainder into the next interval.
    fn advance(&mut self, tick_ms: u64) {
        let total = self.repeat_ms as i64 + self.carry_ms;
        let advance = ticks_ceil(total, tick_ms);
        if advance == 0 {
            // Period shorter than a tick: resolution-bound, fire every
            // tick.
            self.fire_tick += 1;
            self.carry_ms = 0;
        } else {
            self.fire_tick += advance;
            self.carry_ms = total - advance as i64 * tick_ms as i64;
        }
    }
}

/// Ticks needed to cover `ms`, rounding up. Non-positive spans need no
/// ticks.
fn ticks_ceil(ms: i64, tick_ms: u64) -> u64 {
    if ms <= 0 {
        return 0;
    }
    ((ms as u64) + tick_ms - 1) / tick_ms
}

impl Timer {
    /// Creates a timer with the given tick resolution and starts its
    /// thread.
    ///
    /// When `stoppable` is false, [`stop`](Timer::stop) is a no-op; use
    /// that for process-lifetime timers shared by many clients.
    pub fn new(tick_ms: u64, stoppable: bool) -> Result<Arc<Timer>, DispatchError> {
        if tick_ms == 0 {
            return Err(DispatchError::Invalid("tick must be non-zero"));
        }

        let timer = Arc::new(Timer {
            inner: Arc::new(TimerInner {
                tick_ms,
                stoppable,
                state: Mutex::new(TimerState {
                    running: false,
                    stopping: false,
                    ticks: 0,
                    epoch: Instant::now(),
                    entries: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
            thread: Mutex::new(None),
        });
        timer.start();
        Ok(timer)
    }

    /// Tick resolution in milliseconds.
    pub fn tick_time_ms(&self) -> u64 {
        self.inner.tick_ms
    }

    /// Starts the tick thread. No-op when already running.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.running {
                return;
            }
            state.running = true;
            state.stopping = false;
            state.ticks = 0;
            state.epoch = Instant::now();
        }

        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || tick_loop(inner))
            .expect("failed to spawn timer thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Stops the tick thread and destroys every pending entry without
    /// firing it. No-op unless the timer is `stoppable`.
    pub fn stop(&self) {
        if !self.inner.stoppable {
            return;
        }
        self.force_stop();
    }

    /// Clears all pending entries and zeroes the tick counter; the
    /// thread keeps running.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.entries.clear();
        state.ticks = 0;
        state.epoch = Instant::now();
        self.inner.cond.notify_all();
    }

    /// Number of pending entries. Diagnostic aid.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }

    /// Posts `event` to `target` via `dispatcher` after `delay_ms`.
    ///
    /// The node holds a reference on the event until it fires or is
    /// removed. Precision is bounded by the tick resolution.
    pub fn send_timed_event(
        &self,
        event: EventRef,
        target: ReceiverRef,
        dispatcher: DispatcherRef,
        delay_ms: u64,
    ) -> Result<(), DispatchError> {
        self.schedule(
            TimerPayload::Event {
                event,
                target,
                dispatcher,
            },
            delay_ms,
            0,
        )
    }

    /// Posts `event` to `target` via `dispatcher` every `period_ms`.
    pub fn send_periodic_event(
        &self,
        event: EventRef,
        target: ReceiverRef,
        dispatcher: DispatcherRef,
        period_ms: u64,
    ) -> Result<(), DispatchError> {
        if period_ms == 0 {
            return Err(DispatchError::Invalid("period must be non-zero"));
        }
        self.schedule(
            TimerPayload::Event {
                event,
                target,
                dispatcher,
            },
            period_ms,
            period_ms,
        )
    }

    /// Calls `listener` once after `delay_ms`, on the timer's thread.
    pub fn add_timer(
        &self,
        listener: Arc<dyn TimerListener>,
        delay_ms: u64,
        cookie: usize,
    ) -> Result<(), DispatchError> {
        self.schedule(TimerPayload::Listener { listener, cookie }, delay_ms, 0)
    }

    /// Calls `listener` every `period_ms`, on the timer's thread.
    pub fn add_periodic_timer(
        &self,
        listener: Arc<dyn TimerListener>,
        period_ms: u64,
        cookie: usize,
    ) -> Result<(), DispatchError> {
        if period_ms == 0 {
            return Err(DispatchError::Invalid("period must be non-zero"));
        }
        self.schedule(
            TimerPayload::Listener { listener, cookie },
            period_ms,
            period_ms,
        )
    }

    /// Removes pending event nodes matching `id` (or every id, for
    /// [`EventId::INVALID`]) bound for `dispatcher`.
    ///
    /// An event already posted to the dispatcher is not recalled;
    /// callers needing that also call the dispatcher's `remove_events`.
    pub fn remove_timed_event(
        &self,
        id: EventId,
        dispatcher: &DispatcherRef,
    ) -> Result<(), DispatchError> {
        let dkey = receiver_key(dispatcher);
        self.remove_where(|node| match &node.payload {
            TimerPayload::Event {
                event, dispatcher, ..
            } => {
                (id == EventId::INVALID || event.id() == id)
                    && receiver_key(dispatcher) == dkey
            }
            TimerPayload::Listener { .. } => false,
        })
    }

    /// Removes pending nodes for this exact event, whatever the
    /// dispatcher.
    pub fn remove_event(&self, event: &EventRef) -> Result<(), DispatchError> {
        let ekey = receiver_key(event);
        self.remove_where(|node| match &node.payload {
            TimerPayload::Event { event, .. } => receiver_key(event) == ekey,
            TimerPayload::Listener { .. } => false,
        })
    }

    /// Removes pending nodes whose ultimate receiver is `receiver`:
    /// listener nodes by listener identity, event nodes by target
    /// identity or the event's own receiver key, optionally narrowed to
    /// one dispatcher.
    pub fn remove_agents_by_receiver(
        &self,
        receiver: ReceiverKey,
        dispatcher: Option<&DispatcherRef>,
    ) -> Result<(), DispatchError> {
        let dkey = dispatcher.map(receiver_key);
        self.remove_where(|node| match &node.payload {
            TimerPayload::Listener { listener, .. } => {
                dkey.is_none() && receiver_key(listener) == receiver
            }
            TimerPayload::Event {
                event,
                target,
                dispatcher,
            } => {
                let dispatcher_match = dkey.map_or(true, |k| receiver_key(dispatcher) == k);
                dispatcher_match
                    && (receiver_key(target) == receiver
                        || event.receiver_key() == Some(receiver))
            }
        })
    }

    fn schedule(
        &self,
        payload: TimerPayload,
        delay_ms: u64,
        repeat_ms: u64,
    ) -> Result<(), DispatchError> {
        let mut state = self.inner.state.lock().unwrap();
        let fire_tick = state.ticks + ticks_ceil(delay_ms as i64, self.inner.tick_ms);
        state.entries.push(TimerNode {
            payload,
            fire_tick,
            repeat_ms,
            carry_ms: 0,
        });
        Ok(())
    }

    fn remove_where(
        &self,
        predicate: impl Fn(&TimerNode) -> bool,
    ) -> Result<(), DispatchError> {
        let mut state = self.inner.state.lock().unwrap();
        let before = state.entries.len();
        state.entries.retain(|node| !predicate(node));
        if state.entries.len() == before {
            return Err(DispatchError::NotFound);
        }
        Ok(())
    }

    fn force_stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.running {
                return;
            }
            state.stopping = true;
            self.inner.cond.notify_all();
        }

        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("timer: tick thread panicked");
            }
        }

        let mut state = self.inner.state.lock().unwrap();
        state.entries.clear();
        state.ticks = 0;
        state.running = false;
        state.stopping = false;
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.force_stop();
    }
}

/// The tick loop. Sleeps to the next absolute deadline, advances the
/// counter, splits off due nodes under the lock and fires them outside
/// it. Repeating nodes are re-enqueued before their callbacks run, so
/// concurrent removal still finds them.
fn tick_loop(inner: Arc<TimerInner>) {
    debug!("timer: tick thread running ({} ms tick)", inner.tick_ms);

    let mut state = inner.state.lock().unwrap();
    'ticks: loop {
        loop {
            if state.stopping {
                break 'ticks;
            }
            // Recomputed every pass: reset() moves the epoch under us.
            let deadline =
                state.epoch + Duration::from_millis(inner.tick_ms * (state.ticks + 1));
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = inner.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }

        state.ticks += 1;
        let now_tick = state.ticks;

        let mut due: Vec<TimerPayload> = Vec::new();
        let mut repeats: Vec<TimerNode> = Vec::new();
        let mut i = 0;
        while i < state.entries.len() {
            if state.entries[i].fire_tick <= now_tick {
                let mut node = state.entries.remove(i);
                due.push(node.payload.clone());
                if node.repeat_ms > 0 {
                    node.advance(inner.tick_ms);
                    repeats.push(node);
                }
            } else {
                i += 1;
            }
        }
        state.entries.extend(repeats);

        if due.is_empty() {
            continue;
        }

        drop(state);
        for payload in due {
            match payload {
                TimerPayload::Event {
                    event,
                    target,
                    dispatcher,
                } => {
                    if let Err(err) = dispatcher.post(event, target) {
                        debug!("timer: dropping timed event: {}", err);
                    }
                }
                TimerPayload::Listener { listener, cookie } => {
                    listener.on_timeout(cookie);
                }
            }
        }
        state = inner.state.lock().unwrap();
    }

    drop(state);
    debug!("timer: tick thread stopped");
}
