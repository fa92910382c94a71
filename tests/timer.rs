use battuta::{
    receiver_key, DispatchError, Dispatcher, DispatcherRef, EventDispatcher, EventId, FnEvent,
    FnEventReceiver, Timer, TimerListener,
};

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(limit_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(limit_ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

struct TickListener {
    firings: Mutex<Vec<(Instant, usize)>>,
}

impl TickListener {
    fn new() -> Arc<TickListener> {
        Arc::new(TickListener {
            firings: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.firings.lock().unwrap().len()
    }
}

impl TimerListener for TickListener {
    fn on_timeout(&self, cookie: usize) {
        self.firings.lock().unwrap().push((Instant::now(), cookie));
    }
}

#[test]
fn test_one_shot_window() {
    init_logs();
    let timer = Timer::new(10, true).unwrap();
    let listener = TickListener::new();

    let start = Instant::now();
    timer.add_timer(listener.clone(), 55, 7).unwrap();
    thread::sleep(Duration::from_millis(130));

    let firings = listener.firings.lock().unwrap().clone();
    assert_eq!(firings.len(), 1, "one-shot must fire exactly once");
    let (at, cookie) = firings[0];
    assert_eq!(cookie, 7);
    let elapsed = at.duration_since(start);
    assert!(
        elapsed >= Duration::from_millis(50) && elapsed <= Duration::from_millis(90),
        "55 ms timer on a 10 ms tick fired after {:?}",
        elapsed
    );
}

#[test]
fn test_periodic_cancellation() {
    let timer = Timer::new(10, true).unwrap();
    let listener = TickListener::new();

    timer.add_periodic_timer(listener.clone(), 20, 0).unwrap();
    thread::sleep(Duration::from_millis(105));
    timer
        .remove_agents_by_receiver(receiver_key(&listener), None)
        .unwrap();

    let seen = listener.count();
    assert_eq!(
        seen, 5,
        "expected 5 firings in 105 ms at a 20 ms period, saw {}",
        seen
    );

    thread::sleep(Duration::from_millis(100));
    assert_eq!(
        listener.count(),
        seen,
        "a removed periodic timer must stay silent"
    );
}

#[test]
fn test_periodic_mean_frequency() {
    let timer = Timer::new(5, true).unwrap();
    let listener = TickListener::new();

    timer.add_periodic_timer(listener.clone(), 10, 0).unwrap();
    assert!(
        wait_until(3000, || listener.count() >= 101),
        "collecting 101 firings took too long"
    );
    timer
        .remove_agents_by_receiver(receiver_key(&listener), None)
        .unwrap();

    let firings = listener.firings.lock().unwrap().clone();
    let span = firings[100].0.duration_since(firings[0].0);
    let mean = span / 100;
    assert!(
        mean >= Duration::from_micros(7_500) && mean <= Duration::from_micros(12_500),
        "mean interval {:?} outside 10 ms +/- half a tick",
        mean
    );
}

#[test]
fn test_stop_destroys_pending_without_firing() {
    let timer = Timer::new(10, true).unwrap();
    let listener = TickListener::new();

    timer.add_timer(listener.clone(), 500, 0).unwrap();
    assert_eq!(timer.pending_count(), 1);
    timer.stop();
    assert_eq!(timer.pending_count(), 0, "stop must clear pending entries");

    thread::sleep(Duration::from_millis(50));
    assert_eq!(listener.count(), 0, "a stopped timer must not fire");
}

#[test]
fn test_unstoppable_timer_ignores_stop() {
    let timer = Timer::new(10, false).unwrap();
    let listener = TickListener::new();

    timer.add_timer(listener.clone(), 30, 1).unwrap();
    timer.stop();
    assert_eq!(
        timer.pending_count(),
        1,
        "stop on an unstoppable timer is a no-op"
    );

    assert!(wait_until(200, || listener.count() == 1));
}

#[test]
fn test_zero_tick_rejected() {
    assert!(
        matches!(Timer::new(0, true), Err(DispatchError::Invalid(_))),
        "a zero tick has no meaning"
    );
}

#[test]
fn test_restart_after_stop() {
    let timer = Timer::new(10, true).unwrap();
    timer.stop();
    timer.start();
    timer.start(); // no-op while running

    let listener = TickListener::new();
    timer.add_timer(listener.clone(), 20, 9).unwrap();
    assert!(wait_until(200, || listener.count() == 1));
    assert_eq!(listener.firings.lock().unwrap()[0].1, 9);
}

#[test]
fn test_reset_clears_pending() {
    let timer = Timer::new(10, true).unwrap();
    let listener = TickListener::new();

    timer.add_timer(listener.clone(), 40, 0).unwrap();
    timer.reset();
    assert_eq!(timer.pending_count(), 0);

    thread::sleep(Duration::from_millis(80));
    assert_eq!(listener.count(), 0, "reset must drop entries without firing");
}

#[test]
fn test_timed_event_posts_to_dispatcher() {
    let timer = Timer::new(10, true).unwrap();
    let dispatcher = Dispatcher::new("timer-sink");
    let receiver = Arc::new(FnEventReceiver);

    let fired = Arc::new(Mutex::new(false));
    let flag = fired.clone();
    let event = FnEvent::new(EventId(800), &receiver, move || {
        *flag.lock().unwrap() = true;
    });

    let dispatcher_ref: DispatcherRef = dispatcher.clone();
    timer
        .send_timed_event(event, receiver.clone(), dispatcher_ref, 30)
        .unwrap();

    assert!(
        wait_until(200, || *fired.lock().unwrap()),
        "the timed event must reach the dispatcher"
    );
    dispatcher.shutdown().unwrap();
}

#[test]
fn test_periodic_event_and_removal() {
    let timer = Timer::new(10, true).unwrap();
    let dispatcher = Dispatcher::new("periodic-sink");
    let receiver = Arc::new(FnEventReceiver);

    let count = Arc::new(Mutex::new(0u32));
    let counter = count.clone();
    let event = FnEvent::new(EventId(801), &receiver, move || {
        *counter.lock().unwrap() += 1;
    });

    let dispatcher_ref: DispatcherRef = dispatcher.clone();
    timer
        .send_periodic_event(event, receiver.clone(), dispatcher_ref.clone(), 20)
        .unwrap();

    assert!(wait_until(400, || *count.lock().unwrap() >= 3));
    timer
        .remove_timed_event(EventId(801), &dispatcher_ref)
        .unwrap();

    // Removal does not recall an event already posted to the
    // dispatcher, so allow one straggler.
    let seen = *count.lock().unwrap();
    thread::sleep(Duration::from_millis(100));
    let after = *count.lock().unwrap();
    assert!(
        after <= seen + 1,
        "periodic posting must stop after removal ({} -> {})",
        seen,
        after
    );
    dispatcher.shutdown().unwrap();
}

#[test]
fn test_remove_event_by_ref() {
    let timer = Timer::new(10, true).unwrap();
    let dispatcher = Dispatcher::new("remove-ref");
    let receiver = Arc::new(FnEventReceiver);

    let event = FnEvent::new(EventId(802), &receiver, || {});
    timer
        .send_timed_event(event.clone(), receiver.clone(), dispatcher.clone(), 200)
        .unwrap();
    assert_eq!(timer.pending_count(), 1);

    timer.remove_event(&event).unwrap();
    assert_eq!(timer.pending_count(), 0);
    assert!(
        matches!(timer.remove_event(&event), Err(DispatchError::NotFound)),
        "removing an absent event must report NotFound"
    );
    dispatcher.shutdown().unwrap();
}

#[test]
fn test_zero_period_rejected() {
    let timer = Timer::new(10, true).unwrap();
    let listener = TickListener::new();
    assert!(matches!(
        timer.add_periodic_timer(listener, 0, 0),
        Err(DispatchError::Invalid(_))
    ));
}
