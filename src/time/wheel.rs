//! Hashed timing wheel
//!
//! A ring of buckets advanced by a single tick thread. Insertion and
//! cancellation are O(1) regardless of how many timeouts are pending, at the
//! cost of coarse fire granularity (one tick). A task scheduled with delay
//! `d` fires no earlier than `d` milliseconds later; it may fire up to one
//! tick late.
//!
//! Exactly one wheel is expected per process; it is constructed by the
//! top-level server value and injected wherever scheduling is needed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::clock::Clock;

/// Delays below this are clamped up before scheduling
pub const MIN_TIMEOUT_MILLIS: u64 = 1;

/// Task fired by the wheel; receives its own handle so it can observe
/// cancellation and reschedule itself.
pub type TimerTask = Box<dyn FnOnce(Timeout) + Send + 'static>;

/// Handle to a scheduled task
#[derive(Clone)]
pub struct Timeout {
    state: Arc<TimeoutState>,
}

impl Timeout {
    /// Cancel the timeout. Returns `true` if it had neither fired nor been
    /// cancelled yet. Cancellation is race-safe against a concurrent fire:
    /// a task that observes `is_cancelled()` must return immediately.
    pub fn cancel(&self) -> bool {
        let was_cancelled = self.state.cancelled.swap(true, Ordering::AcqRel);
        // Drop the task eagerly so captured references are released.
        lock(&self.state.task).take();
        !was_cancelled && !self.state.expired.load(Ordering::Acquire)
    }

    /// Whether `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Whether the task has fired
    pub fn is_expired(&self) -> bool {
        self.state.expired.load(Ordering::Acquire)
    }
}

struct TimeoutState {
    /// Absolute deadline in clock millis
    deadline: u64,
    cancelled: AtomicBool,
    expired: AtomicBool,
    /// Remaining full wheel revolutions; owned by the tick thread after
    /// placement
    rounds: AtomicU64,
    task: Mutex<Option<TimerTask>>,
}

/// Hashed timing wheel with a dedicated tick thread
#[derive(Clone)]
pub struct TimingWheel {
    inner: Arc<WheelInner>,
}

struct WheelInner {
    clock: Clock,
    tick_millis: u64,
    mask: usize,
    buckets: Vec<Mutex<Vec<Arc<TimeoutState>>>>,
    /// Newly scheduled entries, placed into buckets by the tick thread
    pending: Mutex<Vec<Arc<TimeoutState>>>,
    shutdown: AtomicBool,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimingWheel {
    /// Create a wheel and start its tick thread.
    ///
    /// `slots` is rounded up to a power of two.
    pub fn new(clock: Clock, tick: Duration, slots: usize) -> Self {
        let tick_millis = (tick.as_millis() as u64).max(MIN_TIMEOUT_MILLIS);
        let slots = slots.max(2).next_power_of_two();
        let buckets = (0..slots).map(|_| Mutex::new(Vec::new())).collect();

        let inner = Arc::new(WheelInner {
            clock,
            tick_millis,
            mask: slots - 1,
            buckets,
            pending: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(None),
        });

        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("timing-wheel".into())
            .spawn(move || run_worker(worker_inner))
            .expect("failed to spawn timing-wheel thread");
        *lock(&inner.worker) = Some(handle);

        Self { inner }
    }

    /// Schedule `task` to fire no earlier than `delay` from now.
    ///
    /// Delays below [`MIN_TIMEOUT_MILLIS`] are clamped up.
    pub fn new_timeout(
        &self,
        task: impl FnOnce(Timeout) + Send + 'static,
        delay: Duration,
    ) -> Timeout {
        let delay_millis = (delay.as_millis() as u64).max(MIN_TIMEOUT_MILLIS);
        let state = Arc::new(TimeoutState {
            deadline: self.inner.clock.now_millis() + delay_millis,
            cancelled: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            rounds: AtomicU64::new(0),
            task: Mutex::new(Some(Box::new(task))),
        });

        lock(&self.inner.pending).push(Arc::clone(&state));
        Timeout { state }
    }

    /// Stop the tick thread. Pending timeouts never fire after this.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        if let Some(handle) = lock(&self.inner.worker).take() {
            let _ = handle.join();
        }
    }

    /// Number of milliseconds per tick
    pub fn tick_millis(&self) -> u64 {
        self.inner.tick_millis
    }
}

fn run_worker(inner: Arc<WheelInner>) {
    let mut tick: u64 = 0;

    while !inner.shutdown.load(Ordering::Acquire) {
        tick += 1;
        let tick_deadline = tick * inner.tick_millis;

        // Sleep in short slices so shutdown stays responsive.
        loop {
            if inner.shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = inner.clock.now_millis();
            if now >= tick_deadline {
                break;
            }
            thread::sleep(Duration::from_millis(
                (tick_deadline - now).min(inner.tick_millis),
            ));
        }

        place_pending(&inner, tick);
        fire_bucket(&inner, tick);
    }
}

/// Move newly scheduled entries into their buckets. Only the tick thread
/// touches bucket placement, so the computation needs no synchronization
/// beyond the bucket locks themselves.
fn place_pending(inner: &WheelInner, tick: u64) {
    let pending = std::mem::take(&mut *lock(&inner.pending));
    for state in pending {
        if state.cancelled.load(Ordering::Acquire) {
            continue;
        }
        let target = state
            .deadline
            .div_ceil(inner.tick_millis)
            .max(tick); // never place behind the cursor
        let steps = target - tick;
        let rounds = steps as usize / inner.buckets.len();
        state.rounds.store(rounds as u64, Ordering::Relaxed);
        let slot = (target as usize) & inner.mask;
        lock(&inner.buckets[slot]).push(state);
    }
}

fn fire_bucket(inner: &WheelInner, tick: u64) {
    let slot = (tick as usize) & inner.mask;
    let mut expired = Vec::new();
    {
        let mut bucket = lock(&inner.buckets[slot]);
        bucket.retain(|state| {
            if state.cancelled.load(Ordering::Acquire) {
                return false;
            }
            let rounds = state.rounds.load(Ordering::Relaxed);
            if rounds > 0 {
                state.rounds.store(rounds - 1, Ordering::Relaxed);
                return true;
            }
            expired.push(Arc::clone(state));
            false
        });
    }

    // Fire outside the bucket lock: tasks may schedule new timeouts.
    for state in expired {
        if state.cancelled.load(Ordering::Acquire) {
            continue;
        }
        state.expired.store(true, Ordering::Release);
        let task = lock(&state.task).take();
        if let Some(task) = task {
            let timeout = Timeout { state };
            if panic::catch_unwind(AssertUnwindSafe(|| task(timeout))).is_err() {
                tracing::error!("timer task panicked");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn test_wheel() -> (Clock, TimingWheel) {
        let clock = Clock::new();
        (clock, TimingWheel::new(clock, Duration::from_millis(10), 32))
    }

    #[test]
    fn test_fires_no_earlier_than_delay() {
        let (clock, wheel) = test_wheel();
        let (tx, rx) = mpsc::channel();

        let scheduled_at = clock.now_millis();
        wheel.new_timeout(
            move |_| {
                let _ = tx.send(clock.now_millis());
            },
            Duration::from_millis(50),
        );

        let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired_at >= scheduled_at + 50);
        wheel.shutdown();
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let (_, wheel) = test_wheel();
        let (tx, rx) = mpsc::channel::<()>();

        let timeout = wheel.new_timeout(
            move |_| {
                let _ = tx.send(());
            },
            Duration::from_millis(30),
        );

        assert!(timeout.cancel());
        assert!(timeout.is_cancelled());
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        wheel.shutdown();
    }

    #[test]
    fn test_cancel_after_fire_returns_false() {
        let (_, wheel) = test_wheel();
        let (tx, rx) = mpsc::channel();

        let timeout = wheel.new_timeout(
            move |t| {
                let _ = tx.send(t);
            },
            Duration::from_millis(20),
        );

        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.is_expired());
        assert!(!timeout.cancel());
        wheel.shutdown();
    }

    #[test]
    fn test_zero_delay_clamped_to_minimum() {
        let (_, wheel) = test_wheel();
        let (tx, rx) = mpsc::channel::<()>();

        wheel.new_timeout(
            move |_| {
                let _ = tx.send(());
            },
            Duration::ZERO,
        );

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        wheel.shutdown();
    }

    #[test]
    fn test_delay_beyond_one_revolution() {
        // 32 slots x 10ms tick = 320ms per revolution; 500ms needs a second
        // pass over the same bucket.
        let (clock, wheel) = test_wheel();
        let (tx, rx) = mpsc::channel();

        let scheduled_at = clock.now_millis();
        wheel.new_timeout(
            move |_| {
                let _ = tx.send(clock.now_millis());
            },
            Duration::from_millis(500),
        );

        let fired_at = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(fired_at >= scheduled_at + 500);
        wheel.shutdown();
    }

    #[test]
    fn test_many_timeouts_all_fire() {
        let (_, wheel) = test_wheel();
        let (tx, rx) = mpsc::channel();

        for i in 0..100u32 {
            let tx = tx.clone();
            wheel.new_timeout(
                move |_| {
                    let _ = tx.send(i);
                },
                Duration::from_millis(10 + (i as u64 % 7) * 13),
            );
        }
        drop(tx);

        let mut seen: Vec<u32> = rx.iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        wheel.shutdown();
    }

    #[test]
    fn test_task_can_reschedule_itself() {
        let (_, wheel) = test_wheel();
        let (tx, rx) = mpsc::channel();

        fn schedule(wheel: &TimingWheel, tx: mpsc::Sender<u32>, remaining: u32) {
            let wheel_handle = wheel.clone();
            wheel.new_timeout(
                move |_| {
                    let _ = tx.send(remaining);
                    if remaining > 0 {
                        schedule(&wheel_handle, tx, remaining - 1);
                    }
                },
                Duration::from_millis(15),
            );
        }

        schedule(&wheel, tx, 3);
        let seen: Vec<u32> = rx.iter().take(4).collect();
        assert_eq!(seen, vec![3, 2, 1, 0]);
        wheel.shutdown();
    }

    #[test]
    fn test_shutdown_stops_firing() {
        let (_, wheel) = test_wheel();
        let (tx, rx) = mpsc::channel::<()>();

        wheel.new_timeout(
            move |_| {
                let _ = tx.send(());
            },
            Duration::from_millis(200),
        );

        wheel.shutdown();
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }
}
