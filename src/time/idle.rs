//! Idle-state detection on the shared timing wheel
//!
//! Each connection carries an [`IdleStateChecker`] parameterised by reader,
//! writer and all-idle limits (zero disables a variant). The checker keeps a
//! sliding deadline: every fired task re-checks the last activity timestamp
//! and either reschedules itself for the remaining delay or emits an idle
//! event and re-arms for the full limit. This avoids spurious fires while
//! never letting the interval drift later than the limit after the last
//! activity.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use crate::error::Result;
use crate::transport::channel::Channel;

use super::clock::Clock;
use super::wheel::{Timeout, TimingWheel, MIN_TIMEOUT_MILLIS};

const STATE_NONE: u8 = 0;
const STATE_INITIALIZED: u8 = 1;
const STATE_DESTROYED: u8 = 2;

/// Idle event kinds
///
/// The first occurrence after activity carries the `First*` variant;
/// repeats while the connection stays idle carry the plain variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    FirstReaderIdle,
    ReaderIdle,
    FirstWriterIdle,
    WriterIdle,
    FirstAllIdle,
    AllIdle,
}

impl IdleEvent {
    /// Whether this is the first event since the last matching activity
    pub fn is_first(self) -> bool {
        matches!(
            self,
            IdleEvent::FirstReaderIdle | IdleEvent::FirstWriterIdle | IdleEvent::FirstAllIdle
        )
    }

    /// Whether this is a reader-idle event (first or repeating)
    pub fn is_reader_idle(self) -> bool {
        matches!(self, IdleEvent::FirstReaderIdle | IdleEvent::ReaderIdle)
    }
}

/// Receiver of idle events for one connection
pub trait IdleListener: Send + Sync + 'static {
    /// Called from the wheel's tick thread when a connection goes idle.
    ///
    /// Failures are logged against the connection; the timer keeps running.
    fn on_idle(&self, channel: &Arc<Channel>, event: IdleEvent) -> Result<()>;
}

/// Per-connection idle detector scheduled on the shared wheel
#[derive(Clone)]
pub struct IdleStateChecker {
    shared: Arc<IdleShared>,
}

struct IdleShared {
    wheel: TimingWheel,
    clock: Clock,
    channel: Weak<Channel>,
    listener: Arc<dyn IdleListener>,

    reader_idle_millis: u64,
    writer_idle_millis: u64,
    all_idle_millis: u64,

    state: AtomicU8,
    last_read: AtomicU64,
    last_write: AtomicU64,
    first_reader_idle: AtomicBool,
    first_writer_idle: AtomicBool,
    first_all_idle: AtomicBool,

    reader_timeout: Mutex<Option<Timeout>>,
    writer_timeout: Mutex<Option<Timeout>>,
    all_timeout: Mutex<Option<Timeout>>,
}

impl IdleStateChecker {
    /// Create a checker for `channel`. Durations of zero disable the
    /// corresponding variant; non-zero durations are clamped to at least
    /// one millisecond.
    pub fn new(
        wheel: TimingWheel,
        clock: Clock,
        channel: &Arc<Channel>,
        listener: Arc<dyn IdleListener>,
        reader_idle: Duration,
        writer_idle: Duration,
        all_idle: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(IdleShared {
                wheel,
                clock,
                channel: Arc::downgrade(channel),
                listener,
                reader_idle_millis: clamp_idle(reader_idle),
                writer_idle_millis: clamp_idle(writer_idle),
                all_idle_millis: clamp_idle(all_idle),
                state: AtomicU8::new(STATE_NONE),
                last_read: AtomicU64::new(0),
                last_write: AtomicU64::new(0),
                first_reader_idle: AtomicBool::new(true),
                first_writer_idle: AtomicBool::new(true),
                first_all_idle: AtomicBool::new(true),
                reader_timeout: Mutex::new(None),
                writer_timeout: Mutex::new(None),
                all_timeout: Mutex::new(None),
            }),
        }
    }

    /// Arm the timers. Runs at most once per connection; later calls and
    /// calls after [`destroy`](Self::destroy) are no-ops.
    pub fn initialize(&self) {
        let shared = &self.shared;
        if shared
            .state
            .compare_exchange(
                STATE_NONE,
                STATE_INITIALIZED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let now = shared.clock.now_millis();
        shared.last_read.store(now, Ordering::Release);
        shared.last_write.store(now, Ordering::Release);

        if shared.reader_idle_millis > 0 {
            schedule(shared, Variant::Reader, shared.reader_idle_millis);
        }
        if shared.writer_idle_millis > 0 {
            schedule(shared, Variant::Writer, shared.writer_idle_millis);
        }
        if shared.all_idle_millis > 0 {
            schedule(shared, Variant::All, shared.all_idle_millis);
        }
    }

    /// Record a successful inbound read
    pub fn on_read(&self) {
        let shared = &self.shared;
        shared.first_reader_idle.store(true, Ordering::Release);
        shared.first_all_idle.store(true, Ordering::Release);
        shared
            .last_read
            .store(shared.clock.now_millis(), Ordering::Release);
    }

    /// Record a completed outbound write (the bytes actually reached the
    /// socket, not merely got queued)
    pub fn on_write(&self) {
        let shared = &self.shared;
        shared.first_writer_idle.store(true, Ordering::Release);
        shared.first_all_idle.store(true, Ordering::Release);
        shared
            .last_write
            .store(shared.clock.now_millis(), Ordering::Release);
    }

    /// Cancel all timers. Idempotent.
    pub fn destroy(&self) {
        let shared = &self.shared;
        shared.state.store(STATE_DESTROYED, Ordering::Release);

        for slot in [
            &shared.reader_timeout,
            &shared.writer_timeout,
            &shared.all_timeout,
        ] {
            if let Some(timeout) = lock(slot).take() {
                timeout.cancel();
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Variant {
    Reader,
    Writer,
    All,
}

fn clamp_idle(idle: Duration) -> u64 {
    let millis = idle.as_millis() as u64;
    if millis == 0 {
        0
    } else {
        millis.max(MIN_TIMEOUT_MILLIS)
    }
}

fn schedule(shared: &Arc<IdleShared>, variant: Variant, delay_millis: u64) {
    let task_shared = Arc::clone(shared);
    let timeout = shared.wheel.new_timeout(
        move |timeout| run_idle_task(task_shared, variant, timeout),
        Duration::from_millis(delay_millis),
    );

    let slot = match variant {
        Variant::Reader => &shared.reader_timeout,
        Variant::Writer => &shared.writer_timeout,
        Variant::All => &shared.all_timeout,
    };
    *lock(slot) = Some(timeout);
}

fn run_idle_task(shared: Arc<IdleShared>, variant: Variant, timeout: Timeout) {
    if timeout.is_cancelled() {
        return;
    }
    if shared.state.load(Ordering::Acquire) == STATE_DESTROYED {
        return;
    }
    let Some(channel) = shared.channel.upgrade() else {
        return;
    };
    if !channel.is_active() {
        return;
    }

    let idle_millis = match variant {
        Variant::Reader => shared.reader_idle_millis,
        Variant::Writer => shared.writer_idle_millis,
        Variant::All => shared.all_idle_millis,
    };
    let last_activity = match variant {
        Variant::Reader => shared.last_read.load(Ordering::Acquire),
        Variant::Writer => shared.last_write.load(Ordering::Acquire),
        Variant::All => shared
            .last_read
            .load(Ordering::Acquire)
            .max(shared.last_write.load(Ordering::Acquire)),
    };

    let now = shared.clock.now_millis();
    let elapsed = now.saturating_sub(last_activity);

    if elapsed < idle_millis {
        // Activity happened inside the window; come back when it runs out.
        schedule(&shared, variant, idle_millis - elapsed);
        return;
    }

    // Idle: re-arm for the full limit, then emit.
    schedule(&shared, variant, idle_millis);

    let event = match variant {
        Variant::Reader => {
            if shared.first_reader_idle.swap(false, Ordering::AcqRel) {
                IdleEvent::FirstReaderIdle
            } else {
                IdleEvent::ReaderIdle
            }
        }
        Variant::Writer => {
            if shared.first_writer_idle.swap(false, Ordering::AcqRel) {
                IdleEvent::FirstWriterIdle
            } else {
                IdleEvent::WriterIdle
            }
        }
        Variant::All => {
            if shared.first_all_idle.swap(false, Ordering::AcqRel) {
                IdleEvent::FirstAllIdle
            } else {
                IdleEvent::AllIdle
            }
        }
    };

    if let Err(e) = shared.listener.on_idle(&channel, event) {
        tracing::error!(
            channel = channel.id(),
            error = %e,
            "idle listener failed"
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Mutex as StdMutex;

    use super::*;

    struct Recorder {
        tx: StdMutex<mpsc::Sender<(IdleEvent, u64)>>,
        clock: Clock,
    }

    impl IdleListener for Recorder {
        fn on_idle(&self, _channel: &Arc<Channel>, event: IdleEvent) -> Result<()> {
            let _ = lock(&self.tx).send((event, self.clock.now_millis()));
            Ok(())
        }
    }

    fn checker_with(
        reader_idle: Duration,
    ) -> (
        Arc<Channel>,
        IdleStateChecker,
        mpsc::Receiver<(IdleEvent, u64)>,
        TimingWheel,
        u64,
    ) {
        let clock = Clock::new();
        let wheel = TimingWheel::new(clock, Duration::from_millis(5), 64);
        let (channel, _egress) = Channel::new(1, None);
        let (tx, rx) = mpsc::channel();
        let listener = Arc::new(Recorder {
            tx: StdMutex::new(tx),
            clock,
        });
        let checker = IdleStateChecker::new(
            wheel.clone(),
            clock,
            &channel,
            listener,
            reader_idle,
            Duration::ZERO,
            Duration::ZERO,
        );
        let started_at = clock.now_millis();
        checker.initialize();
        (channel, checker, rx, wheel, started_at)
    }

    #[test]
    fn test_first_then_repeating_reader_idle() {
        let (_channel, checker, rx, wheel, started_at) =
            checker_with(Duration::from_millis(60));

        let (first, first_at) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, IdleEvent::FirstReaderIdle);
        assert!(first_at >= started_at + 60);

        let (second, second_at) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(second, IdleEvent::ReaderIdle);
        assert!(second_at >= started_at + 120);

        checker.destroy();
        wheel.shutdown();
    }

    #[test]
    fn test_read_resets_first_flag_and_deadline() {
        let (_channel, checker, rx, wheel, _) = checker_with(Duration::from_millis(80));

        // Stay busy for a while: no event may fire.
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(30));
            checker.on_read();
        }
        assert!(rx.try_recv().is_err());

        // Go quiet: the next event is FIRST again.
        let (event, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, IdleEvent::FirstReaderIdle);

        checker.destroy();
        wheel.shutdown();
    }

    #[test]
    fn test_destroy_cancels_timers() {
        let (_channel, checker, rx, wheel, _) = checker_with(Duration::from_millis(50));

        checker.destroy();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        // destroy is idempotent
        checker.destroy();
        wheel.shutdown();
    }

    #[test]
    fn test_initialize_runs_once() {
        let (_channel, checker, rx, wheel, _) = checker_with(Duration::from_millis(50));

        // A second initialize must not arm a duplicate timer.
        checker.initialize();

        let (event, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, IdleEvent::FirstReaderIdle);
        // No duplicate event within a fraction of the idle window.
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());

        checker.destroy();
        wheel.shutdown();
    }

    #[test]
    fn test_closed_channel_stops_events() {
        let (channel, checker, rx, wheel, _) = checker_with(Duration::from_millis(40));

        channel.close();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        checker.destroy();
        wheel.shutdown();
    }

    #[test]
    fn test_disabled_variants_never_fire() {
        let clock = Clock::new();
        let wheel = TimingWheel::new(clock, Duration::from_millis(5), 64);
        let (channel, _egress) = Channel::new(7, None);
        let (tx, rx) = mpsc::channel();
        let listener = Arc::new(Recorder {
            tx: StdMutex::new(tx),
            clock,
        });
        let checker = IdleStateChecker::new(
            wheel.clone(),
            clock,
            &channel,
            listener,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
        );
        checker.initialize();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        checker.destroy();
        wheel.shutdown();
    }
}
