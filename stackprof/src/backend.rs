use core::cell::UnsafeCell;
use core::fmt;
use core::hint;
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::buffer::SampleBuffer;
use crate::interface::*;
use crate::walker::{self, FramePointerStepper, FrameStepper};

// Every access to `buffer` happens while this context owns the state word:
// the tick handler in CAPTURING, init in CONFIGURING, a `Samples` view in READING.
const UNINITIALIZED: u8 = 0;
const IDLE: u8 = 1;
const ACTIVE: u8 = 2;
const CAPTURING: u8 = 3;
const CONFIGURING: u8 = 4;
const READING: u8 = 5;

/// Observable profiler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    /// Initialized, not sampling. Results may be read.
    Idle,
    /// Timer interrupt enabled, ticks are being captured.
    Active,
}

/// Control-plane errors. None of these can come out of a normal capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The sampling period must be at least one microsecond.
    InvalidPeriod,
    /// The buffer must hold at least one sample.
    InvalidCapacity,
    /// Max depth must be in `1..=MAX_STACK_DEPTH`.
    InvalidDepth,
    /// `init` has not been called yet.
    NotInitialized,
    /// The operation needs sampling to be off.
    Active,
    /// A result view is still alive, or `init` is running.
    Busy,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidPeriod => write!(f, "sampling period must be greater than zero"),
            Error::InvalidCapacity => write!(f, "sample limit must be greater than zero"),
            Error::InvalidDepth => {
                write!(f, "max stack depth must be between 1 and {}", MAX_STACK_DEPTH)
            }
            Error::NotInitialized => write!(f, "profiler used before init"),
            Error::Active => write!(f, "profiler is still sampling, call off first"),
            Error::Busy => write!(f, "profiler results are being read"),
        }
    }
}

/// Sampling parameters, fixed by `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Microseconds between ticks.
    pub period_us: u32,
    /// Number of traces the buffer holds before dropping.
    pub capacity: usize,
    /// Maximum number of addresses per trace, including the program counter.
    pub max_depth: usize,
}

impl Config {
    pub const fn new(period_us: u32, capacity: usize) -> Self {
        Self {
            period_us,
            capacity,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub const fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.period_us == 0 {
            return Err(Error::InvalidPeriod);
        }
        if self.capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        if self.max_depth == 0 || self.max_depth > MAX_STACK_DEPTH {
            return Err(Error::InvalidDepth);
        }
        Ok(())
    }
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// The trace went into the buffer.
    Stored,
    /// The buffer was full, the trace was counted and discarded.
    Dropped,
    /// Sampling was not active, e.g. a late interrupt after `off`.
    Ignored,
}

/// The sampling controller.
///
/// Owns the timer, the frame stepper and the sample buffer. Every method takes
/// `&self`, so a profiler can live in a `static` shared between foreground code
/// and the timer interrupt. The state machine decides who may touch the buffer:
/// only [`tick`](Profiler::tick) while active, only a [`Samples`] view while idle.
pub struct Profiler<T, S = FramePointerStepper> {
    state: AtomicU8,
    period_us: AtomicU32,
    capacity: AtomicUsize,
    max_depth: AtomicUsize,
    ticks: AtomicUsize,
    buffer: UnsafeCell<SampleBuffer>,
    timer: T,
    stepper: S,
}

// SAFETY: the only non-Sync field is `buffer`, and it is only accessed by whoever
// moved the state word into CAPTURING, CONFIGURING or READING.
unsafe impl<T: Sync, S: Sync> Sync for Profiler<T, S> {}

impl<T: TimerSource> Profiler<T> {
    /// A profiler using the target's native frame-pointer layout.
    pub const fn with_timer(timer: T) -> Self {
        Self::new(timer, FramePointerStepper::NATIVE)
    }
}

impl<T: TimerSource, S: FrameStepper> Profiler<T, S> {
    pub const fn new(timer: T, stepper: S) -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
            period_us: AtomicU32::new(0),
            capacity: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(0),
            ticks: AtomicUsize::new(0),
            buffer: UnsafeCell::new(SampleBuffer::new()),
            timer,
            stepper,
        }
    }

    /// Initializes with the default stack depth.
    ///
    /// `period_us` is the time between samples, `capacity` the maximum number of
    /// samples kept. See [`init_with`](Profiler::init_with).
    pub fn init(&self, period_us: u32, capacity: usize) -> Result<(), Error> {
        self.init_with(Config::new(period_us, capacity))
    }

    /// Configures the timer (without enabling it) and sizes and clears the buffer.
    ///
    /// May be called again while idle, which discards previous results.
    /// An invalid config leaves everything as it was.
    pub fn init_with(&self, config: Config) -> Result<(), Error> {
        if let Err(err) = config.validate() {
            log::error!("stackprof: rejected {:?}: {}", config, err);
            return Err(err);
        }

        let from = match self.claim(&[UNINITIALIZED, IDLE], CONFIGURING) {
            Ok(from) => from,
            Err(current) => {
                let err = Self::misuse(current);
                log::error!("stackprof: init refused: {}", err);
                return Err(err);
            }
        };
        if from == IDLE {
            log::warn!("stackprof: re-initializing, previous samples are discarded");
        }

        self.timer.configure(config.period_us);
        // SAFETY: CONFIGURING is exclusive.
        unsafe { (*self.buffer.get()).reset(config.capacity) };
        self.period_us.store(config.period_us, Ordering::Relaxed);
        self.capacity.store(config.capacity, Ordering::Relaxed);
        self.max_depth.store(config.max_depth, Ordering::Relaxed);
        self.ticks.store(0, Ordering::Relaxed);
        self.state.store(IDLE, Ordering::Release);

        log::info!(
            "stackprof: initialized, period {} us, {} samples, depth {}",
            config.period_us,
            config.capacity,
            config.max_depth
        );
        Ok(())
    }

    /// Starts sampling. Does nothing if already active.
    pub fn on(&self) -> Result<(), Error> {
        match self.claim(&[IDLE], ACTIVE) {
            Ok(_) => {
                self.timer.enable();
                log::debug!("stackprof: sampling on");
                Ok(())
            }
            Err(ACTIVE) | Err(CAPTURING) => {
                log::warn!("stackprof: on() while already sampling");
                Ok(())
            }
            Err(current) => {
                let err = Self::misuse(current);
                log::error!("stackprof: on() refused: {}", err);
                Err(err)
            }
        }
    }

    /// Stops sampling. Does nothing if already idle.
    ///
    /// Once this returns, the buffer will not be written again until the next `on`.
    pub fn off(&self) -> Result<(), Error> {
        loop {
            match self
                .state
                .compare_exchange(ACTIVE, IDLE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // A tick that sneaks in before this sees IDLE and is ignored.
                    self.timer.disable();
                    log::debug!("stackprof: sampling off");
                    return Ok(());
                }
                // Only reachable when the tick runs on another core or thread.
                Err(CAPTURING) => hint::spin_loop(),
                Err(UNINITIALIZED) => {
                    log::error!("stackprof: off() refused: {}", Error::NotInitialized);
                    return Err(Error::NotInitialized);
                }
                Err(_) => {
                    log::warn!("stackprof: off() while not sampling");
                    return Ok(());
                }
            }
        }
    }

    /// The timer interrupt handler.
    ///
    /// Acknowledges the timer, walks the interrupted stack and appends the trace.
    /// Does not allocate, log or block.
    pub fn tick<C: InterruptContext + ?Sized>(&self, ctx: &C) -> Result<Capture, Error> {
        self.timer.acknowledge();

        match self
            .state
            .compare_exchange(ACTIVE, CAPTURING, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {}
            Err(UNINITIALIZED) => return Err(Error::NotInitialized),
            Err(_) => return Ok(Capture::Ignored),
        }

        let mut trace = StackTrace::new();
        walker::walk(
            &self.stepper,
            ctx.program_counter(),
            ctx.frame_pointer(),
            &ctx.stack_bounds(),
            self.max_depth.load(Ordering::Relaxed),
            &mut trace,
        );

        // SAFETY: CAPTURING is exclusive.
        let stored = unsafe { (*self.buffer.get()).try_append(&trace) };
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.state.store(ACTIVE, Ordering::Release);

        Ok(if stored {
            Capture::Stored
        } else {
            Capture::Dropped
        })
    }

    /// Read access to the captured samples.
    ///
    /// Only possible while idle. `on` and `init` are refused until the
    /// returned view is dropped.
    pub fn samples(&self) -> Result<Samples<'_>, Error> {
        self.claim(&[IDLE], READING).map_err(Self::misuse)?;
        Ok(Samples {
            state: &self.state,
            // SAFETY: READING is exclusive until the view is dropped.
            buffer: unsafe { &*self.buffer.get() },
            config: self.current_config(),
            ticks: self.ticks.load(Ordering::Relaxed),
        })
    }

    pub fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            UNINITIALIZED => State::Uninitialized,
            ACTIVE | CAPTURING => State::Active,
            _ => State::Idle,
        }
    }

    /// The configuration set by the last successful `init`.
    pub fn config(&self) -> Option<Config> {
        match self.state() {
            State::Uninitialized => None,
            _ => Some(self.current_config()),
        }
    }

    /// Ticks captured (stored or dropped) since `init`.
    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    fn current_config(&self) -> Config {
        Config {
            period_us: self.period_us.load(Ordering::Relaxed),
            capacity: self.capacity.load(Ordering::Relaxed),
            max_depth: self.max_depth.load(Ordering::Relaxed),
        }
    }

    /// Moves the state word from any of `from` into `to`.
    /// On failure returns the state that was found instead.
    fn claim(&self, from: &[u8], to: u8) -> Result<u8, u8> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !from.contains(&current) {
                return Err(current);
            }
            match self
                .state
                .compare_exchange_weak(current, to, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(prev) => return Ok(prev),
                Err(actual) => current = actual,
            }
        }
    }

    fn misuse(current: u8) -> Error {
        match current {
            UNINITIALIZED => Error::NotInitialized,
            ACTIVE | CAPTURING => Error::Active,
            _ => Error::Busy,
        }
    }
}

/// Read-only view of the captured samples, handed out by [`Profiler::samples`].
///
/// Holds the profiler in its reading state until dropped. Traces borrowed from
/// the view cannot outlive it, since `on` and `init` write the buffer again:
///
/// ```compile_fail
/// use stackprof::{Profiler, StackTrace, TimerSource};
///
/// struct Timer;
///
/// impl TimerSource for Timer {
///     fn configure(&self, _period_us: u32) {}
///     fn enable(&self) {}
///     fn disable(&self) {}
/// }
///
/// let prof = Profiler::with_timer(Timer);
/// prof.init(100, 4).unwrap();
/// let held: Vec<&StackTrace> = {
///     let samples = prof.samples().unwrap();
///     samples.iter().collect()
/// };
/// prof.init(100, 8).unwrap();
/// println!("{:?}", held);
/// ```
pub struct Samples<'a> {
    state: &'a AtomicU8,
    buffer: &'a SampleBuffer,
    config: Config,
    ticks: usize,
}

impl<'a> Samples<'a> {
    /// Traces in capture order.
    pub fn iter(&self) -> core::slice::Iter<'_, StackTrace> {
        self.buffer.iter()
    }

    /// Number of stored traces.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn dropped_count(&self) -> usize {
        self.buffer.dropped_count()
    }

    /// Ticks handled while sampling, `len() + dropped_count()`.
    pub fn ticks(&self) -> usize {
        self.ticks
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn config(&self) -> Config {
        self.config
    }
}

impl<'b> IntoIterator for &'b Samples<'_> {
    type Item = &'b StackTrace;
    type IntoIter = core::slice::Iter<'b, StackTrace>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl Drop for Samples<'_> {
    fn drop(&mut self) {
        self.state.store(IDLE, Ordering::Release);
    }
}

impl fmt::Debug for Samples<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Samples")
            .field("len", &self.len())
            .field("dropped", &self.dropped_count())
            .field("ticks", &self.ticks)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walker::tests::SyntheticStack;
    use crate::walker::FrameLayout;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicBool;

    /// Counts what the profiler asks of the timer.
    #[derive(Default)]
    struct MockTimer {
        period_us: AtomicU32,
        enabled: AtomicBool,
        enables: AtomicUsize,
        disables: AtomicUsize,
        acks: AtomicUsize,
    }

    impl TimerSource for MockTimer {
        fn configure(&self, period_us: u32) {
            self.period_us.store(period_us, Ordering::Relaxed);
        }

        fn enable(&self) {
            self.enabled.store(true, Ordering::Relaxed);
            self.enables.fetch_add(1, Ordering::Relaxed);
        }

        fn disable(&self) {
            self.enabled.store(false, Ordering::Relaxed);
            self.disables.fetch_add(1, Ordering::Relaxed);
        }

        fn acknowledge(&self) {
            self.acks.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn profiler() -> Profiler<MockTimer> {
        Profiler::with_timer(MockTimer::default())
    }

    fn leaf_only(pc: Address) -> InterruptFrame {
        InterruptFrame {
            pc,
            fp: 0,
            stack: StackBounds::EMPTY,
        }
    }

    #[test]
    fn lifecycle() {
        let prof = profiler();
        assert_eq!(prof.state(), State::Uninitialized);
        assert_eq!(prof.config(), None);

        prof.init(1_000, 16).unwrap();
        assert_eq!(prof.state(), State::Idle);
        assert_eq!(prof.timer().period_us.load(Ordering::Relaxed), 1_000);
        assert!(!prof.timer().enabled.load(Ordering::Relaxed));

        prof.on().unwrap();
        assert_eq!(prof.state(), State::Active);
        assert!(prof.timer().enabled.load(Ordering::Relaxed));

        prof.off().unwrap();
        assert_eq!(prof.state(), State::Idle);
        assert!(!prof.timer().enabled.load(Ordering::Relaxed));
        assert_eq!(prof.config(), Some(Config::new(1_000, 16)));
    }

    #[test]
    fn invalid_config_is_rejected_and_state_kept() {
        let prof = profiler();
        assert_eq!(prof.init(0, 10), Err(Error::InvalidPeriod));
        assert_eq!(prof.init(10, 0), Err(Error::InvalidCapacity));
        assert_eq!(
            prof.init_with(Config::new(10, 10).with_max_depth(0)),
            Err(Error::InvalidDepth)
        );
        assert_eq!(
            prof.init_with(Config::new(10, 10).with_max_depth(MAX_STACK_DEPTH + 1)),
            Err(Error::InvalidDepth)
        );
        assert_eq!(prof.state(), State::Uninitialized);

        prof.init(10, 10).unwrap();
        assert_eq!(prof.init(0, 10), Err(Error::InvalidPeriod));
        assert_eq!(prof.config(), Some(Config::new(10, 10)));
    }

    #[test]
    fn misuse_before_init_fails() {
        let prof = profiler();
        assert_eq!(prof.on(), Err(Error::NotInitialized));
        assert_eq!(prof.off(), Err(Error::NotInitialized));
        assert_eq!(prof.tick(&leaf_only(1)), Err(Error::NotInitialized));
        assert_eq!(prof.samples().err(), Some(Error::NotInitialized));
        assert_eq!(prof.timer().enables.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn on_and_off_are_idempotent() {
        let prof = profiler();
        prof.init(100, 16).unwrap();

        prof.on().unwrap();
        prof.on().unwrap();
        assert_eq!(prof.timer().enables.load(Ordering::Relaxed), 1);

        for pc in 0..3 {
            prof.tick(&leaf_only(pc)).unwrap();
        }

        prof.off().unwrap();
        prof.off().unwrap();
        assert_eq!(prof.timer().disables.load(Ordering::Relaxed), 1);

        let samples = prof.samples().unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples.ticks(), 3);
    }

    #[test]
    fn reinit_while_active_is_refused() {
        let prof = profiler();
        prof.init(100, 4).unwrap();
        prof.on().unwrap();
        prof.tick(&leaf_only(0x10)).unwrap();

        assert_eq!(prof.init(100, 8), Err(Error::Active));
        assert_eq!(prof.state(), State::Active);

        prof.off().unwrap();
        prof.init(200, 8).unwrap();
        let samples = prof.samples().unwrap();
        assert!(samples.is_empty());
        assert_eq!(samples.capacity(), 8);
        assert_eq!(samples.config().period_us, 200);
    }

    #[test]
    fn reading_requires_idle() {
        let prof = profiler();
        prof.init(100, 4).unwrap();
        prof.on().unwrap();
        assert_eq!(prof.samples().err(), Some(Error::Active));
        prof.off().unwrap();

        let samples = prof.samples().unwrap();
        assert_eq!(prof.samples().err(), Some(Error::Busy));
        assert_eq!(prof.on(), Err(Error::Busy));
        assert_eq!(prof.init(100, 4), Err(Error::Busy));
        assert_eq!(prof.state(), State::Idle);
        drop(samples);

        prof.on().unwrap();
        assert_eq!(prof.state(), State::Active);
    }

    #[test]
    fn view_copies_survive_reinit() {
        let prof = profiler();
        prof.init(100, 4).unwrap();
        prof.on().unwrap();
        prof.tick(&leaf_only(0x1234)).unwrap();
        prof.off().unwrap();

        // borrows end with the view, owned copies do not
        let kept: Vec<StackTrace> = {
            let samples = prof.samples().unwrap();
            (&samples).into_iter().copied().collect()
        };
        assert_eq!(prof.state(), State::Idle);

        prof.init(100, 8).unwrap();
        assert!(prof.samples().unwrap().is_empty());
        assert_eq!(kept[0].as_slice(), &[0x1234]);
    }

    #[test]
    fn ticks_outside_active_are_ignored_but_acknowledged() {
        let prof = profiler();
        prof.init(100, 4).unwrap();
        assert_eq!(prof.tick(&leaf_only(1)), Ok(Capture::Ignored));

        prof.on().unwrap();
        assert_eq!(prof.tick(&leaf_only(2)), Ok(Capture::Stored));
        prof.off().unwrap();
        assert_eq!(prof.tick(&leaf_only(3)), Ok(Capture::Ignored));

        assert_eq!(prof.timer().acks.load(Ordering::Relaxed), 3);
        let samples = prof.samples().unwrap();
        let leaves: Vec<_> = samples.iter().filter_map(|t| t.leaf()).collect();
        assert_eq!(leaves, [2]);
        assert_eq!(samples.ticks(), 1);
    }

    #[test]
    fn small_buffer_stores_two_and_drops_three() {
        let prof = profiler();
        prof.init(500, 2).unwrap();
        prof.on().unwrap();

        let outcomes: Vec<_> = (0..5)
            .map(|pc| prof.tick(&leaf_only(0x100 + pc)).unwrap())
            .collect();
        assert_eq!(
            outcomes,
            [
                Capture::Stored,
                Capture::Stored,
                Capture::Dropped,
                Capture::Dropped,
                Capture::Dropped
            ]
        );

        prof.off().unwrap();
        let samples = prof.samples().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples.dropped_count(), 3);
        assert_eq!(samples.len() + samples.dropped_count(), samples.ticks());
        let leaves: Vec<_> = samples.iter().filter_map(|t| t.leaf()).collect();
        assert_eq!(leaves, [0x100, 0x101]);
    }

    #[test]
    fn tick_walks_the_interrupted_stack() {
        let stack = SyntheticStack::new(FrameLayout::NATIVE, &[0x4100, 0x4200, 0x4300]);
        let frame = InterruptFrame {
            pc: 0x4000,
            fp: stack.frame_pointer(0),
            stack: stack.bounds(),
        };

        let prof = profiler();
        prof.init_with(Config::new(100, 4).with_max_depth(3)).unwrap();
        prof.on().unwrap();
        prof.tick(&frame).unwrap();
        prof.off().unwrap();

        let samples = prof.samples().unwrap();
        let traces: Vec<_> = samples.iter().collect();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].as_slice(), &[0x4000, 0x4100, 0x4200]);
    }

    #[test]
    fn ticks_from_another_thread_never_tear_reads() {
        use std::sync::Arc;
        use std::thread;

        let prof = Arc::new(profiler());
        prof.init(1, 64).unwrap();
        prof.on().unwrap();

        let ticker = {
            let prof = Arc::clone(&prof);
            thread::spawn(move || {
                let mut handled = 0;
                for pc in 0..200 {
                    if prof.tick(&leaf_only(pc)) != Ok(Capture::Ignored) {
                        handled += 1;
                    }
                }
                handled
            })
        };

        thread::yield_now();
        prof.off().unwrap();
        let handled = ticker.join().unwrap();

        let samples = prof.samples().unwrap();
        assert_eq!(samples.ticks(), handled);
        assert_eq!(samples.len() + samples.dropped_count(), handled);
    }
}
