use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::mem;

/// Upper bound on the number of addresses a single trace can hold.
pub const MAX_STACK_DEPTH: usize = 32;

/// Depth used by [`Config::new`](crate::Config::new) when none is given.
pub const DEFAULT_MAX_DEPTH: usize = 16;

/// A return address or frame pointer value. Only identity matters.
pub type Address = usize;

pub(crate) const WORD: usize = mem::size_of::<Address>();

/// Call chain captured at one tick, leaf first.
///
/// Storage is inline so that capturing never allocates. Only the first
/// `len()` slots take part in comparisons and hashing.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StackTrace {
    len: usize,
    frames: [Address; MAX_STACK_DEPTH],
}

impl StackTrace {
    pub const EMPTY: StackTrace = StackTrace {
        len: 0,
        frames: [0; MAX_STACK_DEPTH],
    };

    pub const fn new() -> Self {
        Self::EMPTY
    }

    /// Builds a trace from a slice, truncated to [`MAX_STACK_DEPTH`].
    pub fn from_slice(addrs: &[Address]) -> Self {
        let mut trace = Self::EMPTY;
        for &addr in addrs.iter().take(MAX_STACK_DEPTH) {
            trace.push(addr);
        }
        trace
    }

    /// Appends `addr`. Returns `false` and leaves the trace untouched if it is full.
    pub fn push(&mut self, addr: Address) -> bool {
        if self.len >= MAX_STACK_DEPTH {
            return false;
        }
        self.frames[self.len] = addr;
        self.len += 1;
        true
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The innermost frame, i.e. the interrupted program counter.
    pub fn leaf(&self) -> Option<Address> {
        self.as_slice().first().copied()
    }

    pub fn as_slice(&self) -> &[Address] {
        &self.frames[..self.len]
    }
}

impl Default for StackTrace {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl PartialEq for StackTrace {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for StackTrace {}

impl PartialOrd for StackTrace {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StackTrace {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl Hash for StackTrace {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state);
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.as_slice().iter().map(|a| Hex(*a)))
            .finish()
    }
}

struct Hex(Address);

impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Address range `[low, high)` of the stack the interrupted code was running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    low: Address,
    high: Address,
}

impl StackBounds {
    /// An empty range. Walking with it yields only the program counter.
    pub const EMPTY: StackBounds = StackBounds { low: 0, high: 0 };

    /// # Safety
    ///
    /// Every word in `[low, high)` must be readable for as long as the bounds are
    /// used for walking. The walker trusts this range and dereferences anything
    /// inside it.
    pub const unsafe fn new(low: Address, high: Address) -> Self {
        Self { low, high }
    }

    pub fn low(&self) -> Address {
        self.low
    }

    pub fn high(&self) -> Address {
        self.high
    }

    /// Whether a whole word starting at `addr` lies inside the range.
    pub fn contains_word(&self, addr: Address) -> bool {
        match addr.checked_add(WORD) {
            Some(end) => addr >= self.low && end <= self.high,
            None => false,
        }
    }
}

/// What the tick handler needs from the saved context at interrupt entry.
pub trait InterruptContext {
    /// Program counter of the interrupted code.
    fn program_counter(&self) -> Address;
    /// Frame pointer register of the interrupted code.
    fn frame_pointer(&self) -> Address;
    /// Valid stack range of the interrupted code.
    fn stack_bounds(&self) -> StackBounds;
}

/// Plain register snapshot, filled in by the platform's interrupt entry code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub pc: Address,
    pub fp: Address,
    pub stack: StackBounds,
}

impl InterruptContext for InterruptFrame {
    fn program_counter(&self) -> Address {
        self.pc
    }

    fn frame_pointer(&self) -> Address {
        self.fp
    }

    fn stack_bounds(&self) -> StackBounds {
        self.stack
    }
}

/// The periodic timer dedicated to profiling.
///
/// Methods take `&self` because the tick handler acknowledges the timer from
/// interrupt context while the foreground may hold a reference as well.
/// Implementations usually just poke memory-mapped registers.
pub trait TimerSource {
    /// Arms a periodic interrupt every `period_us` microseconds, without enabling it.
    fn configure(&self, period_us: u32);
    fn enable(&self);
    fn disable(&self);
    /// Clears the pending interrupt and re-arms the timer, if the hardware needs it.
    fn acknowledge(&self) {}
}

impl<T: TimerSource + ?Sized> TimerSource for &T {
    fn configure(&self, period_us: u32) {
        (**self).configure(period_us)
    }

    fn enable(&self) {
        (**self).enable()
    }

    fn disable(&self) {
        (**self).disable()
    }

    fn acknowledge(&self) {
        (**self).acknowledge()
    }
}
