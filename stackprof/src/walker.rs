//! Frame-pointer stack walking.
//!
//! Nothing here allocates or takes locks: [`walk`] is called from the timer
//! interrupt and only reads words that [`StackBounds`] vouches for.

use core::ptr;

use crate::interface::*;

/// One step up the call chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Where the current function returns to.
    pub return_address: Address,
    /// Frame pointer of the caller, 0 at the end of the chain.
    pub caller_fp: Address,
}

/// Recovers the caller's frame from the current frame pointer.
///
/// The frame-pointer convention is the default. Platforms with unwind tables
/// can plug in something more precise without touching the backend.
pub trait FrameStepper {
    /// Returns `None` if the frame cannot be read without leaving `bounds`.
    fn step(&self, fp: Address, bounds: &StackBounds) -> Option<Frame>;
}

/// Where a frame record lives relative to the frame pointer, in words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub caller_fp: isize,
    pub return_address: isize,
}

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64"))] {
        const NATIVE_LAYOUT: FrameLayout = FrameLayout { caller_fp: 0, return_address: 1 };
    } else if #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))] {
        // fp points just above the saved ra/fp pair
        const NATIVE_LAYOUT: FrameLayout = FrameLayout { caller_fp: -2, return_address: -1 };
    } else if #[cfg(target_arch = "arm")] {
        // APCS frame: fp -> {pc, lr, sp, fp} stored downwards
        const NATIVE_LAYOUT: FrameLayout = FrameLayout { caller_fp: -3, return_address: -1 };
    } else {
        const NATIVE_LAYOUT: FrameLayout = FrameLayout { caller_fp: 0, return_address: 1 };
    }
}

impl FrameLayout {
    /// Layout the compiler emits for the target when frame pointers are kept.
    pub const NATIVE: FrameLayout = NATIVE_LAYOUT;

    fn slot(&self, fp: Address, words: isize) -> Option<Address> {
        fp.checked_add_signed(words.checked_mul(WORD as isize)?)
    }
}

/// Reads frame records in place, following [`FrameLayout`].
#[derive(Debug, Clone, Copy)]
pub struct FramePointerStepper {
    layout: FrameLayout,
}

impl FramePointerStepper {
    pub const NATIVE: FramePointerStepper = FramePointerStepper::new(FrameLayout::NATIVE);

    pub const fn new(layout: FrameLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    fn read(bounds: &StackBounds, addr: Address) -> Option<Address> {
        if addr % WORD != 0 || !bounds.contains_word(addr) {
            return None;
        }
        // SAFETY: StackBounds::new makes the caller promise the whole range is readable.
        Some(unsafe { ptr::read_volatile(addr as *const Address) })
    }
}

impl Default for FramePointerStepper {
    fn default() -> Self {
        Self::NATIVE
    }
}

impl FrameStepper for FramePointerStepper {
    fn step(&self, fp: Address, bounds: &StackBounds) -> Option<Frame> {
        let ret_slot = self.layout.slot(fp, self.layout.return_address)?;
        let fp_slot = self.layout.slot(fp, self.layout.caller_fp)?;
        Some(Frame {
            return_address: Self::read(bounds, ret_slot)?,
            caller_fp: Self::read(bounds, fp_slot)?,
        })
    }
}

impl<S: FrameStepper + ?Sized> FrameStepper for &S {
    fn step(&self, fp: Address, bounds: &StackBounds) -> Option<Frame> {
        (**self).step(fp, bounds)
    }
}

/// Captures the call chain of the interrupted code into `trace`, leaf first.
///
/// The first entry is `pc` itself, followed by one return address per frame.
/// Walking stops after `max_depth` entries (clamped to [`MAX_STACK_DEPTH`]), when
/// the chain ends (null caller frame pointer, zero return address), when a frame
/// cannot be read inside `bounds`, or when the caller's frame pointer is not
/// strictly above the current one. The stack grows down, so the last check also
/// catches cycles.
pub fn walk<S: FrameStepper>(
    stepper: &S,
    pc: Address,
    fp: Address,
    bounds: &StackBounds,
    max_depth: usize,
    trace: &mut StackTrace,
) {
    trace.clear();
    let max_depth = max_depth.min(MAX_STACK_DEPTH);
    if max_depth == 0 {
        return;
    }
    trace.push(pc);

    let mut fp = fp;
    while fp != 0 && trace.len() < max_depth {
        let frame = match stepper.step(fp, bounds) {
            Some(frame) => frame,
            None => break,
        };
        if frame.return_address == 0 {
            break;
        }
        trace.push(frame.return_address);

        if frame.caller_fp <= fp {
            break;
        }
        fp = frame.caller_fp;
    }
}
