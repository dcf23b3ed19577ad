//! Statistical stack-sampling profiler backend for bare-metal targets.
//!
//! A periodic timer interrupt calls [`Profiler::tick`], which walks the
//! interrupted frame-pointer chain and stores the trace in a fixed-size buffer.
//! Foreground code drives the profiler with `init`, `on` and `off`, then reads
//! the results through [`Profiler::samples`]. Reporting lives in
//! `stackprof-frontend`.
//!
//! Code being profiled should be built with `-Cforce-frame-pointers=yes`, or
//! with `-fno-omit-frame-pointer` (plus `-mapcs-frame` on 32-bit ARM) for C.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod backend;
mod buffer;
mod interface;
pub mod walker;

pub use backend::{Capture, Config, Error, Profiler, Samples, State};
pub use buffer::SampleBuffer;
pub use interface::*;
pub use walker::{FrameLayout, FramePointerStepper, FrameStepper};
