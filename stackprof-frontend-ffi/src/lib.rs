//! C interface over one process-wide profiler.
//!
//! ```c
//! stackprof_set_timer(&board_timer_ops);
//! stackprof_init(1000000, 4000);   // every 1 s, 4000-sample limit
//! system_enable_interrupts();
//! stackprof_on();
//! workload();
//! stackprof_off();
//! stackprof_dump();
//! ```
//! The board's timer interrupt handler calls `stackprof_tick` with the
//! interrupted registers.

use std::ffi::CStr;
use std::fs;
use std::os::raw::c_char;
use std::sync::{Mutex, OnceLock};

use stackprof::{Error, InterruptFrame, Profiler, StackBounds, TimerSource};
use stackprof_frontend::{DumpError, Grouping, SymbolTable};

/// Timer driver supplied by the board support code.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StackprofTimerOps {
    pub configure: extern "C" fn(period_us: u32),
    pub enable: extern "C" fn(),
    pub disable: extern "C" fn(),
    /// May be null if the interrupt clears itself.
    pub acknowledge: Option<extern "C" fn()>,
}

struct ExternTimer {
    ops: OnceLock<StackprofTimerOps>,
}

impl TimerSource for ExternTimer {
    fn configure(&self, period_us: u32) {
        if let Some(ops) = self.ops.get() {
            (ops.configure)(period_us);
        }
    }

    fn enable(&self) {
        if let Some(ops) = self.ops.get() {
            (ops.enable)();
        }
    }

    fn disable(&self) {
        if let Some(ops) = self.ops.get() {
            (ops.disable)();
        }
    }

    fn acknowledge(&self) {
        if let Some(ack) = self.ops.get().and_then(|ops| ops.acknowledge) {
            ack();
        }
    }
}

static PROFILER: Profiler<ExternTimer> = Profiler::with_timer(ExternTimer {
    ops: OnceLock::new(),
});

static SYMBOLS: Mutex<Option<SymbolTable>> = Mutex::new(None);

/// Registers the timer driver. Only the first registration counts.
///
/// Returns 0 on success, -1 if a timer was already registered.
#[no_mangle]
pub unsafe extern "C" fn stackprof_set_timer(ops: *const StackprofTimerOps) -> i32 {
    if ops.is_null() {
        return -1;
    }
    match PROFILER.timer().ops.set(*ops) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Sets up sampling every `period_us` microseconds, keeping at most `max_samples`.
///
/// Returns 0 on success and -1 for a zero period or limit, or a missing timer.
/// Aborts if called while sampling.
#[no_mangle]
pub extern "C" fn stackprof_init(period_us: u32, max_samples: u32) -> i32 {
    if PROFILER.timer().ops.get().is_none() {
        log::error!("stackprof: no timer registered, call stackprof_set_timer first");
        return -1;
    }
    match PROFILER.init(period_us, max_samples as usize) {
        Ok(()) => 0,
        Err(Error::InvalidPeriod) | Err(Error::InvalidCapacity) | Err(Error::InvalidDepth) => -1,
        Err(err) => panic!("stackprof_init: {}", err),
    }
}

#[no_mangle]
pub extern "C" fn stackprof_on() {
    if let Err(err) = PROFILER.on() {
        panic!("stackprof_on: {}", err);
    }
}

#[no_mangle]
pub extern "C" fn stackprof_off() {
    if let Err(err) = PROFILER.off() {
        panic!("stackprof_off: {}", err);
    }
}

/// Prints the report to stdout. Sampling has to be off.
#[no_mangle]
pub extern "C" fn stackprof_dump() {
    let mut out = String::new();
    let symbols = SYMBOLS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    match stackprof_frontend::dump(&PROFILER, &mut out, &*symbols, Grouping::FullTrace) {
        Ok(()) => print!("{}", out),
        Err(DumpError::Profiler(err)) => panic!("stackprof_dump: {}", err),
        Err(err) => eprintln!("stackprof_dump: {}", err),
    }
}

/// Timer interrupt entry.
///
/// # Safety
///
/// `[stack_low, stack_high)` must be readable memory holding the interrupted stack.
#[no_mangle]
pub unsafe extern "C" fn stackprof_tick(
    pc: usize,
    fp: usize,
    stack_low: usize,
    stack_high: usize,
) {
    let frame = InterruptFrame {
        pc,
        fp,
        stack: StackBounds::new(stack_low, stack_high),
    };
    if let Err(err) = PROFILER.tick(&frame) {
        panic!("stackprof_tick: {}", err);
    }
}

/// Loads `nm -n $BINARY` output so that dumps show function names.
///
/// Returns the number of symbols loaded, or -1 if the file cannot be read.
///
/// # Safety
///
/// `path` must be a valid, nul-terminated string.
#[no_mangle]
pub unsafe extern "C" fn stackprof_load_symbols(path: *const c_char) -> i64 {
    if path.is_null() {
        return -1;
    }
    let path = CStr::from_ptr(path).to_string_lossy().into_owned();
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) => {
            log::error!("stackprof: cannot read symbols from {}: {}", path, err);
            return -1;
        }
    };
    let table = SymbolTable::parse_nm(&text);
    let count = table.len() as i64;
    *SYMBOLS.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(table);
    count
}

/// Writes the captured samples in the raw export format. Sampling has to be off.
///
/// Returns 0 on success and -1 if the file cannot be written.
///
/// # Safety
///
/// `outfile` must be a valid, nul-terminated string.
#[no_mangle]
pub unsafe extern "C" fn stackprof_dump_raw(outfile: *const c_char) -> i64 {
    if outfile.is_null() {
        return -1;
    }
    let outfile = CStr::from_ptr(outfile).to_string_lossy().into_owned();
    let bytes = match stackprof_frontend::export(&PROFILER) {
        Ok(bytes) => bytes,
        Err(err) => panic!("stackprof_dump_raw: {}", err),
    };
    if let Err(err) = fs::write(&outfile, bytes) {
        log::error!("stackprof: cannot write {}: {}", outfile, err);
        return -1;
    }
    0
}
