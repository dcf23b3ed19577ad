use alloc::vec::Vec;
use core::fmt;

use stackprof::{FrameStepper, Profiler, TimerSource};

use crate::report::{Grouping, Report};
use crate::symbols::SymbolLookup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpError {
    /// The profiler refused to hand out its samples (not initialized, or still on).
    Profiler(stackprof::Error),
    /// The output sink failed.
    Format(fmt::Error),
}

impl From<stackprof::Error> for DumpError {
    fn from(err: stackprof::Error) -> Self {
        DumpError::Profiler(err)
    }
}

impl From<fmt::Error> for DumpError {
    fn from(err: fmt::Error) -> Self {
        DumpError::Format(err)
    }
}

impl fmt::Display for DumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpError::Profiler(err) => write!(f, "cannot dump: {}", err),
            DumpError::Format(_) => write!(f, "cannot dump: output sink failed"),
        }
    }
}

/// Writes the aggregated report of everything captured so far to `out`.
///
/// Sampling has to be off. The samples are only read, so dumping again gives
/// the same report.
///
/// # Arguments
///
/// * `profiler` - the profiler that captured the samples, after `off()`
/// * `out` - text sink, e.g. a UART writer
/// * `symbols` - address resolution, [`NoSymbols`](crate::NoSymbols) prints raw addresses
/// * `grouping` - how samples are aggregated, stated in the report header
pub fn dump<T, S, W, L>(
    profiler: &Profiler<T, S>,
    out: &mut W,
    symbols: &L,
    grouping: Grouping,
) -> Result<(), DumpError>
where
    T: TimerSource,
    S: FrameStepper,
    W: fmt::Write + ?Sized,
    L: SymbolLookup,
{
    let samples = profiler.samples()?;
    log::info!(
        "stackprof: dumping {} samples ({} dropped)",
        samples.len(),
        samples.dropped_count()
    );
    let report = Report::from_samples(&samples, grouping);
    drop(samples);

    write!(out, "{}", report.display(symbols))?;
    Ok(())
}

/// Like [`dump`], but emits folded stacks for flame graph tools.
pub fn dump_folded<T, S, W, L>(
    profiler: &Profiler<T, S>,
    out: &mut W,
    symbols: &L,
) -> Result<(), DumpError>
where
    T: TimerSource,
    S: FrameStepper,
    W: fmt::Write + ?Sized,
    L: SymbolLookup,
{
    let report = {
        let samples = profiler.samples()?;
        Report::from_samples(&samples, Grouping::FullTrace)
    };
    write!(out, "{}", report.folded(symbols))?;
    Ok(())
}

/// Encodes the captured samples in the raw format of the [`export`](mod@crate::export) module.
pub fn export<T, S>(profiler: &Profiler<T, S>) -> Result<Vec<u8>, stackprof::Error>
where
    T: TimerSource,
    S: FrameStepper,
{
    let samples = profiler.samples()?;
    Ok(crate::export::encode(&samples))
}
