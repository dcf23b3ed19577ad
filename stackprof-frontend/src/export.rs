//! Raw sample export, so traces can be symbolized on a host.
//!
//! # Format
//! Little endian throughout.
//! ```text
//! magic      [u8; 8]  "STKPROF\0"
//! version    u32      1
//! period_us  u32
//! capacity   u64
//! ticks      u64
//! dropped    u64
//! count      u64
//! count times:
//!   depth    u64
//!   addrs    [u64; depth]   leaf first
//! ```

use alloc::vec::Vec;
use core::fmt;

use byteorder::{ByteOrder, LittleEndian};
use stackprof::{Address, Samples, StackTrace, MAX_STACK_DEPTH};

use crate::report::{Grouping, Report, Summary};

pub const MAGIC: &[u8; 8] = b"STKPROF\0";
pub const VERSION: u32 = 1;

const HEADER_LEN: usize = 8 + 4 + 4 + 8 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportError {
    /// Input ended in the middle of the header or a record.
    Truncated,
    BadMagic,
    UnsupportedVersion(u32),
    /// A record claims more frames than a trace can hold.
    DepthTooLarge(u64),
    /// A value does not fit this machine's word size.
    Overflow(u64),
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::Truncated => write!(f, "profile data is truncated"),
            ExportError::BadMagic => write!(f, "not a stackprof profile"),
            ExportError::UnsupportedVersion(v) => write!(f, "unsupported profile version {}", v),
            ExportError::DepthTooLarge(d) => {
                write!(f, "trace depth {} exceeds maximum {}", d, MAX_STACK_DEPTH)
            }
            ExportError::Overflow(v) => write!(f, "value {:#x} does not fit a machine word", v),
        }
    }
}

/// A decoded profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProfile {
    pub summary: Summary,
    pub traces: Vec<StackTrace>,
}

impl RawProfile {
    pub fn report(&self, grouping: Grouping) -> Report {
        Report::build(&self.traces, self.summary, grouping)
    }
}

/// Encodes everything in `samples`.
pub fn encode(samples: &Samples<'_>) -> Vec<u8> {
    encode_traces(samples.iter(), &Summary::of(samples))
}

pub fn encode_traces<'a, I>(traces: I, summary: &Summary) -> Vec<u8>
where
    I: IntoIterator<Item = &'a StackTrace>,
{
    let mut out = Vec::with_capacity(HEADER_LEN + summary.captured * 16);

    out.extend_from_slice(MAGIC);
    push_u32(&mut out, VERSION);
    push_u32(&mut out, summary.period_us);
    push_u64(&mut out, summary.capacity as u64);
    push_u64(&mut out, summary.ticks as u64);
    push_u64(&mut out, summary.dropped as u64);
    // patched once the records are written
    let count_at = out.len();
    push_u64(&mut out, 0);

    let mut count: u64 = 0;
    for trace in traces {
        push_u64(&mut out, trace.len() as u64);
        for &addr in trace.as_slice() {
            push_u64(&mut out, addr as u64);
        }
        count += 1;
    }
    LittleEndian::write_u64(&mut out[count_at..count_at + 8], count);

    log::info!("stackprof: exported {} samples, {} bytes", count, out.len());
    out
}

pub fn decode(data: &[u8]) -> Result<RawProfile, ExportError> {
    let mut reader = Reader { data, pos: 0 };

    if reader.take(MAGIC.len())? != MAGIC {
        return Err(ExportError::BadMagic);
    }
    let version = reader.u32()?;
    if version != VERSION {
        return Err(ExportError::UnsupportedVersion(version));
    }
    let period_us = reader.u32()?;
    let capacity = reader.word()?;
    let ticks = reader.word()?;
    let dropped = reader.word()?;
    let count = reader.word()?;

    // every record is at least its depth word
    let mut traces = Vec::with_capacity(count.min(reader.remaining() / 8));
    for _ in 0..count {
        let depth = reader.u64()?;
        if depth > MAX_STACK_DEPTH as u64 {
            return Err(ExportError::DepthTooLarge(depth));
        }
        let mut trace = StackTrace::new();
        for _ in 0..depth {
            trace.push(reader.word()?);
        }
        traces.push(trace);
    }

    Ok(RawProfile {
        summary: Summary {
            captured: traces.len(),
            ticks,
            dropped,
            period_us,
            capacity,
        },
        traces,
    })
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0; 4];
    LittleEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    let mut buf = [0; 8];
    LittleEndian::write_u64(&mut buf, value);
    out.extend_from_slice(&buf);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ExportError> {
        let end = self.pos.checked_add(len).ok_or(ExportError::Truncated)?;
        let bytes = self.data.get(self.pos..end).ok_or(ExportError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u32(&mut self) -> Result<u32, ExportError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64, ExportError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn word(&mut self) -> Result<Address, ExportError> {
        let value = self.u64()?;
        Address::try_from(value).map_err(|_| ExportError::Overflow(value))
    }
}
