//! Aggregation of captured traces into a frequency report.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::mem;

use stackprof::{Address, Samples, StackTrace};

use crate::symbols::SymbolLookup;

// "0x" plus two hex digits per byte
const ADDR_WIDTH: usize = 2 + 2 * mem::size_of::<Address>();

/// What makes two samples count as the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Grouping {
    /// Identical call chains, compared address by address.
    #[default]
    FullTrace,
    /// Same interrupted program counter, regardless of callers.
    Leaf,
}

impl Grouping {
    fn key(&self, trace: &StackTrace) -> StackTrace {
        match self {
            Grouping::FullTrace => *trace,
            Grouping::Leaf => StackTrace::from_slice(&trace.as_slice()[..trace.len().min(1)]),
        }
    }
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grouping::FullTrace => f.write_str("full trace"),
            Grouping::Leaf => f.write_str("leaf address"),
        }
    }
}

/// Totals printed in the report header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Summary {
    /// Samples stored in the buffer.
    pub captured: usize,
    /// Ticks handled while sampling.
    pub ticks: usize,
    pub dropped: usize,
    pub period_us: u32,
    pub capacity: usize,
}

impl Summary {
    pub fn of(samples: &Samples<'_>) -> Self {
        Self {
            captured: samples.len(),
            ticks: samples.ticks(),
            dropped: samples.dropped_count(),
            period_us: samples.config().period_us,
            capacity: samples.capacity(),
        }
    }
}

/// Samples sharing one key. For [`Grouping::Leaf`] the trace holds only the leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub trace: StackTrace,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct Report {
    summary: Summary,
    grouping: Grouping,
    groups: Vec<Group>,
}

impl Report {
    /// Groups `traces` and sorts the groups by descending count.
    ///
    /// Groups with equal counts stay in the order they were first seen, so the
    /// same input always gives the same report.
    pub fn build<'a, I>(traces: I, summary: Summary, grouping: Grouping) -> Self
    where
        I: IntoIterator<Item = &'a StackTrace>,
    {
        let mut index: BTreeMap<StackTrace, usize> = BTreeMap::new();
        let mut groups: Vec<Group> = Vec::new();

        for trace in traces {
            let key = grouping.key(trace);
            match index.get(&key) {
                Some(&i) => groups[i].count += 1,
                None => {
                    index.insert(key, groups.len());
                    groups.push(Group {
                        trace: key,
                        count: 1,
                    });
                }
            }
        }

        // stable, ties keep first-seen order
        groups.sort_by(|a, b| b.count.cmp(&a.count));

        Self {
            summary,
            grouping,
            groups,
        }
    }

    pub fn from_samples(samples: &Samples<'_>, grouping: Grouping) -> Self {
        Self::build(samples.iter(), Summary::of(samples), grouping)
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn grouping(&self) -> Grouping {
        self.grouping
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Sum of all group counts.
    pub fn total(&self) -> usize {
        self.groups.iter().map(|g| g.count).sum()
    }

    /// Human readable rendering, addresses resolved through `symbols`.
    pub fn display<'r, L: SymbolLookup>(&'r self, symbols: &'r L) -> Rendered<'r, L> {
        Rendered {
            report: self,
            symbols,
        }
    }

    /// One `root;...;leaf count` line per group, for flame graph tools.
    pub fn folded<'r, L: SymbolLookup>(&'r self, symbols: &'r L) -> Folded<'r, L> {
        Folded {
            report: self,
            symbols,
        }
    }

    fn percent_tenths(&self, count: usize) -> usize {
        match self.summary.captured {
            0 => 0,
            // u64 so large counts cannot overflow on 32-bit targets
            total => (count as u64 * 1000 / total as u64) as usize,
        }
    }
}

/// Text rendering of a [`Report`], see [`Report::display`].
pub struct Rendered<'r, L> {
    report: &'r Report,
    symbols: &'r L,
}

impl<L: SymbolLookup> fmt::Display for Rendered<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.report;
        let s = &report.summary;

        writeln!(
            f,
            "stackprof: {} samples captured, {} ticks, {} dropped, period {} us, capacity {}",
            s.captured, s.ticks, s.dropped, s.period_us, s.capacity
        )?;
        writeln!(
            f,
            "stackprof: grouped by {}, leaf first, {} unique",
            report.grouping,
            report.groups.len()
        )?;
        if s.dropped > 0 {
            writeln!(
                f,
                "stackprof: buffer was full, {} samples dropped, counts are a lower bound",
                s.dropped
            )?;
        }

        for group in &report.groups {
            writeln!(f)?;
            let tenths = report.percent_tenths(group.count);
            write!(f, "{:>8} {:>4}.{}%", group.count, tenths / 10, tenths % 10)?;

            let frames = group.trace.as_slice();
            if frames.is_empty() {
                writeln!(f, "  <no frames>")?;
                continue;
            }
            for (i, &addr) in frames.iter().enumerate() {
                if i > 0 {
                    write!(f, "{:16}", "")?;
                }
                write!(f, "  {:#0width$x}", addr, width = ADDR_WIDTH)?;
                match self.symbols.resolve(addr) {
                    Some(sym) => writeln!(f, "  {}", sym)?,
                    None => writeln!(f)?,
                }
            }
        }
        Ok(())
    }
}

pub struct Folded<'r, L> {
    report: &'r Report,
    symbols: &'r L,
}

impl<L: SymbolLookup> fmt::Display for Folded<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for group in &self.report.groups {
            for (i, &addr) in group.trace.as_slice().iter().rev().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                match self.symbols.resolve(addr) {
                    Some(sym) => write!(f, "{:#}", rustc_demangle::demangle(sym.name))?,
                    None => write!(f, "{:#x}", addr)?,
                }
            }
            writeln!(f, " {}", group.count)?;
        }
        Ok(())
    }
}
