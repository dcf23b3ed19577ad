//! This crate provides the reporting side of stackprof.
//! It turns the samples captured by a [`stackprof::Profiler`] into a frequency
//! report, folded stacks for flame graphs, or a raw binary export that can be
//! symbolized on a host.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod export;
mod frontend;
pub mod report;
mod symbols;

pub use frontend::*;
pub use report::{Group, Grouping, Report, Summary};
pub use symbols::{NoSymbols, Symbol, SymbolLookup, SymbolTable};
