use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use stackprof::Address;

/// A resolved address: the enclosing symbol and the offset into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol<'a> {
    pub name: &'a str,
    pub offset: usize,
}

impl fmt::Display for Symbol<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}+{:#x}", rustc_demangle::demangle(self.name), self.offset)
    }
}

/// Best-effort address to name resolution, only used while reporting.
pub trait SymbolLookup {
    fn resolve(&self, addr: Address) -> Option<Symbol<'_>>;
}

/// Resolves nothing, reports show raw addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSymbols;

impl SymbolLookup for NoSymbols {
    fn resolve(&self, _addr: Address) -> Option<Symbol<'_>> {
        None
    }
}

impl<L: SymbolLookup + ?Sized> SymbolLookup for &L {
    fn resolve(&self, addr: Address) -> Option<Symbol<'_>> {
        (**self).resolve(addr)
    }
}

impl<L: SymbolLookup> SymbolLookup for Option<L> {
    fn resolve(&self, addr: Address) -> Option<Symbol<'_>> {
        self.as_ref().and_then(|l| l.resolve(addr))
    }
}

/// Function symbols sorted by start address.
///
/// An address resolves to the closest function at or below it, as long as it
/// lies inside that function. A function ends at its size when `nm -S` gave
/// one, and otherwise at the next non-text symbol. Addresses past the last
/// known end do not resolve.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    functions: Vec<Function>,
    // starts of data, bss and other non-text symbols
    boundaries: Vec<Address>,
}

#[derive(Debug, Clone)]
struct Function {
    start: Address,
    size: Option<usize>,
    name: String,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the output of `nm -n $BINARY` or `nm -nS $BINARY`.
    ///
    /// Text symbols (`T`, `t`, `W`, `w`) become functions. Other defined
    /// symbols only mark where the preceding function ends. Lines that do not
    /// look like `<hex address> [<hex size>] <type> <name>` are skipped.
    pub fn parse_nm(text: &str) -> Self {
        let mut table = Self::new();
        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (addr, size, kind, name) = match fields.as_slice() {
                [addr, kind, name] => (*addr, None, *kind, *name),
                [addr, size, kind, name] => match parse_hex(size) {
                    Some(size) => (*addr, Some(size), *kind, *name),
                    None => continue,
                },
                _ => continue,
            };
            let addr = match parse_hex(addr) {
                Some(addr) => addr,
                None => continue,
            };
            match kind {
                "T" | "t" | "W" | "w" => table.functions.push(Function {
                    start: addr,
                    size,
                    name: name.to_string(),
                }),
                // absolute and debug symbols say nothing about the text layout
                "A" | "a" | "N" | "U" => {}
                _ => table.boundaries.push(addr),
            }
        }
        table.sort();
        log::debug!(
            "stackprof: loaded {} symbols, {} boundaries",
            table.len(),
            table.boundaries.len()
        );
        table
    }

    /// Adds a function whose extent is only bounded by what follows it.
    pub fn insert(&mut self, addr: Address, name: &str) {
        self.push(addr, None, name);
    }

    /// Adds a function covering `[addr, addr + size)`.
    pub fn insert_sized(&mut self, addr: Address, size: usize, name: &str) {
        self.push(addr, Some(size), name);
    }

    /// Number of functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn push(&mut self, start: Address, size: Option<usize>, name: &str) {
        self.functions.push(Function {
            start,
            size,
            name: name.to_string(),
        });
        self.sort();
    }

    fn sort(&mut self) {
        self.functions.sort_by_key(|f| f.start);
        // several aliases may share an address, keep the first
        self.functions.dedup_by_key(|f| f.start);
        self.boundaries.sort_unstable();
        self.boundaries.dedup();
    }
}

impl SymbolLookup for SymbolTable {
    fn resolve(&self, addr: Address) -> Option<Symbol<'_>> {
        let idx = match self.functions.binary_search_by_key(&addr, |f| f.start) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let function = &self.functions[idx];
        let offset = addr - function.start;

        if let Some(size) = function.size {
            if offset >= size {
                return None;
            }
        }
        // a non-text symbol between the function and `addr` ends the function
        let below = self.boundaries.partition_point(|&b| b <= addr);
        if below > 0 && self.boundaries[below - 1] > function.start {
            return None;
        }

        Some(Symbol {
            name: &function.name,
            offset,
        })
    }
}

fn parse_hex(text: &str) -> Option<usize> {
    usize::from_str_radix(text.trim_start_matches("0x"), 16).ok()
}
