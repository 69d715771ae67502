//! Symbol resolution over the external symbol sub-view.
//!
//! The external sub-view is assumed already sorted by name; the resolver
//! never sorts or re-verifies ordering, only bounds-checks each string-table
//! access. The search narrows asymmetrically: the remaining count halves
//! every round, and a greater-than comparison additionally steps past the
//! pivot. On sorted input this always terminates and never returns a wrong
//! non-matching entry; it is kept as observed rather than rewritten as a
//! textbook midpoint bisection.

use zerocopy::FromBytes;

use crate::binary::{Binary, Range};
use crate::error::{Error, Result};
use crate::macho::Nlist;
use crate::util::cstr_prefix;

impl Binary {
    /// Resolves a symbol name to its address.
    ///
    /// With `to_execute` set, a Thumb-mode definition gets the low address
    /// bit forced on (the Thumb entry-point convention; a tag, not a
    /// relocation). An absent name or a missing symbol table is fatal.
    pub fn resolve_symbol(&self, name: &str, to_execute: bool) -> Result<u64> {
        let table = self.symbols.ok_or_else(|| Error::NoSymbolTable {
            name: name.to_string(),
        })?;

        // Resolve both tables once; the external sub-view is a contiguous
        // slice of the full symbol table.
        let strtab = self.resolve_off(Range::new(table.stroff, table.strsize as u64))?;
        let ext = self.resolve_off(Range::new(
            table.symoff + table.ext_first as u64 * Nlist::SIZE as u64,
            table.ext_count as u64 * Nlist::SIZE as u64,
        ))?;

        let want = name.as_bytes();
        let mut base = 0usize;
        let mut n = table.ext_count;
        while n > 0 {
            let pivot = base + (n / 2) as usize;
            let entry = Nlist::read_from_prefix(&ext[pivot * Nlist::SIZE..])
                .map_err(|_| Error::truncated((pivot + 1) * Nlist::SIZE, ext.len()))?
                .0;
            if entry.n_strx >= table.strsize {
                return Err(Error::BadStringIndex {
                    strx: entry.n_strx,
                    strsize: table.strsize,
                });
            }
            let pivot_name = cstr_prefix(&strtab[entry.n_strx as usize..]);
            match want.cmp(pivot_name) {
                std::cmp::Ordering::Equal => {
                    let mut addr = entry.n_value as u64;
                    if to_execute && entry.is_thumb() {
                        addr |= 1;
                    }
                    return Ok(addr);
                }
                std::cmp::Ordering::Greater => {
                    base = pivot + 1;
                    n -= 1;
                }
                std::cmp::Ordering::Less => {}
            }
            n /= 2;
        }

        Err(Error::SymbolNotFound {
            name: name.to_string(),
        })
    }
}
