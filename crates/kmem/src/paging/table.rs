//! Page directory / page table layout.

use super::{ENTRIES_PER_TABLE, entry::PageEntry};

/// One page of paging entries.
///
/// The same layout serves as a page directory (entries point at page tables) and as a
/// page table (entries point at frames). Instances live in physical memory: either in
/// the statically reserved kernel area or in frames handed out by the buddy allocator.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Creates a new, empty table.
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::EMPTY; ENTRIES_PER_TABLE],
        }
    }

    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 1024.
    pub fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 1024.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.entries[index]
    }

    /// Clears every entry in `range`.
    pub fn clear_range(&mut self, range: core::ops::Range<usize>) {
        for entry in &mut self.entries[range] {
            entry.clear();
        }
    }

    /// Iterates over `(index, entry)` pairs for present entries within `range`.
    pub fn present(
        &self,
        range: core::ops::Range<usize>,
    ) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        let start = range.start;
        self.entries[range]
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_present())
            .map(move |(offset, entry)| (start + offset, *entry))
    }

    /// Returns the number of entries in a table.
    pub const fn len(&self) -> usize {
        ENTRIES_PER_TABLE
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
