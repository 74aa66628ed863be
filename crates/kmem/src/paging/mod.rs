//! 32-bit two-level paging structures.
//!
//! A page directory and a page table share one layout: 1024 four-byte entries filling
//! exactly one page. The top `KERNEL_NUM_TABLES` directory slots cover the kernel
//! region starting at `KERNEL_VIRTUAL_BASE`; the rest is per-task user space.

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::PageTable;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Number of entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Start of the kernel half of every address space.
pub const KERNEL_VIRTUAL_BASE: u32 = 0xC000_0000;

/// Number of page tables covering the kernel region (1 GiB).
pub const KERNEL_NUM_TABLES: usize = 256;

/// Number of directory slots available to user space.
pub const USER_NUM_TABLES: usize = ENTRIES_PER_TABLE - KERNEL_NUM_TABLES;

/// Directory index of the first kernel page table.
pub const KERNEL_FIRST_TABLE: usize = (KERNEL_VIRTUAL_BASE >> 22) as usize;

/// Bytes of virtual address space covered by one page table.
pub const TABLE_EXTENT: usize = PAGE_SIZE * ENTRIES_PER_TABLE;

const _: () = assert!(KERNEL_FIRST_TABLE == USER_NUM_TABLES);
const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);
