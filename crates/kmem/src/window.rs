//! The kernel virtual window.
//!
//! The whole kernel region (`KERNEL_VIRTUAL_BASE` upwards) is backed by the statically
//! reserved kernel page tables. Pages are mapped into it in order, from a cursor that
//! only ever grows: the first mapping made at boot is the kernel image itself, so image
//! addresses keep their higher-half identity (`KERNEL_VIRTUAL_BASE + phys`).
//!
//! Slots are never reclaimed. Mapping the same frame twice yields two distinct
//! addresses.

use core::fmt;
use core::ptr::NonNull;

use crate::arch;
use crate::paging::{
    ENTRIES_PER_TABLE, KERNEL_FIRST_TABLE, KERNEL_NUM_TABLES, KERNEL_VIRTUAL_BASE, PAGE_SIZE,
    PageEntry, PageFlags, PageTable,
};
use crate::{PhysAddr, VirtAddr};

/// Errors reported by the kernel window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowError {
    /// The kernel region has no room for the requested number of pages.
    Exhausted,
}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowError::Exhausted => f.write_str("kernel window exhausted"),
        }
    }
}

/// Allocation cursor over the kernel page tables.
pub struct KernelWindow {
    tables: NonNull<PageTable>,
    next_slot: usize,
}

// SAFETY: the window owns the kernel tables; the memory manager serializes access.
unsafe impl Send for KernelWindow {}

impl KernelWindow {
    /// Number of pages the window can ever map.
    pub const CAPACITY: usize = KERNEL_NUM_TABLES * ENTRIES_PER_TABLE;

    /// Creates a window over the kernel page tables, with the cursor at the start of the
    /// kernel region.
    ///
    /// # Safety
    /// `tables` must point to `KERNEL_NUM_TABLES` contiguous page tables that stay valid
    /// for the lifetime of the window and are not written through any other path.
    pub unsafe fn new(tables: NonNull<PageTable>) -> Self {
        Self {
            tables,
            next_slot: 0,
        }
    }

    /// Maps `count` contiguous physical pages starting at the page containing `phys`
    /// into the next free slots, returning the address of `phys` inside the mapping.
    ///
    /// The offset of `phys` within its page is preserved in the returned address.
    pub fn map(&mut self, phys: PhysAddr, count: usize) -> Result<VirtAddr, WindowError> {
        if count > Self::CAPACITY - self.next_slot {
            return Err(WindowError::Exhausted);
        }

        let first_slot = self.next_slot;
        let base = phys.page_base();
        for i in 0..count {
            let slot = first_slot + i;
            let frame = base + (i * PAGE_SIZE) as u32;
            *self
                .table_mut(slot / ENTRIES_PER_TABLE)
                .entry_mut(slot % ENTRIES_PER_TABLE) = PageEntry::new(frame, PageFlags::kernel());
            arch::invalidate_page(Self::slot_address(slot));
        }
        self.next_slot += count;

        let virt = Self::slot_address(first_slot) + phys.page_offset();
        log::trace!("window: mapped {count} page(s) at {phys} -> {virt}");
        Ok(virt)
    }

    /// Returns the physical address `virt` is mapped to, if it is a mapped kernel
    /// address.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        if !virt.is_kernel() {
            return None;
        }

        let table = virt.directory_index() - KERNEL_FIRST_TABLE;
        let entry = self.table(table).entry(virt.table_index());
        entry.address().map(|frame| frame + virt.page_offset())
    }

    /// Returns a pointer through which `virt` can be dereferenced.
    pub fn pointer(&self, memory: &arch::PhysicalMemory, virt: VirtAddr) -> Option<NonNull<u8>> {
        let phys = self.translate(virt)?;
        memory.pointer_to(virt, phys)
    }

    /// Returns the number of slots handed out so far.
    pub fn mapped_pages(&self) -> usize {
        self.next_slot
    }

    /// Returns the number of slots still available.
    pub fn remaining_pages(&self) -> usize {
        Self::CAPACITY - self.next_slot
    }

    fn slot_address(slot: usize) -> VirtAddr {
        VirtAddr::new(KERNEL_VIRTUAL_BASE + (slot * PAGE_SIZE) as u32)
    }

    fn table(&self, index: usize) -> &PageTable {
        assert!(index < KERNEL_NUM_TABLES);
        // SAFETY: in bounds; validity guaranteed by the constructor's contract.
        unsafe { self.tables.add(index).as_ref() }
    }

    fn table_mut(&mut self, index: usize) -> &mut PageTable {
        assert!(index < KERNEL_NUM_TABLES);
        // SAFETY: in bounds; validity guaranteed by the constructor's contract.
        unsafe { self.tables.add(index).as_mut() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(memory: &arch::PhysicalMemory) -> KernelWindow {
        unsafe { KernelWindow::new(memory.kernel_tables()) }
    }

    #[test]
    fn maps_from_the_start_of_the_kernel_region() {
        let memory = arch::PhysicalMemory::new(512 * PAGE_SIZE);
        let mut window = window(&memory);

        let virt = window.map(PhysAddr::new(0), 4).unwrap();
        assert_eq!(virt, VirtAddr::new(KERNEL_VIRTUAL_BASE));
        assert_eq!(window.translate(VirtAddr::new(0xC000_3010)), Some(PhysAddr::new(0x3010)));
        assert_eq!(window.mapped_pages(), 4);
    }

    #[test]
    fn preserves_page_offset() {
        let memory = arch::PhysicalMemory::new(512 * PAGE_SIZE);
        let mut window = window(&memory);
        window.map(PhysAddr::new(0), 2).unwrap();

        let virt = window.map(PhysAddr::new(0x0012_3456), 1).unwrap();
        assert_eq!(virt, VirtAddr::new(0xC000_2456));
        assert_eq!(window.translate(virt), Some(PhysAddr::new(0x0012_3456)));
    }

    #[test]
    fn same_frame_twice_gets_two_slots() {
        let memory = arch::PhysicalMemory::new(512 * PAGE_SIZE);
        let mut window = window(&memory);
        arch::take_invalidations();

        let first = window.map(PhysAddr::new(0x5000), 1).unwrap();
        let second = window.map(PhysAddr::new(0x5000), 1).unwrap();

        assert_ne!(first, second);
        assert_eq!(window.translate(first), window.translate(second));
        assert_eq!(arch::take_invalidations(), [first, second]);
    }

    #[test]
    fn mappings_alias_the_same_memory() {
        let memory = arch::PhysicalMemory::new(512 * PAGE_SIZE);
        let mut window = window(&memory);
        window.map(PhysAddr::new(0), 300).unwrap();

        let first = window.map(PhysAddr::new(0x0013_0000), 1).unwrap();
        let second = window.map(PhysAddr::new(0x0013_0000), 1).unwrap();
        let a = window.pointer(&memory, first).unwrap();
        let b = window.pointer(&memory, second).unwrap();
        unsafe {
            a.as_ptr().write(0xAB);
            assert_eq!(b.as_ptr().read(), 0xAB);
        }
    }

    #[test]
    fn crosses_table_boundaries() {
        let memory = arch::PhysicalMemory::new(512 * PAGE_SIZE);
        let mut window = window(&memory);
        window.map(PhysAddr::new(0), ENTRIES_PER_TABLE - 1).unwrap();

        let virt = window.map(PhysAddr::new(0x0040_0000), 2).unwrap();
        assert_eq!(virt.directory_index(), KERNEL_FIRST_TABLE);
        let next = virt + PAGE_SIZE as u32;
        assert_eq!(next.directory_index(), KERNEL_FIRST_TABLE + 1);
        assert_eq!(window.translate(next), Some(PhysAddr::new(0x0040_1000)));
    }

    #[test]
    fn unmapped_and_user_addresses_do_not_translate() {
        let memory = arch::PhysicalMemory::new(512 * PAGE_SIZE);
        let mut window = window(&memory);
        window.map(PhysAddr::new(0), 1).unwrap();

        assert_eq!(window.translate(VirtAddr::new(0xC000_1000)), None);
        assert_eq!(window.translate(VirtAddr::new(0x0000_1000)), None);
    }

    #[test]
    fn refuses_to_overflow() {
        let memory = arch::PhysicalMemory::new(512 * PAGE_SIZE);
        let mut window = window(&memory);
        window.next_slot = KernelWindow::CAPACITY - 1;

        assert_eq!(window.map(PhysAddr::new(0), 2), Err(WindowError::Exhausted));
        assert!(window.map(PhysAddr::new(0), 1).is_ok());
        assert_eq!(window.remaining_pages(), 0);
    }
}
