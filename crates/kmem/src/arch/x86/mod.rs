//! x86 hardware backend.
//!
//! The kernel is linked in the higher half: physical address `p` of the kernel image
//! is reachable at `KERNEL_VIRTUAL_BASE + p`. The kernel page tables and the boot page
//! directory are statically reserved in the image and handed out once through
//! [`PhysicalMemory::take`].

mod cpu;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::paging::{KERNEL_NUM_TABLES, KERNEL_VIRTUAL_BASE, PageTable};
use crate::{PhysAddr, VirtAddr};

pub use cpu::{
    active_directory, disable_interrupts, enable_interrupts, interrupts_enabled,
    invalidate_page, load_directory,
};

#[repr(C, align(4096))]
struct KernelPaging {
    tables: [PageTable; KERNEL_NUM_TABLES],
    directory: PageTable,
}

static mut KERNEL_PAGING: KernelPaging = KernelPaging {
    tables: [const { PageTable::new() }; KERNEL_NUM_TABLES],
    directory: PageTable::new(),
};

static TAKEN: AtomicBool = AtomicBool::new(false);

/// Exclusive access to the statically reserved kernel paging structures.
pub struct PhysicalMemory {
    paging: NonNull<KernelPaging>,
}

// SAFETY: there is exactly one instance; access is serialized by the memory manager.
unsafe impl Send for PhysicalMemory {}
unsafe impl Sync for PhysicalMemory {}

impl PhysicalMemory {
    /// Takes the kernel paging structures. Returns `None` after the first call.
    pub fn take() -> Option<Self> {
        if TAKEN.swap(true, Ordering::AcqRel) {
            return None;
        }

        let paging = NonNull::new(&raw mut KERNEL_PAGING)?;
        Some(Self { paging })
    }

    /// Returns the first of the `KERNEL_NUM_TABLES` contiguous kernel page tables.
    pub fn kernel_tables(&self) -> NonNull<PageTable> {
        // SAFETY: the pointer is derived from a live static.
        unsafe { NonNull::new_unchecked(&raw mut (*self.paging.as_ptr()).tables).cast() }
    }

    /// Returns the physical address of the first kernel page table.
    pub fn kernel_tables_phys(&self) -> PhysAddr {
        image_phys(self.kernel_tables().cast())
    }

    /// Returns the boot page directory.
    pub fn boot_directory(&self) -> NonNull<PageTable> {
        // SAFETY: the pointer is derived from a live static.
        unsafe { NonNull::new_unchecked(&raw mut (*self.paging.as_ptr()).directory) }
    }

    /// Returns the physical address of the boot page directory.
    pub fn boot_directory_phys(&self) -> PhysAddr {
        image_phys(self.boot_directory().cast())
    }

    /// Returns a pointer through which the kernel reaches `virt`.
    pub fn pointer_to(&self, virt: VirtAddr, _phys: PhysAddr) -> Option<NonNull<u8>> {
        NonNull::new(virt.as_mut_ptr())
    }
}

fn image_phys(ptr: NonNull<u8>) -> PhysAddr {
    PhysAddr::new((ptr.as_ptr() as usize as u32).wrapping_sub(KERNEL_VIRTUAL_BASE))
}
