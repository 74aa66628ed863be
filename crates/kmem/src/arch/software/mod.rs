//! Software emulation of the machine, for tests and host-side development.
//!
//! Physical memory is a zeroed, page-aligned host buffer. The first frames of that
//! buffer play the part of the kernel image: they hold the kernel page tables and the
//! boot page directory, exactly where the hardware backend keeps them in `.bss`.
//!
//! CPU state (interrupt flag, page directory register, TLB) is emulated per thread so
//! tests running in parallel never observe each other.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::vec::Vec;

use crate::paging::{KERNEL_NUM_TABLES, PAGE_SIZE, PageTable};
use crate::{PhysAddr, VirtAddr};

/// Frames taken up by the emulated kernel image: the kernel tables and the boot
/// directory.
pub const IMAGE_FRAMES: usize = KERNEL_NUM_TABLES + 1;

std::thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
    static ACTIVE_DIRECTORY: Cell<Option<PhysAddr>> = const { Cell::new(None) };
    static INVALIDATIONS: RefCell<Vec<VirtAddr>> = const { RefCell::new(Vec::new()) };
}

/// Returns whether interrupts are enabled on this (emulated) CPU.
pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.with(Cell::get)
}

/// Disables interrupts.
pub fn disable_interrupts() {
    INTERRUPTS_ENABLED.with(|flag| flag.set(false));
}

/// Enables interrupts.
pub fn enable_interrupts() {
    INTERRUPTS_ENABLED.with(|flag| flag.set(true));
}

/// Records a TLB invalidation of the page containing `virt`.
pub fn invalidate_page(virt: VirtAddr) {
    INVALIDATIONS.with(|log| log.borrow_mut().push(virt.page_base()));
}

/// Drains the log of invalidated pages, oldest first.
pub fn take_invalidations() -> Vec<VirtAddr> {
    INVALIDATIONS.with(|log| core::mem::take(&mut *log.borrow_mut()))
}

/// Returns the physical address of the loaded page directory.
pub fn active_directory() -> Option<PhysAddr> {
    ACTIVE_DIRECTORY.with(Cell::get)
}

/// Loads a page directory.
///
/// # Safety
/// On hardware this switches address spaces. The emulation only records the value, but
/// callers must uphold the same contract: `directory` is a valid page directory that
/// maps the running kernel.
pub unsafe fn load_directory(directory: PhysAddr) {
    ACTIVE_DIRECTORY.with(|active| active.set(Some(directory)));
}

/// Emulated physical memory.
pub struct PhysicalMemory {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the buffer is owned exclusively by this value; access is serialized by the
// memory manager's locks.
unsafe impl Send for PhysicalMemory {}
unsafe impl Sync for PhysicalMemory {}

impl PhysicalMemory {
    /// Creates `size` bytes of zeroed physical memory.
    ///
    /// # Panics
    /// Panics if `size` is not a whole number of pages, cannot hold the emulated kernel
    /// image, or does not fit a 32-bit physical address space.
    pub fn new(size: usize) -> Self {
        assert!(size % PAGE_SIZE == 0, "memory size must be a multiple of the page size");
        assert!(size > IMAGE_FRAMES * PAGE_SIZE, "memory too small for the kernel image");
        assert!(u32::try_from(size).is_ok(), "memory exceeds 32-bit physical space");

        let base = NonNull::new(unsafe { alloc_zeroed(Self::layout(size)) })
            .unwrap_or_else(|| std::alloc::handle_alloc_error(Self::layout(size)));
        Self { base, size }
    }

    /// Returns the size of the emulated memory in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the end of the emulated kernel image. The image starts at address 0.
    pub fn image_end(&self) -> PhysAddr {
        PhysAddr::new((IMAGE_FRAMES * PAGE_SIZE) as u32)
    }

    /// Returns the first of the `KERNEL_NUM_TABLES` contiguous kernel page tables.
    pub fn kernel_tables(&self) -> NonNull<PageTable> {
        self.base.cast()
    }

    /// Returns the physical address of the first kernel page table.
    pub fn kernel_tables_phys(&self) -> PhysAddr {
        PhysAddr::new(0)
    }

    /// Returns the boot page directory.
    pub fn boot_directory(&self) -> NonNull<PageTable> {
        // SAFETY: the image frames are inside the buffer.
        unsafe { self.kernel_tables().add(KERNEL_NUM_TABLES) }
    }

    /// Returns the physical address of the boot page directory.
    pub fn boot_directory_phys(&self) -> PhysAddr {
        PhysAddr::new((KERNEL_NUM_TABLES * PAGE_SIZE) as u32)
    }

    /// Returns a pointer through which the kernel reaches `virt`, currently mapped to
    /// `phys`.
    ///
    /// Window addresses do not exist on the host, so the pointer is derived from the
    /// physical address instead.
    pub fn pointer_to(&self, _virt: VirtAddr, phys: PhysAddr) -> Option<NonNull<u8>> {
        if phys.as_usize() >= self.size {
            return None;
        }
        // SAFETY: bounds checked above.
        Some(unsafe { self.base.add(phys.as_usize()) })
    }

    fn layout(size: usize) -> Layout {
        // Size is non-zero and PAGE_SIZE is a power of two.
        match Layout::from_size_align(size, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid emulated memory layout"),
        }
    }
}

impl Drop for PhysicalMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.size)) };
    }
}
