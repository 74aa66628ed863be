#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
#![feature(step_trait)]

//! # kmem
//!
//! Memory management core of a 32-bit x86 kernel with two-level paging. It provides:
//!
//! - A buddy allocator over the Page Frame Table, one descriptor per physical frame.
//! - The kernel virtual window: the higher-half region in which physical pages are
//!   mapped on demand for the kernel to use.
//! - Object caches with per-page embedded freelists, and `kalloc`/`kfree` on top of a
//!   ladder of power-of-two caches.
//! - Per-task page directories sharing the kernel half.
//!
//! Tests (and the `software-emulation` feature) run the same code against an emulated
//! machine instead of the x86 hardware backend.

mod address;
mod address_space;
mod arch;
mod buddy;
mod cache;
mod frame;
mod frame_table;
mod global;
mod human_size;
mod manager;
mod memmap;
mod numbers;
pub mod paging;
mod sync;
mod window;

pub use address::{PhysAddr, VirtAddr};
pub use address_space::AddressSpace;
pub use buddy::{AllocError, BuddyAllocator, MAX_BLOCK_FRAMES, MAX_ORDER, order_for};
pub use cache::{
    Cache, CacheError, CacheStats, FREELIST_END, HEADER_SIZE, KALLOC_MAX, KALLOC_NUM_CACHES,
    KALLOC_SHIFT_MAX, KALLOC_SHIFT_MIN, PageSource, PageState, SizeClasses, objects_per_page,
    size_class,
};
pub use frame::{AllocFlags, FrameFlag, FrameFlags, PageDescriptor, PageHandle};
pub use frame_table::{FreeList, FreeListIter, PageFrameTable};
pub use global::{
    alloc_page, alloc_pages, build_page_dir, cache_alloc, cache_create, cache_free, claim_pages,
    copy_address_space, free_page, free_pages, install, kalloc, kfree, manager, map_pages,
    page_to_phys, page_to_virt, phys_to_page, try_manager, user_map_page, user_map_pages,
};
pub use human_size::HumanSize;
pub use manager::{MemoryError, MemoryManager, MemoryStats};
pub use memmap::{BootMemoryRegion, InitError, MAX_FRAMES, MAX_RESERVATIONS, MemoryMap};
pub use numbers::FrameNumber;
pub use sync::{InterruptGuard, IrqSpinLock, IrqSpinLockGuard};
pub use window::{KernelWindow, WindowError};

pub use arch::PhysicalMemory;
#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{IMAGE_FRAMES, active_directory, take_invalidations};
