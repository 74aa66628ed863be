//! The kernel-wide memory manager.
//!
//! The kernel brings the manager up once during boot and installs it here; everything
//! else reaches it through the free functions below.

use core::ptr::NonNull;

use spin::Once;

use crate::{
    AddressSpace, AllocFlags, Cache, FrameNumber, MemoryManager, PageHandle, PhysAddr, VirtAddr,
};

static MANAGER: Once<MemoryManager> = Once::new();

/// Publishes `manager` as the kernel's memory manager.
///
/// # Panics
/// Panics if a manager is already installed.
pub fn install(manager: MemoryManager) -> &'static MemoryManager {
    let mut installed = false;
    let manager = MANAGER.call_once(|| {
        installed = true;
        manager
    });
    assert!(installed, "memory manager already installed");
    manager
}

/// Returns the installed memory manager.
///
/// # Panics
/// Panics if no manager is installed yet.
pub fn manager() -> &'static MemoryManager {
    match MANAGER.get() {
        Some(manager) => manager,
        None => panic!("memory manager used before initialization"),
    }
}

/// Returns the installed memory manager, if any.
pub fn try_manager() -> Option<&'static MemoryManager> {
    MANAGER.get()
}

/// Allocates one page. See [`MemoryManager::alloc_page`].
pub fn alloc_page(flags: AllocFlags) -> PageHandle {
    manager().alloc_page(flags)
}

/// Allocates exactly `count` contiguous pages.
pub fn alloc_pages(count: usize, flags: AllocFlags) -> PageHandle {
    manager().alloc_pages(count, flags)
}

/// Frees one page.
pub fn free_page(page: PageHandle) {
    manager().free_page(page);
}

/// Frees a run returned by [`alloc_pages`].
pub fn free_pages(page: PageHandle, count: usize) {
    manager().free_pages(page, count);
}

/// Returns the physical address of a page.
pub fn page_to_phys(page: PageHandle) -> PhysAddr {
    manager().page_to_phys(page)
}

/// Returns the kernel window address of a page, mapping it on first use.
pub fn page_to_virt(page: PageHandle) -> VirtAddr {
    manager().page_to_virt(page)
}

/// Returns the page containing a physical address.
pub fn phys_to_page(phys: PhysAddr) -> PageHandle {
    manager().phys_to_page(phys)
}

/// Maps `count` physical pages into the kernel window.
pub fn map_pages(phys: PhysAddr, count: usize) -> VirtAddr {
    manager().map_pages(phys, count)
}

/// Returns frames reserved at boot to the allocator.
pub fn claim_pages(start: FrameNumber, count: usize) {
    manager().claim_pages(start, count);
}

/// Creates an object cache.
pub fn cache_create(object_size: usize) -> &'static Cache {
    manager().cache_create(object_size)
}

/// Allocates an object from `cache`.
pub fn cache_alloc(cache: &Cache) -> NonNull<u8> {
    manager().cache_alloc(cache)
}

/// Returns an object to `cache`.
pub fn cache_free(cache: &Cache, ptr: NonNull<u8>) {
    manager().cache_free(cache, ptr);
}

/// Allocates `size` bytes, at most [`crate::KALLOC_MAX`].
pub fn kalloc(size: usize) -> NonNull<u8> {
    manager().kalloc(size)
}

/// Frees memory from [`kalloc`]; `size` is the size that was requested.
pub fn kfree(ptr: NonNull<u8>, size: usize) {
    manager().kfree(ptr, size);
}

/// Rebuilds a page directory with an empty user half.
pub fn build_page_dir(directory: PageHandle) {
    manager().build_page_dir(directory);
}

/// Gives `to` a private copy of every user page mapped in `from`.
pub fn copy_address_space(to: &AddressSpace, from: &AddressSpace) {
    manager().copy_address_space(to, from);
}

/// Maps one user page of `space`.
pub fn user_map_page(space: &AddressSpace, virt: VirtAddr, phys: PhysAddr) {
    manager().user_map_page(space, virt, phys);
}

/// Maps `count` consecutive user pages of `space`.
pub fn user_map_pages(space: &AddressSpace, virt: VirtAddr, phys: PhysAddr, count: usize) {
    manager().user_map_pages(space, virt, phys, count);
}
