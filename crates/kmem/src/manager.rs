//! The kernel memory manager.
//!
//! [`MemoryManager`] ties the pieces together: the buddy allocator over the Page Frame
//! Table, the kernel window, the bootstrap meta cache and the `kalloc` size classes.
//! Each piece has its own [`IrqSpinLock`]; when more than one is held they are taken in
//! the order cache, buddy, window.
//!
//! Every operation comes in two layers. The `try_*` layer (and [`MemoryError`]) reports
//! failures as values. The kernel-facing layer panics with a diagnostic, because an
//! allocation failure inside the kernel has no recovery path.

use core::fmt;
use core::mem::{MaybeUninit, size_of};
use core::ptr::NonNull;

use crate::buddy::{AllocError, BuddyAllocator, MAX_ORDER};
use crate::cache::{Cache, CacheError, KALLOC_MAX, KALLOC_NUM_CACHES, PageSource, SizeClasses};
use crate::frame_table::PageFrameTable;
use crate::memmap::{BootMemoryRegion, InitError, MemoryMap};
use crate::paging::PAGE_SIZE;
use crate::sync::IrqSpinLock;
use crate::window::{KernelWindow, WindowError};
use crate::{
    AllocFlags, FrameFlag, FrameFlags, FrameNumber, HumanSize, PageDescriptor, PageHandle,
    PhysAddr, VirtAddr, address_space, arch,
};

/// Errors reported by the memory manager's recoverable layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The buddy allocator refused the request.
    Alloc(AllocError),
    /// The kernel window is full.
    Window(WindowError),
    /// The address is not backed by memory the kernel can reach.
    Unreachable(VirtAddr),
}

impl From<AllocError> for MemoryError {
    fn from(error: AllocError) -> Self {
        MemoryError::Alloc(error)
    }
}

impl From<WindowError> for MemoryError {
    fn from(error: WindowError) -> Self {
        MemoryError::Window(error)
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::Alloc(error) => write!(f, "{error}"),
            MemoryError::Window(error) => write!(f, "{error}"),
            MemoryError::Unreachable(virt) => write!(f, "{virt} is not reachable"),
        }
    }
}

/// Usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Frames handed to the buddy allocator.
    pub total_frames: usize,
    /// Frames on the free lists.
    pub free_frames: usize,
    /// Frames allocated.
    pub used_frames: usize,
    /// Free blocks per order.
    pub free_blocks: [usize; MAX_ORDER + 1],
    /// Kernel window slots in use.
    pub window_pages: usize,
    /// Frames holding the Page Frame Table.
    pub table_frames: usize,
}

/// Page-granularity allocation: the buddy allocator plus the kernel window.
struct PageAllocator {
    buddy: IrqSpinLock<BuddyAllocator>,
    window: IrqSpinLock<KernelWindow>,
    table_start: FrameNumber,
    table_frames: usize,
    // Backs the Page Frame Table; must outlive `buddy`.
    memory: arch::PhysicalMemory,
}

impl PageAllocator {
    fn alloc(&self, count: usize, flags: AllocFlags) -> Result<PageHandle, MemoryError> {
        let mut buddy = self.buddy.lock();
        let frame = buddy.allocate_exact(count)?;

        match self.prepare(&mut buddy, frame, count, flags) {
            Ok(()) => Ok(PageHandle::new(frame)),
            Err(error) => {
                buddy.free_exact(frame, count)?;
                Err(error)
            }
        }
    }

    fn alloc_block(&self, order: usize, flags: AllocFlags) -> Result<PageHandle, MemoryError> {
        let mut buddy = self.buddy.lock();
        let frame = buddy.allocate(order)?;

        match self.prepare(&mut buddy, frame, 1 << order, flags) {
            Ok(()) => Ok(PageHandle::new(frame)),
            Err(error) => {
                buddy.free(frame, order)?;
                Err(error)
            }
        }
    }

    fn prepare(
        &self,
        buddy: &mut BuddyAllocator,
        frame: FrameNumber,
        count: usize,
        flags: AllocFlags,
    ) -> Result<(), MemoryError> {
        if flags.contains(AllocFlags::CACHE) {
            for desc in buddy.table_mut().run_mut(frame, count) {
                desc.flags.set(FrameFlag::Cache);
            }
        }

        if flags.contains(AllocFlags::ZERO) {
            let virt = self.map_run(buddy, frame, count)?;
            let ptr = self.pointer(virt)?;
            // SAFETY: the run was just allocated and is mapped contiguously.
            unsafe { ptr.as_ptr().write_bytes(0, count * PAGE_SIZE) };
        }
        Ok(())
    }

    fn free(&self, page: PageHandle, count: usize) -> Result<(), MemoryError> {
        Ok(self.buddy.lock().free_exact(page.frame(), count)?)
    }

    fn free_block(&self, page: PageHandle, order: usize) -> Result<(), MemoryError> {
        Ok(self.buddy.lock().free(page.frame(), order)?)
    }

    fn claim(&self, start: FrameNumber, count: usize) -> Result<(), MemoryError> {
        let table_end = self.table_start + self.table_frames as u32;
        let end = start + count as u32;
        if count > 0 && start < table_end && self.table_start < end {
            return Err(AllocError::Permanent.into());
        }
        Ok(self.buddy.lock().claim(start, count)?)
    }

    /// Returns the window address of `count` frames starting at `frame`, reusing the
    /// mapping recorded in their descriptors when it is contiguous.
    fn map_run(
        &self,
        buddy: &mut BuddyAllocator,
        frame: FrameNumber,
        count: usize,
    ) -> Result<VirtAddr, MemoryError> {
        if count == 0 {
            return Err(AllocError::InvalidCount.into());
        }
        if frame.as_usize() + count > buddy.table().len() {
            return Err(AllocError::OutOfRange.into());
        }

        let run = buddy.table_mut().run_mut(frame, count);
        if let Some(first) = run[0].virt() {
            let contiguous = run
                .iter()
                .enumerate()
                .all(|(i, desc)| desc.virt() == Some(first + (i * PAGE_SIZE) as u32));
            if contiguous {
                return Ok(first);
            }
        }

        let virt = self.window.lock().map(frame.start(), count)?;
        for (i, desc) in run.iter_mut().enumerate() {
            desc.set_virt(virt + (i * PAGE_SIZE) as u32);
        }
        Ok(virt)
    }

    fn page_virt(&self, page: PageHandle, count: usize) -> Result<VirtAddr, MemoryError> {
        let mut buddy = self.buddy.lock();
        self.map_run(&mut buddy, page.frame(), count)
    }

    fn pointer(&self, virt: VirtAddr) -> Result<NonNull<u8>, MemoryError> {
        self.window
            .lock()
            .pointer(&self.memory, virt)
            .ok_or(MemoryError::Unreachable(virt))
    }

    fn stats(&self) -> MemoryStats {
        let (total_frames, free_frames, free_blocks) = {
            let buddy = self.buddy.lock();
            let mut free_blocks = [0; MAX_ORDER + 1];
            for (order, count) in free_blocks.iter_mut().enumerate() {
                *count = buddy.free_blocks_at_order(order);
            }
            (buddy.total_frames(), buddy.free_frames(), free_blocks)
        };

        MemoryStats {
            total_frames,
            free_frames,
            used_frames: total_frames - free_frames,
            free_blocks,
            window_pages: self.window.lock().mapped_pages(),
            table_frames: self.table_frames,
        }
    }
}

impl PageSource for PageAllocator {
    fn alloc_cache_page(&self) -> Result<(PageHandle, NonNull<u8>), MemoryError> {
        let page = self.alloc(1, AllocFlags::CACHE)?;
        match self.page_virt(page, 1).and_then(|virt| self.pointer(virt)) {
            Ok(ptr) => Ok((page, ptr)),
            Err(error) => {
                self.free(page, 1)?;
                Err(error)
            }
        }
    }

    fn free_cache_page(&self, page: PageHandle) {
        if let Err(error) = self.free(page, 1) {
            panic!("cache page {}: {error}", page.frame());
        }
    }
}

/// The kernel memory manager.
pub struct MemoryManager {
    size_classes: SizeClasses,
    meta_cache: Cache,
    pages: PageAllocator,
}

impl MemoryManager {
    /// Brings up memory management.
    ///
    /// The kernel image is mapped first, so the window starts right after it and image
    /// addresses keep their higher-half identity. The boot page directory is then built
    /// and loaded, the Page Frame Table is placed in the first usable run large enough to
    /// hold it, and every other usable frame is released to the buddy allocator.
    pub fn new<R: BootMemoryRegion>(
        mut map: MemoryMap<'_, R>,
        memory: arch::PhysicalMemory,
    ) -> Result<Self, InitError> {
        let frames = map.frame_count();
        if frames == 0 {
            return Err(InitError::NoUsableMemory);
        }
        let table_bytes = frames * size_of::<PageDescriptor>();
        let table_frames = table_bytes.div_ceil(PAGE_SIZE);
        let region = map
            .find_region(table_frames)
            .ok_or(InitError::NoContiguousRegion)?;

        // SAFETY: the kernel tables belong to `memory`, which the manager owns from here.
        let mut window = unsafe { KernelWindow::new(memory.kernel_tables()) };
        let image_end = map.kernel_image().end.align_up(PAGE_SIZE as u32);
        window
            .map(PhysAddr::new(0), image_end.as_usize() / PAGE_SIZE)
            .map_err(|_| InitError::WindowExhausted)?;

        // SAFETY: the boot directory is reserved in the image and nothing else writes it.
        unsafe {
            let directory = &mut *memory.boot_directory().as_ptr();
            address_space::fill_directory(directory, memory.kernel_tables_phys());
            arch::load_directory(memory.boot_directory_phys());
        }

        let table_virt = window
            .map(region.start(), table_frames)
            .map_err(|_| InitError::WindowExhausted)?;
        let storage = window
            .pointer(&memory, table_virt)
            .ok_or(InitError::NoContiguousRegion)?;
        map.reserve(region.start(), (region + table_frames as u32).start())?;
        // SAFETY: the run is usable memory reserved for the table above, mapped, and lives
        // as long as `memory`, which is dropped after the allocator.
        let storage = unsafe {
            core::slice::from_raw_parts_mut(
                storage.cast::<MaybeUninit<PageDescriptor>>().as_ptr(),
                frames,
            )
        };
        log::info!(
            "mm: page frame table at frame {region}, {frames} frames ({})",
            HumanSize::from(table_bytes)
        );

        let mut buddy = BuddyAllocator::new(PageFrameTable::new(storage));
        for (start, count) in map.usable_runs() {
            if let Err(error) = buddy.release_range(start, count) {
                log::warn!("mm: frames {start}+{count} not released: {error}");
            }
        }

        let unmanageable = map.unmanageable_bytes();
        if unmanageable > 0 {
            log::warn!(
                "mm: {} of memory above 4 GiB is not managed",
                HumanSize::from(unmanageable)
            );
        }
        log::info!(
            "mm: managing {} ({} free frames)",
            HumanSize::from(buddy.total_frames() * PAGE_SIZE),
            buddy.free_frames()
        );

        let pages = PageAllocator {
            buddy: IrqSpinLock::new(buddy),
            window: IrqSpinLock::new(window),
            table_start: region,
            table_frames,
            memory,
        };
        let meta_cache = Cache::bootstrap();
        let size_classes = SizeClasses::new(&meta_cache, &pages).map_err(|error| {
            log::warn!("mm: {error}");
            InitError::SizeClasses
        })?;
        log::info!("mm: kalloc ready, {KALLOC_NUM_CACHES} size classes up to {KALLOC_MAX} bytes");

        Ok(Self {
            size_classes,
            meta_cache,
            pages,
        })
    }

    /// Allocates one page.
    pub fn alloc_page(&self, flags: AllocFlags) -> PageHandle {
        self.alloc_pages(1, flags)
    }

    /// Allocates exactly `count` contiguous pages.
    pub fn alloc_pages(&self, count: usize, flags: AllocFlags) -> PageHandle {
        self.try_alloc_pages(count, flags)
            .unwrap_or_else(|error| self.fatal("alloc_pages", error))
    }

    /// Allocates exactly `count` contiguous pages, reporting failure.
    pub fn try_alloc_pages(
        &self,
        count: usize,
        flags: AllocFlags,
    ) -> Result<PageHandle, MemoryError> {
        self.pages.alloc(count, flags)
    }

    /// Frees one page.
    pub fn free_page(&self, page: PageHandle) {
        self.free_pages(page, 1);
    }

    /// Frees a run returned by [`MemoryManager::alloc_pages`].
    pub fn free_pages(&self, page: PageHandle, count: usize) {
        if let Err(error) = self.pages.free(page, count) {
            self.fatal("free_pages", error);
        }
    }

    /// Allocates a block of 2^order pages aligned to its size.
    pub fn alloc_block(&self, order: usize, flags: AllocFlags) -> PageHandle {
        self.pages
            .alloc_block(order, flags)
            .unwrap_or_else(|error| self.fatal("alloc_block", error))
    }

    /// Frees a block returned by [`MemoryManager::alloc_block`].
    pub fn free_block(&self, page: PageHandle, order: usize) {
        if let Err(error) = self.pages.free_block(page, order) {
            self.fatal("free_block", error);
        }
    }

    /// Returns `count` frames reserved at boot, starting at `start`, to the allocator.
    ///
    /// Used for boot modules once they are loaded and for init-only kernel memory. The
    /// frames must not be referenced afterwards.
    pub fn claim_pages(&self, start: FrameNumber, count: usize) {
        if let Err(error) = self.try_claim_pages(start, count) {
            self.fatal("claim_pages", error);
        }
    }

    /// Returns reserved frames to the allocator, reporting failure.
    pub fn try_claim_pages(&self, start: FrameNumber, count: usize) -> Result<(), MemoryError> {
        self.pages.claim(start, count)?;
        log::info!(
            "mm: claimed frames {start}+{count} ({})",
            HumanSize::from(count * PAGE_SIZE)
        );
        Ok(())
    }

    /// Returns the physical address of a page.
    pub fn page_to_phys(&self, page: PageHandle) -> PhysAddr {
        page.frame().start()
    }

    /// Returns the page containing a physical address.
    pub fn phys_to_page(&self, phys: PhysAddr) -> PageHandle {
        PageHandle::new(phys.frame_number())
    }

    /// Returns the kernel window address of a page, mapping it on first use.
    pub fn page_to_virt(&self, page: PageHandle) -> VirtAddr {
        self.pages_to_virt(page, 1)
    }

    /// Returns a contiguous kernel window address for `count` pages starting at `page`.
    pub fn pages_to_virt(&self, page: PageHandle, count: usize) -> VirtAddr {
        self.pages
            .page_virt(page, count)
            .unwrap_or_else(|error| self.fatal("page_to_virt", error))
    }

    /// Returns the physical address a kernel window address is mapped to.
    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.pages.window.lock().translate(virt)
    }

    /// Returns a pointer through which a kernel window address can be dereferenced.
    pub fn virt_to_ptr(&self, virt: VirtAddr) -> Option<NonNull<u8>> {
        self.pages.pointer(virt).ok()
    }

    /// Returns a pointer to the start of a page.
    pub fn page_ptr(&self, page: PageHandle) -> NonNull<u8> {
        let virt = self.page_to_virt(page);
        self.pages
            .pointer(virt)
            .unwrap_or_else(|error| self.fatal("page_ptr", error))
    }

    /// Maps `count` physical pages into the kernel window.
    pub fn map_pages(&self, phys: PhysAddr, count: usize) -> VirtAddr {
        self.pages
            .window
            .lock()
            .map(phys, count)
            .unwrap_or_else(|error| self.fatal("map_pages", error))
    }

    /// Returns the state flags of a frame.
    pub fn frame_flags(&self, page: PageHandle) -> Option<FrameFlags> {
        self.pages
            .buddy
            .lock()
            .table()
            .get(page.frame())
            .map(|desc| desc.flags)
    }

    /// Sets a state flag on an allocated frame.
    pub(crate) fn mark_frame(&self, page: PageHandle, flag: FrameFlag) {
        let mut buddy = self.pages.buddy.lock();
        if let Some(desc) = buddy.table_mut().get_mut(page.frame()) {
            debug_assert!(desc.flags.test(FrameFlag::Used), "marking a free frame");
            desc.flags.set(flag);
        }
    }

    /// Creates an object cache. Caches are never destroyed.
    pub fn cache_create(&self, object_size: usize) -> &Cache {
        Cache::create(&self.meta_cache, object_size, &self.pages)
            .unwrap_or_else(|error| self.fatal("cache_create", error))
    }

    /// Allocates an object from `cache`.
    pub fn cache_alloc(&self, cache: &Cache) -> NonNull<u8> {
        cache
            .alloc(&self.pages)
            .unwrap_or_else(|error| self.fatal("cache_alloc", error))
    }

    /// Returns an object to `cache`.
    pub fn cache_free(&self, cache: &Cache, ptr: NonNull<u8>) {
        cache.free(ptr);
    }

    /// Returns the empty pages of `cache` to the page allocator.
    pub fn cache_shrink(&self, cache: &Cache) -> usize {
        cache.shrink(&self.pages)
    }

    /// Allocates `size` bytes from the smallest size class that holds them.
    ///
    /// # Panics
    /// Panics if `size` exceeds [`KALLOC_MAX`] or memory is exhausted.
    pub fn kalloc(&self, size: usize) -> NonNull<u8> {
        self.size_classes
            .alloc(size, &self.pages)
            .unwrap_or_else(|error| match error {
                CacheError::ObjectSize(_) => panic!("kalloc: size {size} exceeds {KALLOC_MAX}"),
                CacheError::Memory(error) => self.fatal("kalloc", error),
            })
    }

    /// Frees memory returned by [`MemoryManager::kalloc`]. `size` must be the size that
    /// was requested.
    pub fn kfree(&self, ptr: NonNull<u8>, size: usize) {
        self.size_classes.free(ptr, size);
    }

    /// Returns the meta cache, which holds every [`Cache`] record.
    pub fn meta_cache(&self) -> &Cache {
        &self.meta_cache
    }

    /// Returns the `kalloc` size classes.
    pub fn size_classes(&self) -> &SizeClasses {
        &self.size_classes
    }

    /// Returns the usage counters.
    pub fn stats(&self) -> MemoryStats {
        self.pages.stats()
    }

    /// Returns the machine the manager runs on.
    pub fn memory(&self) -> &arch::PhysicalMemory {
        &self.pages.memory
    }

    #[cold]
    #[track_caller]
    fn fatal(&self, operation: &str, error: impl fmt::Display) -> ! {
        let stats = self.stats();
        panic!(
            "{operation}: {error} ({} of {} frames free, {} window pages used)",
            stats.free_frames, stats.total_frames, stats.window_pages
        );
    }
}

impl PageSource for MemoryManager {
    fn alloc_cache_page(&self) -> Result<(PageHandle, NonNull<u8>), MemoryError> {
        self.pages.alloc_cache_page()
    }

    fn free_cache_page(&self, page: PageHandle) {
        self.pages.free_cache_page(page);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arch::{IMAGE_FRAMES, PhysicalMemory};
    use crate::memmap::tests::TestRegion;
    use crate::paging::{ENTRIES_PER_TABLE, KERNEL_FIRST_TABLE, KERNEL_VIRTUAL_BASE, PageTable};

    pub(crate) const FRAMES: usize = 1024;

    fn table_frames(frames: usize) -> usize {
        (frames * size_of::<PageDescriptor>()).div_ceil(PAGE_SIZE)
    }

    pub(crate) fn boot_with(regions: &[TestRegion], frames: usize) -> Result<MemoryManager, InitError> {
        let memory = PhysicalMemory::new(frames * PAGE_SIZE);
        let map = MemoryMap::new(regions, PhysAddr::new(0)..memory.image_end());
        MemoryManager::new(map, memory)
    }

    pub(crate) fn boot() -> MemoryManager {
        let regions = [TestRegion::usable(0, (FRAMES * PAGE_SIZE) as u64)];
        boot_with(&regions, FRAMES).unwrap()
    }

    #[test]
    fn init_releases_everything_but_image_and_table() {
        let manager = boot();
        let stats = manager.stats();
        let table = table_frames(FRAMES);

        assert_eq!(stats.table_frames, table);
        assert_eq!(stats.total_frames, FRAMES - IMAGE_FRAMES - table);
        // One page holds the size-class cache records.
        assert_eq!(stats.used_frames, 1);
        assert_eq!(stats.window_pages, IMAGE_FRAMES + table + 1);
    }

    #[test]
    fn init_loads_the_boot_directory() {
        let manager = boot();
        let memory = manager.memory();
        assert_eq!(arch::active_directory(), Some(memory.boot_directory_phys()));

        let directory: &PageTable = unsafe { memory.boot_directory().as_ref() };
        assert!(directory.present(0..KERNEL_FIRST_TABLE).next().is_none());
        let kernel = KERNEL_FIRST_TABLE..ENTRIES_PER_TABLE;
        assert_eq!(directory.present(kernel.clone()).count(), kernel.len());
        for (i, entry) in directory.present(kernel) {
            let table = i - KERNEL_FIRST_TABLE;
            assert_eq!(
                entry.address(),
                Some(memory.kernel_tables_phys() + (table * PAGE_SIZE) as u32)
            );
        }
    }

    #[test]
    fn image_keeps_its_higher_half_address() {
        let manager = boot();
        let virt = VirtAddr::new(KERNEL_VIRTUAL_BASE + 0x1234);
        assert_eq!(manager.virt_to_phys(virt), Some(PhysAddr::new(0x1234)));
    }

    #[test]
    fn handles_addresses_and_mappings_agree() {
        let manager = boot();
        let page = manager.alloc_page(AllocFlags::NONE);

        let phys = manager.page_to_phys(page);
        assert_eq!(manager.phys_to_page(phys), page);
        assert_eq!(manager.phys_to_page(phys + 0x123), page);

        let virt = manager.page_to_virt(page);
        assert_eq!(manager.virt_to_phys(virt), Some(phys));
        let mapped = manager.stats().window_pages;
        assert_eq!(manager.page_to_virt(page), virt);
        assert_eq!(manager.stats().window_pages, mapped);
    }

    #[test]
    fn zeroed_allocation_is_zero() {
        let manager = boot();
        let dirty = manager.alloc_pages(4, AllocFlags::NONE);
        let ptr = manager.virt_to_ptr(manager.pages_to_virt(dirty, 4)).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0xFF, 4 * PAGE_SIZE) };
        manager.free_pages(dirty, 4);

        let page = manager.alloc_pages(4, AllocFlags::ZERO);
        let virt = manager.pages_to_virt(page, 4);
        let ptr = manager.virt_to_ptr(virt).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 4 * PAGE_SIZE) };
        assert!(bytes.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn run_mapping_is_contiguous() {
        let manager = boot();
        let page = manager.alloc_pages(3, AllocFlags::NONE);
        let virt = manager.pages_to_virt(page, 3);

        for i in 0..3 {
            assert_eq!(
                manager.page_to_virt(page.offset(i)),
                virt + i * PAGE_SIZE as u32
            );
        }
        // Page-wise mappings recorded first are replaced by one contiguous mapping.
        let other = manager.alloc_pages(2, AllocFlags::NONE);
        let first = manager.page_to_virt(other);
        manager.map_pages(PhysAddr::new(0), 1);
        let second = manager.page_to_virt(other.offset(1));
        assert_ne!(second, first + PAGE_SIZE as u32);
        let run = manager.pages_to_virt(other, 2);
        assert_eq!(manager.page_to_virt(other.offset(1)), run + PAGE_SIZE as u32);
    }

    #[test]
    fn mapping_a_frame_twice_gives_two_addresses() {
        let manager = boot();
        let phys = manager.page_to_phys(manager.alloc_page(AllocFlags::NONE));
        arch::take_invalidations();

        let first = manager.map_pages(phys, 1);
        let second = manager.map_pages(phys, 1);
        assert_ne!(first, second);
        assert_eq!(arch::take_invalidations(), [first, second]);

        unsafe {
            manager.virt_to_ptr(first).unwrap().as_ptr().write(7);
            assert_eq!(manager.virt_to_ptr(second).unwrap().as_ptr().read(), 7);
        }
    }

    #[test]
    fn kalloc_touches_only_its_size_class() {
        let manager = boot();
        let before: Vec<_> = manager.size_classes().iter().map(Cache::stats).collect();

        let ptr = manager.kalloc(100);
        unsafe { ptr.as_ptr().write_bytes(0xA5, 100) };
        manager.kfree(ptr, 100);

        let after: Vec<_> = manager.size_classes().iter().map(Cache::stats).collect();
        for (old, new) in before.iter().zip(&after) {
            if new.object_size == 128 {
                assert_eq!((new.empty_pages, new.partial_pages, new.full_pages), (1, 0, 0));
            } else {
                assert_eq!(old, new);
            }
        }
    }

    #[test]
    fn cache_pages_come_from_the_buddy_allocator() {
        let manager = boot();
        let cache = manager.cache_create(200);
        let used = manager.stats().used_frames;

        let object = manager.cache_alloc(cache);
        assert_eq!(manager.stats().used_frames, used + 1);
        manager.cache_free(cache, object);

        assert_eq!(manager.cache_shrink(cache), 1);
        assert_eq!(manager.stats().used_frames, used);
    }

    #[test]
    fn cache_pages_are_flagged() {
        let manager = boot();
        let (page, _) = manager.alloc_cache_page().unwrap();
        assert!(manager.frame_flags(page).unwrap().test(FrameFlag::Cache));
        manager.free_cache_page(page);
        assert!(manager.frame_flags(page).unwrap().is_empty());
    }

    #[test]
    fn blocks_are_aligned() {
        let manager = boot();
        let block = manager.alloc_block(3, AllocFlags::NONE);
        assert!(block.frame().is_order_aligned(3));
        manager.free_block(block, 3);
    }

    #[test]
    fn exhaustion_is_reported_by_try_alloc() {
        let manager = boot();
        let free = manager.stats().free_frames;
        let mut held = Vec::new();
        while let Ok(page) = manager.try_alloc_pages(1, AllocFlags::NONE) {
            held.push(page);
        }

        assert_eq!(held.len(), free);
        assert_eq!(
            manager.try_alloc_pages(1, AllocFlags::NONE),
            Err(MemoryError::Alloc(AllocError::OutOfMemory))
        );
        for page in held {
            manager.free_page(page);
        }
        assert_eq!(manager.stats().free_frames, free);
    }

    #[test]
    #[should_panic(expected = "alloc_pages: out of memory")]
    fn exhaustion_is_fatal() {
        let manager = boot();
        loop {
            manager.alloc_page(AllocFlags::NONE);
        }
    }

    #[test]
    #[should_panic(expected = "frame is not allocated")]
    fn double_free_is_fatal() {
        let manager = boot();
        let page = manager.alloc_page(AllocFlags::NONE);
        manager.free_page(page);
        manager.free_page(page);
    }

    #[test]
    #[should_panic(expected = "frame is permanent")]
    fn freeing_the_image_is_fatal() {
        let manager = boot();
        manager.free_page(PageHandle::new(FrameNumber::new(1)));
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn oversized_kalloc_is_fatal() {
        let manager = boot();
        manager.kalloc(KALLOC_MAX + 1);
    }

    fn boot_with_module() -> MemoryManager {
        let page = PAGE_SIZE as u64;
        let regions = [
            TestRegion::usable(0, 512 * page),
            TestRegion::reserved(512 * page, 64 * page),
            TestRegion::usable(576 * page, (FRAMES as u64 - 576) * page),
        ];
        boot_with(&regions, FRAMES).unwrap()
    }

    #[test]
    fn claimed_module_frames_become_allocatable() {
        let manager = boot_with_module();
        let module = FrameNumber::new(512);
        let before = manager.stats();
        assert!(manager.frame_flags(PageHandle::new(module)).unwrap().test(FrameFlag::Permanent));

        manager.claim_pages(module, 64);
        let after = manager.stats();
        assert_eq!(after.total_frames, before.total_frames + 64);
        assert_eq!(after.free_frames, before.free_frames + 64);

        let mut handed_out = Vec::new();
        while let Ok(page) = manager.try_alloc_pages(1, AllocFlags::NONE) {
            handed_out.push(page.frame().as_u32());
        }
        assert!((512..576).all(|frame| handed_out.contains(&frame)));
    }

    #[test]
    fn only_reserved_frames_are_claimed() {
        let manager = boot_with_module();
        let page = manager.alloc_page(AllocFlags::NONE);

        assert_eq!(
            manager.try_claim_pages(page.frame(), 1),
            Err(MemoryError::Alloc(AllocError::NotReserved))
        );
        assert_eq!(
            manager.try_claim_pages(FrameNumber::new(IMAGE_FRAMES as u32), 1),
            Err(MemoryError::Alloc(AllocError::Permanent))
        );
        assert_eq!(
            manager.try_claim_pages(FrameNumber::new(FRAMES as u32), 1),
            Err(MemoryError::Alloc(AllocError::OutOfRange))
        );
    }

    #[test]
    #[should_panic(expected = "claim_pages: frame is not reserved")]
    fn claiming_free_frames_is_fatal() {
        let manager = boot_with_module();
        manager.claim_pages(FrameNumber::new(600), 4);
    }

    #[test]
    fn init_requires_usable_memory() {
        let regions = [TestRegion::reserved(0, (FRAMES * PAGE_SIZE) as u64)];
        assert!(matches!(boot_with(&regions, FRAMES), Err(InitError::NoUsableMemory)));
    }

    #[test]
    fn init_requires_room_for_the_table() {
        // Usable memory only in single-frame slivers beyond the image.
        let page = PAGE_SIZE as u64;
        let mut regions = vec![TestRegion::usable(0, IMAGE_FRAMES as u64 * page)];
        for frame in (IMAGE_FRAMES as u64..FRAMES as u64).step_by(2) {
            regions.push(TestRegion::usable(frame * page, page));
        }
        assert!(matches!(
            boot_with(&regions, FRAMES),
            Err(InitError::NoContiguousRegion)
        ));
    }
}
