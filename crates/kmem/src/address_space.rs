//! Per-task address spaces.
//!
//! Every address space has its own page directory. The kernel half of each directory
//! points at the same statically reserved kernel page tables, so kernel mappings made
//! after a task is created are visible to it without touching its directory. The user
//! half is filled lazily: a user page table is allocated the first time a page in its
//! 4 MiB region is mapped.

use core::ptr::NonNull;

use crate::paging::{
    ENTRIES_PER_TABLE, KERNEL_FIRST_TABLE, KERNEL_NUM_TABLES, PAGE_SIZE, PageEntry, PageFlags,
    PageTable,
};
use crate::{AllocFlags, FrameFlag, MemoryManager, PageHandle, PhysAddr, VirtAddr, arch};

/// Clears the user half of `directory` and points its kernel half at the kernel page
/// tables, which start at `kernel_tables` and are physically contiguous.
pub(crate) fn fill_directory(directory: &mut PageTable, kernel_tables: PhysAddr) {
    directory.clear_range(0..KERNEL_FIRST_TABLE);
    for table in 0..KERNEL_NUM_TABLES {
        let phys = kernel_tables + (table * PAGE_SIZE) as u32;
        *directory.entry_mut(KERNEL_FIRST_TABLE + table) = PageEntry::new(phys, PageFlags::kernel());
    }
}

/// A task's address space, identified by its page directory.
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    directory: PageHandle,
    phys: PhysAddr,
}

impl AddressSpace {
    /// Returns the page holding the directory.
    pub fn directory(&self) -> PageHandle {
        self.directory
    }

    /// Returns the physical address of the directory, the value loaded into CR3.
    pub fn directory_phys(&self) -> PhysAddr {
        self.phys
    }
}

impl MemoryManager {
    /// Rebuilds `directory`: empty user half, kernel half shared with every other
    /// directory.
    pub fn build_page_dir(&self, directory: PageHandle) {
        let mut table = self.page_table(directory);
        // SAFETY: the caller owns the directory page.
        fill_directory(unsafe { table.as_mut() }, self.memory().kernel_tables_phys());
    }

    /// Allocates and builds a new page directory.
    pub fn create_address_space(&self) -> AddressSpace {
        let directory = self.alloc_page(AllocFlags::NONE);
        self.build_page_dir(directory);

        let phys = self.page_to_phys(directory);
        log::debug!("mm: created address space, directory at {phys}");
        AddressSpace { directory, phys }
    }

    /// Maps the user page at `virt` to the frame containing `phys`, allocating the page
    /// table for the region on first use.
    ///
    /// The space does not own the frame: releasing the space leaves it alone.
    ///
    /// # Panics
    /// Panics if `virt` lies in the kernel region.
    pub fn user_map_page(&self, space: &AddressSpace, virt: VirtAddr, phys: PhysAddr) {
        self.map_user(space, virt, phys, PageFlags::user());
    }

    /// Maps `count` consecutive user pages starting at `virt` to consecutive frames
    /// starting at `phys`.
    pub fn user_map_pages(
        &self,
        space: &AddressSpace,
        virt: VirtAddr,
        phys: PhysAddr,
        count: usize,
    ) {
        for i in 0..count {
            let offset = (i * PAGE_SIZE) as u32;
            self.user_map_page(space, virt + offset, phys + offset);
        }
    }

    /// Allocates a zeroed page owned by `space` and maps it at `virt`.
    ///
    /// The page is freed with the address space.
    pub fn user_alloc_page(&self, space: &AddressSpace, virt: VirtAddr) -> PageHandle {
        let page = self.alloc_page(AllocFlags::ZERO);
        self.mark_frame(page, FrameFlag::User);
        self.map_owned(space, virt, page);
        page
    }

    /// Gives `to` a private copy of every user page mapped in `from`, at the same
    /// addresses.
    ///
    /// # Panics
    /// Panics if `to` already maps one of those addresses.
    pub fn copy_address_space(&self, to: &AddressSpace, from: &AddressSpace) {
        let directory = self.page_table(from.directory);
        // SAFETY: the source directory is only read.
        let directory = unsafe { directory.as_ref() };

        let mut copied = 0;
        for (dir_index, dir_entry) in directory.present(0..KERNEL_FIRST_TABLE) {
            let Some(table_phys) = dir_entry.address() else {
                continue;
            };
            let table = self.page_table(self.phys_to_page(table_phys));
            // SAFETY: as above.
            let table = unsafe { table.as_ref() };

            for (index, entry) in table.present(0..ENTRIES_PER_TABLE) {
                let Some(source) = entry.address() else {
                    continue;
                };
                let virt = VirtAddr::from_indices(dir_index, index);
                assert!(
                    self.translate(to, virt).is_none(),
                    "copy_address_space: {virt} is already mapped"
                );

                let page = self.alloc_page(AllocFlags::NONE);
                let src = self.page_ptr(self.phys_to_page(source));
                let dst = self.page_ptr(page);
                // SAFETY: two distinct whole pages.
                unsafe { dst.as_ptr().copy_from_nonoverlapping(src.as_ptr(), PAGE_SIZE) };

                self.mark_frame(page, FrameFlag::User);
                self.map_owned(to, virt, page);
                copied += 1;
            }
        }
        log::debug!("mm: copied {copied} user page(s) into {}", to.phys);
    }

    /// Returns the physical address `virt` maps to in `space`.
    pub fn translate(&self, space: &AddressSpace, virt: VirtAddr) -> Option<PhysAddr> {
        if virt.is_kernel() {
            return self.virt_to_phys(virt);
        }

        let directory = self.page_table(space.directory);
        // SAFETY: read only.
        let table_phys = unsafe { directory.as_ref() }
            .entry(virt.directory_index())
            .address()?;
        let table = self.page_table(self.phys_to_page(table_phys));
        let frame = unsafe { table.as_ref() }.entry(virt.table_index()).address()?;
        Some(frame + virt.page_offset())
    }

    /// Returns the page mapped at `virt` in `space`.
    pub fn user_page(&self, space: &AddressSpace, virt: VirtAddr) -> Option<PageHandle> {
        self.translate(space, virt).map(|phys| self.phys_to_page(phys))
    }

    /// Tears down `space`: frees the pages it owns, its page tables and its directory.
    ///
    /// A space owns the pages it got from [`MemoryManager::user_alloc_page`] and
    /// [`MemoryManager::copy_address_space`]. Frames mapped with
    /// [`MemoryManager::user_map_page`] are left alone, even when another space owns
    /// them.
    ///
    /// # Panics
    /// Panics if `space` is the active address space.
    pub fn release_address_space(&self, space: AddressSpace) {
        assert!(
            !self.is_active(&space),
            "release_address_space: {} is active",
            space.phys
        );

        let directory = self.page_table(space.directory);
        // SAFETY: the space is consumed; nothing else uses its tables.
        let directory = unsafe { directory.as_ref() };
        let mut released = 0;
        for (_, dir_entry) in directory.present(0..KERNEL_FIRST_TABLE) {
            let Some(table_phys) = dir_entry.address() else {
                continue;
            };
            let table_page = self.phys_to_page(table_phys);
            let table = self.page_table(table_page);

            for (_, entry) in unsafe { table.as_ref() }.present(0..ENTRIES_PER_TABLE) {
                let Some(frame) = entry.address() else {
                    continue;
                };
                if entry.flags().is_owned() {
                    self.free_page(self.phys_to_page(frame));
                    released += 1;
                }
            }
            self.free_page(table_page);
        }
        self.free_page(space.directory);
        log::debug!("mm: released address space {}, {released} user page(s)", space.phys);
    }

    /// Switches to `space`.
    ///
    /// # Safety
    /// The directory maps the kernel, so switching is sound as long as `space` is not
    /// released while it is active.
    pub unsafe fn activate(&self, space: &AddressSpace) {
        // SAFETY: see above.
        unsafe { arch::load_directory(space.phys) };
    }

    /// Returns true if `space` is the address space of the running task.
    pub fn is_active(&self, space: &AddressSpace) -> bool {
        arch::active_directory() == Some(space.phys)
    }

    fn map_owned(&self, space: &AddressSpace, virt: VirtAddr, page: PageHandle) {
        let mut flags = PageFlags::user();
        flags.set_owned(true);
        self.map_user(space, virt, self.page_to_phys(page), flags);
    }

    fn map_user(&self, space: &AddressSpace, virt: VirtAddr, phys: PhysAddr, flags: PageFlags) {
        assert!(
            !virt.is_kernel(),
            "user_map_page: {virt} is in the kernel region"
        );

        let table_phys = self.user_table(space, virt);
        let mut table = self.page_table(self.phys_to_page(table_phys));
        // SAFETY: user page tables belong to the address space.
        let table = unsafe { table.as_mut() };
        *table.entry_mut(virt.table_index()) = PageEntry::new(phys.page_base(), flags);

        if self.is_active(space) {
            arch::invalidate_page(virt);
        }
        log::trace!("mm: mapped user page {} -> {}", virt.page_base(), phys.page_base());
    }

    /// Returns the physical address of the user page table covering `virt`, allocating
    /// it if needed.
    fn user_table(&self, space: &AddressSpace, virt: VirtAddr) -> PhysAddr {
        let mut directory = self.page_table(space.directory);
        let index = virt.directory_index();
        // SAFETY: the directory belongs to the address space.
        if let Some(phys) = unsafe { directory.as_ref() }.entry(index).address() {
            return phys;
        }

        let table = self.alloc_page(AllocFlags::ZERO);
        let phys = self.page_to_phys(table);
        // SAFETY: as above.
        *unsafe { directory.as_mut() }.entry_mut(index) = PageEntry::new(phys, PageFlags::user());
        phys
    }

    fn page_table(&self, page: PageHandle) -> NonNull<PageTable> {
        self.page_ptr(page).cast()
    }
}
