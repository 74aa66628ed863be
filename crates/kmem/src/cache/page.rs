//! Layout of a cache page.
//!
//! A cache page is one physical page laid out as:
//!
//! ```text
//! +-------------+---------------------+-----+---------------------------+
//! | CachePage   | freelist: [u32; max] | pad | objects: [[u8; size]; max] |
//! +-------------+---------------------+-----+---------------------------+
//! ```
//!
//! Slot `i` of the freelist holds the index of the next free object after object `i`,
//! or [`FREELIST_END`]. The header sits at the start of the page, so the page owning any
//! object is found by aligning the object's address down to the page size.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::PageHandle;
use crate::paging::PAGE_SIZE;

/// Freelist terminator.
pub const FREELIST_END: u32 = 1 << 31;

/// Size of the header at the start of every cache page.
pub const HEADER_SIZE: usize = size_of::<CachePage>();

/// Alignment of the first object on a page.
pub const OBJECT_ALIGN: usize = 8;

const SLOT_SIZE: usize = size_of::<u32>();

/// Returns how many objects of `size` bytes fit on one cache page: one freelist slot plus
/// the object itself per entry, after the header.
pub const fn objects_per_page(size: usize) -> usize {
    if size == 0 || HEADER_SIZE + SLOT_SIZE + size > PAGE_SIZE {
        return 0;
    }

    let mut max = (PAGE_SIZE - HEADER_SIZE) / (size + SLOT_SIZE);
    // Aligning the object area can push the last object off the page.
    while max > 0 && storage_offset(max) + max * size > PAGE_SIZE {
        max -= 1;
    }
    max
}

/// Returns the offset of the object area on a page holding `max` objects.
pub const fn storage_offset(max: usize) -> usize {
    (HEADER_SIZE + max * SLOT_SIZE).next_multiple_of(OBJECT_ALIGN)
}

/// Which list of its cache a page is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Every object is free.
    Empty,
    /// Some objects are allocated.
    Partial,
    /// Every object is allocated.
    Full,
}

/// Header at the start of a cache page.
#[repr(C)]
pub struct CachePage {
    prev: Option<NonNull<CachePage>>,
    next: Option<NonNull<CachePage>>,
    page: PageHandle,
    object_size: u32,
    max: u32,
    left: u32,
    free: u32,
    state: PageState,
}

impl CachePage {
    /// Writes a fresh header and freelist `0 -> 1 -> ... -> max-1 -> END` into the page at
    /// `base`.
    ///
    /// # Safety
    /// `base` must be a page-aligned, writable page not in use for anything else, and
    /// `max` must equal `objects_per_page(object_size)`.
    pub unsafe fn format(
        base: NonNull<u8>,
        page: PageHandle,
        object_size: usize,
        max: usize,
    ) -> NonNull<CachePage> {
        debug_assert!(base.as_ptr() as usize % PAGE_SIZE == 0, "cache page not page aligned");
        debug_assert!(max > 0);

        let header = base.cast::<CachePage>();
        // SAFETY: the caller hands over the whole page.
        unsafe {
            header.write(CachePage {
                prev: None,
                next: None,
                page,
                object_size: object_size as u32,
                max: max as u32,
                left: max as u32,
                free: 0,
                state: PageState::Empty,
            });

            let freelist = Self::freelist(header);
            for i in 0..max {
                let next = if i + 1 < max { (i + 1) as u32 } else { FREELIST_END };
                freelist.add(i).write(next);
            }
        }
        header
    }

    /// Returns the header of the page containing `ptr`.
    pub fn containing(ptr: NonNull<u8>) -> Option<NonNull<CachePage>> {
        let offset = ptr.as_ptr() as usize & (PAGE_SIZE - 1);
        NonNull::new(ptr.as_ptr().wrapping_sub(offset)).map(NonNull::cast)
    }

    /// Returns the page backing this cache page.
    pub fn page(&self) -> PageHandle {
        self.page
    }

    /// Returns the object size this page was formatted for.
    pub fn object_size(&self) -> usize {
        self.object_size as usize
    }

    /// Returns the number of free objects on the page.
    pub fn left(&self) -> usize {
        self.left as usize
    }

    /// Returns the number of objects the page holds.
    pub fn max(&self) -> usize {
        self.max as usize
    }

    /// Returns which list the page is on.
    pub fn state(&self) -> PageState {
        self.state
    }

    /// Records which list the page is on.
    pub fn set_state(&mut self, state: PageState) {
        self.state = state;
    }

    /// Hands out the first free object.
    ///
    /// # Safety
    /// `this` must point to a formatted cache page with at least one free object.
    pub unsafe fn take(this: NonNull<CachePage>) -> NonNull<u8> {
        unsafe {
            let (index, size) = {
                let header = this.as_ref();
                assert!(header.free != FREELIST_END, "cache page has no free object");
                (header.free as usize, header.object_size())
            };
            let next = Self::freelist(this).add(index).read();

            let header = &mut *this.as_ptr();
            header.free = next;
            header.left -= 1;
            Self::storage(this).add(index * size)
        }
    }

    /// Returns the index of the object at `ptr`, if `ptr` is the start of an object slot
    /// on this page.
    ///
    /// # Safety
    /// `this` must point to a formatted cache page.
    pub unsafe fn index_of(this: NonNull<CachePage>, ptr: NonNull<u8>) -> Option<u32> {
        let (size, max) = unsafe { (this.as_ref().object_size(), this.as_ref().max()) };
        let storage = unsafe { Self::storage(this) }.as_ptr() as usize;
        let offset = (ptr.as_ptr() as usize).checked_sub(storage)?;

        if offset % size != 0 || offset / size >= max {
            return None;
        }
        Some((offset / size) as u32)
    }

    /// Puts object `index` back at the front of the freelist.
    ///
    /// # Safety
    /// `this` must point to a formatted cache page and `index` must be an allocated
    /// object of that page.
    pub unsafe fn give(this: NonNull<CachePage>, index: u32) {
        unsafe {
            let free = this.as_ref().free;
            Self::freelist(this).add(index as usize).write(free);

            let header = &mut *this.as_ptr();
            header.free = index;
            header.left += 1;
        }
    }

    /// Returns true if object `index` is on the freelist.
    ///
    /// # Safety
    /// `this` must point to a formatted cache page.
    #[cfg_attr(not(any(test, feature = "debug-mm")), allow(dead_code))]
    pub unsafe fn is_free(this: NonNull<CachePage>, index: u32) -> bool {
        unsafe {
            let freelist = Self::freelist(this);
            let mut cursor = this.as_ref().free;
            while cursor != FREELIST_END {
                if cursor == index {
                    return true;
                }
                cursor = freelist.add(cursor as usize).read();
            }
        }
        false
    }

    /// Counts the objects reachable through the freelist.
    ///
    /// # Safety
    /// `this` must point to a formatted cache page.
    #[cfg(test)]
    pub unsafe fn count_free(this: NonNull<CachePage>) -> usize {
        let mut count = 0;
        unsafe {
            let freelist = Self::freelist(this);
            let mut cursor = this.as_ref().free;
            while cursor != FREELIST_END {
                count += 1;
                cursor = freelist.add(cursor as usize).read();
            }
        }
        count
    }

    unsafe fn freelist(this: NonNull<CachePage>) -> NonNull<u32> {
        unsafe { this.cast::<u8>().add(HEADER_SIZE).cast() }
    }

    unsafe fn storage(this: NonNull<CachePage>) -> NonNull<u8> {
        unsafe {
            let max = this.as_ref().max();
            this.cast::<u8>().add(storage_offset(max))
        }
    }
}

/// Intrusive doubly linked list of cache pages, linked through their headers.
pub struct PageList {
    head: Option<NonNull<CachePage>>,
    len: usize,
}

impl PageList {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Returns the number of pages on the list.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Returns the first page on the list.
    pub fn first(&self) -> Option<NonNull<CachePage>> {
        self.head
    }

    /// Links `page` at the front.
    ///
    /// # Safety
    /// `page` must be a formatted cache page that is on no list.
    pub unsafe fn push_front(&mut self, page: NonNull<CachePage>) {
        unsafe {
            let header = &mut *page.as_ptr();
            header.prev = None;
            header.next = self.head;
            if let Some(mut old) = self.head {
                old.as_mut().prev = Some(page);
            }
        }
        self.head = Some(page);
        self.len += 1;
    }

    /// Unlinks `page`.
    ///
    /// # Safety
    /// `page` must be on this list.
    pub unsafe fn remove(&mut self, page: NonNull<CachePage>) {
        unsafe {
            let header = &mut *page.as_ptr();
            match header.prev {
                Some(mut prev) => prev.as_mut().next = header.next,
                None => self.head = header.next,
            }
            if let Some(mut next) = header.next {
                next.as_mut().prev = header.prev;
            }
            header.prev = None;
            header.next = None;
        }
        self.len -= 1;
    }

    /// Iterates over the pages on the list, front first.
    pub fn iter(&self) -> impl Iterator<Item = NonNull<CachePage>> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let page = cursor?;
            // SAFETY: every page on a list is a formatted cache page.
            cursor = unsafe { page.as_ref().next };
            Some(page)
        })
    }
}
