//! Slab / object caches.
//!
//! A [`Cache`] hands out fixed-size objects carved from whole pages. Each backing page
//! carries its own header and embedded freelist (see [`page`]), and sits on exactly one
//! of the cache's three lists:
//!
//! - `empty`: every object free
//! - `partial`: some objects allocated
//! - `full`: no object free
//!
//! Cache records themselves are objects of the bootstrap meta cache, which is a plain
//! value built at compile time so the first [`Cache::create`] has somewhere to allocate
//! from.

mod kalloc;
mod page;

use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

pub use kalloc::{
    KALLOC_MAX, KALLOC_NUM_CACHES, KALLOC_SHIFT_MAX, KALLOC_SHIFT_MIN, SizeClasses, size_class,
};
pub use page::{FREELIST_END, HEADER_SIZE, PageState, objects_per_page};

use self::page::{CachePage, PageList};
use crate::sync::IrqSpinLock;
use crate::{MemoryError, PageHandle};

/// Supplier of backing pages for caches.
pub trait PageSource {
    /// Allocates one page for a cache, returning its handle and a writable pointer to it.
    fn alloc_cache_page(&self) -> Result<(PageHandle, NonNull<u8>), MemoryError>;

    /// Returns a page obtained from [`PageSource::alloc_cache_page`].
    fn free_cache_page(&self, page: PageHandle);
}

/// Errors reported when creating caches or allocating from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// No object of this size fits on a cache page (or the size is zero, or above the
    /// largest size class).
    ObjectSize(usize),
    /// A backing page could not be obtained.
    Memory(MemoryError),
}

impl From<MemoryError> for CacheError {
    fn from(error: MemoryError) -> Self {
        CacheError::Memory(error)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::ObjectSize(size) => write!(f, "unsupported object size {size}"),
            CacheError::Memory(error) => write!(f, "no backing page: {error}"),
        }
    }
}

/// Snapshot of a cache's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub object_size: usize,
    pub objects_per_page: usize,
    pub empty_pages: usize,
    pub partial_pages: usize,
    pub full_pages: usize,
    pub free_objects: usize,
}

struct CacheLists {
    empty: PageList,
    partial: PageList,
    full: PageList,
}

// SAFETY: the pages on the lists are owned by the cache.
unsafe impl Send for CacheLists {}

impl CacheLists {
    const fn new() -> Self {
        Self {
            empty: PageList::new(),
            partial: PageList::new(),
            full: PageList::new(),
        }
    }

    fn list_mut(&mut self, state: PageState) -> &mut PageList {
        match state {
            PageState::Empty => &mut self.empty,
            PageState::Partial => &mut self.partial,
            PageState::Full => &mut self.full,
        }
    }

    /// Moves `page` from the list it is on to the list for `to`.
    ///
    /// # Safety
    /// `page` must be a page of this cache.
    unsafe fn move_page(&mut self, mut page: NonNull<CachePage>, to: PageState) {
        unsafe {
            let from = page.as_ref().state();
            self.list_mut(from).remove(page);
            self.list_mut(to).push_front(page);
            page.as_mut().set_state(to);
        }
    }
}

/// A cache of fixed-size objects.
pub struct Cache {
    size: usize,
    max: usize,
    permanent: bool,
    lists: IrqSpinLock<CacheLists>,
}

const _: () = assert!(objects_per_page(size_of::<Cache>()) > 0);

impl Cache {
    /// Creates an empty cache for objects of `size` bytes.
    pub const fn new(size: usize) -> Result<Self, CacheError> {
        let max = objects_per_page(size);
        if max == 0 {
            return Err(CacheError::ObjectSize(size));
        }

        Ok(Self {
            size,
            max,
            permanent: false,
            lists: IrqSpinLock::new(CacheLists::new()),
        })
    }

    /// The meta cache: holds [`Cache`] records and never gives its pages back.
    pub const fn bootstrap() -> Self {
        Self {
            size: size_of::<Cache>(),
            max: objects_per_page(size_of::<Cache>()),
            permanent: true,
            lists: IrqSpinLock::new(CacheLists::new()),
        }
    }

    /// Creates a cache for objects of `size` bytes, allocating its record from `meta`.
    ///
    /// Caches are never destroyed; the record lives as long as `meta`.
    pub fn create<'a, S: PageSource + ?Sized>(
        meta: &'a Cache,
        size: usize,
        source: &S,
    ) -> Result<&'a Cache, CacheError> {
        debug_assert_eq!(meta.size, size_of::<Cache>(), "not a meta cache");

        let cache = Cache::new(size)?;
        let slot = meta.alloc(source)?.cast::<Cache>();
        log::debug!(
            "cache: created {size}-byte cache ({} objects per page)",
            cache.max
        );

        // SAFETY: the slot is a fresh, suitably sized and aligned meta-cache object that
        // is never freed.
        unsafe {
            slot.write(cache);
            Ok(slot.as_ref())
        }
    }

    /// Returns the object size.
    pub fn object_size(&self) -> usize {
        self.size
    }

    /// Returns how many objects one backing page holds.
    pub fn objects_per_page(&self) -> usize {
        self.max
    }

    /// Returns true if the cache never releases its pages.
    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    /// Allocates one object. Its contents are unspecified.
    ///
    /// Pages with free objects on the partial list are preferred over empty pages; a new
    /// page is requested from `source` only when neither exists.
    pub fn alloc<S: PageSource + ?Sized>(&self, source: &S) -> Result<NonNull<u8>, MemoryError> {
        let mut lists = self.lists.lock();

        if lists.partial.is_empty() && lists.empty.is_empty() {
            let (handle, base) = source.alloc_cache_page()?;
            // SAFETY: the source hands over a whole page.
            unsafe {
                let page = CachePage::format(base, handle, self.size, self.max);
                lists.empty.push_front(page);
            }
        }

        let page = match lists.partial.first().or_else(|| lists.empty.first()) {
            Some(page) => page,
            None => unreachable!("cache has no page with a free object"),
        };

        // SAFETY: pages on the partial and empty lists have a free object.
        unsafe {
            let object = CachePage::take(page);
            let (left, state) = (page.as_ref().left(), page.as_ref().state());
            let target = if left == 0 {
                PageState::Full
            } else {
                PageState::Partial
            };
            if state != target {
                lists.move_page(page, target);
            }
            Ok(object)
        }
    }

    /// Returns an object to the cache.
    ///
    /// # Panics
    /// Panics if `ptr` is not an allocated object of this cache.
    pub fn free(&self, ptr: NonNull<u8>) {
        let mut lists = self.lists.lock();
        let page = self.page_of(&lists, ptr);

        // SAFETY: `page_of` only returns headers of cache pages.
        unsafe {
            let (object_size, left) = (page.as_ref().object_size(), page.as_ref().left());
            assert!(
                object_size == self.size,
                "cache_free: {ptr:p} belongs to a {object_size}-byte cache, not {}",
                self.size
            );

            let Some(index) = CachePage::index_of(page, ptr) else {
                panic!("cache_free: {ptr:p} is not an object of this cache");
            };
            assert!(left < self.max, "cache_free: double free of {ptr:p}");
            self.check_allocated(page, index, ptr);

            if left + 1 == self.max {
                lists.move_page(page, PageState::Empty);
            } else if left == 0 {
                lists.move_page(page, PageState::Partial);
            }
            CachePage::give(page, index);
        }
    }

    /// Releases every empty page back to `source`, returning how many were released.
    /// Permanent caches keep their pages.
    pub fn shrink<S: PageSource + ?Sized>(&self, source: &S) -> usize {
        if self.permanent {
            return 0;
        }

        let mut lists = self.lists.lock();
        let mut released = 0;
        while let Some(page) = lists.empty.first() {
            // SAFETY: the page is on the empty list; nothing references its objects.
            let handle = unsafe {
                lists.empty.remove(page);
                page.as_ref().page()
            };
            source.free_cache_page(handle);
            released += 1;
        }

        if released > 0 {
            log::debug!("cache: released {released} page(s) of the {}-byte cache", self.size);
        }
        released
    }

    /// Returns the cache's occupancy.
    pub fn stats(&self) -> CacheStats {
        let lists = self.lists.lock();
        let free_objects = lists
            .empty
            .iter()
            .chain(lists.partial.iter())
            // SAFETY: every page on a list is a cache page.
            .map(|page| unsafe { page.as_ref().left() })
            .sum();

        CacheStats {
            object_size: self.size,
            objects_per_page: self.max,
            empty_pages: lists.empty.len(),
            partial_pages: lists.partial.len(),
            full_pages: lists.full.len(),
            free_objects,
        }
    }

    #[cfg(not(feature = "debug-mm"))]
    fn page_of(&self, _lists: &CacheLists, ptr: NonNull<u8>) -> NonNull<CachePage> {
        match CachePage::containing(ptr) {
            Some(page) => page,
            None => panic!("cache_free: {ptr:p} is not inside a cache page"),
        }
    }

    /// Finds the page holding `ptr` by scanning this cache's lists.
    ///
    /// A pointer into another cache's page is handed on so `free` reports the size
    /// mismatch.
    #[cfg(feature = "debug-mm")]
    fn page_of(&self, lists: &CacheLists, ptr: NonNull<u8>) -> NonNull<CachePage> {
        let addr = ptr.as_ptr() as usize;
        let find = |list: &PageList| {
            list.iter().find(|page| {
                let base = page.as_ptr() as usize;
                addr >= base && addr < base + crate::paging::PAGE_SIZE
            })
        };

        if let Some(page) = find(&lists.full).or_else(|| find(&lists.partial)) {
            return page;
        }
        if find(&lists.empty).is_some() {
            panic!("cache_free: double free of {ptr:p}");
        }
        match CachePage::containing(ptr) {
            // SAFETY: a page outside this cache is only read for its object size.
            Some(page) if unsafe { page.as_ref().object_size() } != self.size => page,
            _ => panic!("cache_free: illegal pointer {ptr:p}"),
        }
    }

    #[cfg(not(feature = "debug-mm"))]
    fn check_allocated(&self, _page: NonNull<CachePage>, _index: u32, _ptr: NonNull<u8>) {}

    #[cfg(feature = "debug-mm")]
    fn check_allocated(&self, page: NonNull<CachePage>, index: u32, ptr: NonNull<u8>) {
        // SAFETY: `page` is a cache page of this cache.
        let free = unsafe { CachePage::is_free(page, index) };
        assert!(!free, "cache_free: double free of {ptr:p}");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::FrameNumber;
    use crate::paging::PAGE_SIZE;
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::cell::RefCell;
    use std::collections::HashSet;

    /// Page source backed by the host allocator.
    #[derive(Default)]
    pub(crate) struct HeapPages {
        pages: RefCell<Vec<(PageHandle, NonNull<u8>)>>,
        next: RefCell<u32>,
        limit: Option<usize>,
    }

    impl HeapPages {
        fn layout() -> Layout {
            Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
        }

        pub(crate) fn with_limit(limit: usize) -> Self {
            Self {
                pages: RefCell::new(Vec::new()),
                next: RefCell::new(0),
                limit: Some(limit),
            }
        }

        pub(crate) fn live_pages(&self) -> usize {
            self.pages.borrow().len()
        }
    }

    impl PageSource for HeapPages {
        fn alloc_cache_page(&self) -> Result<(PageHandle, NonNull<u8>), MemoryError> {
            if self.limit.is_some_and(|limit| self.live_pages() >= limit) {
                return Err(MemoryError::Alloc(crate::AllocError::OutOfMemory));
            }

            let mut next = self.next.borrow_mut();
            let handle = PageHandle::new(FrameNumber::new(*next));
            *next += 1;

            let base = NonNull::new(unsafe { alloc_zeroed(Self::layout()) }).unwrap();
            self.pages.borrow_mut().push((handle, base));
            Ok((handle, base))
        }

        fn free_cache_page(&self, page: PageHandle) {
            let mut pages = self.pages.borrow_mut();
            let index = pages.iter().position(|(handle, _)| *handle == page).unwrap();
            let (_, base) = pages.swap_remove(index);
            unsafe { dealloc(base.as_ptr(), Self::layout()) };
        }
    }

    impl Drop for HeapPages {
        fn drop(&mut self) {
            for (_, base) in self.pages.get_mut().drain(..) {
                unsafe { dealloc(base.as_ptr(), Self::layout()) };
            }
        }
    }

    type ListSnapshot = [Vec<(usize, usize)>; 3];

    /// Pages (address, free objects) on each list, checking list invariants on the way.
    pub(crate) fn snapshot(cache: &Cache) -> ListSnapshot {
        let lists = cache.lists.lock();
        let mut seen = HashSet::new();
        let mut walk = |list: &PageList, state: PageState| {
            list.iter()
                .map(|page| unsafe {
                    assert!(seen.insert(page), "page on two lists");
                    let header = page.as_ref();
                    assert_eq!(header.state(), state);
                    assert_eq!(header.left(), CachePage::count_free(page));
                    match state {
                        PageState::Empty => assert_eq!(header.left(), cache.max),
                        PageState::Partial => assert!(header.left() > 0 && header.left() < cache.max),
                        PageState::Full => assert_eq!(header.left(), 0),
                    }
                    (page.as_ptr() as usize, header.left())
                })
                .collect::<Vec<_>>()
        };
        [
            walk(&lists.empty, PageState::Empty),
            walk(&lists.partial, PageState::Partial),
            walk(&lists.full, PageState::Full),
        ]
    }

    fn page_states(cache: &Cache) -> (usize, usize, usize) {
        let stats = cache.stats();
        (stats.empty_pages, stats.partial_pages, stats.full_pages)
    }

    #[test]
    fn thirty_two_byte_cache_fills_a_page() {
        let source = HeapPages::default();
        let cache = Cache::new(32).unwrap();
        let max = cache.objects_per_page();
        assert_eq!(max, (PAGE_SIZE - HEADER_SIZE) / (32 + 4));

        let mut objects = Vec::new();
        for i in 0..max {
            objects.push(cache.alloc(&source).unwrap());
            let expected = if i + 1 == max { (0, 0, 1) } else { (0, 1, 0) };
            assert_eq!(page_states(&cache), expected, "after allocation {}", i + 1);
        }
        assert_eq!(source.live_pages(), 1);

        let unique: HashSet<_> = objects.iter().map(|ptr| ptr.as_ptr() as usize).collect();
        assert_eq!(unique.len(), max);
        snapshot(&cache);
    }

    #[test]
    fn alloc_free_pair_leaves_lists_unchanged() {
        let source = HeapPages::default();
        let cache = Cache::new(48).unwrap();

        // Empty cache with one page on the empty list.
        let warm = cache.alloc(&source).unwrap();
        cache.free(warm);

        let mut held = Vec::new();
        for count in [0, 1, 5, cache.objects_per_page() - 1] {
            while held.len() < count {
                held.push(cache.alloc(&source).unwrap());
            }
            let before = snapshot(&cache);
            let object = cache.alloc(&source).unwrap();
            cache.free(object);
            assert_eq!(snapshot(&cache), before, "with {count} objects held");
        }
    }

    #[test]
    fn pages_move_monotonically() {
        let source = HeapPages::default();
        let cache = Cache::new(512).unwrap();
        let max = cache.objects_per_page();

        let mut objects: Vec<_> = (0..max).map(|_| cache.alloc(&source).unwrap()).collect();
        assert_eq!(page_states(&cache), (0, 0, 1));

        cache.free(objects.pop().unwrap());
        assert_eq!(page_states(&cache), (0, 1, 0));
        while objects.len() > 1 {
            cache.free(objects.pop().unwrap());
            assert_eq!(page_states(&cache), (0, 1, 0));
        }
        cache.free(objects.pop().unwrap());
        assert_eq!(page_states(&cache), (1, 0, 0));
    }

    #[test]
    fn single_object_pages_skip_partial() {
        let source = HeapPages::default();
        let cache = Cache::new(2048).unwrap();
        assert_eq!(cache.objects_per_page(), 1);

        let object = cache.alloc(&source).unwrap();
        assert_eq!(page_states(&cache), (0, 0, 1));
        cache.free(object);
        assert_eq!(page_states(&cache), (1, 0, 0));
    }

    #[test]
    fn grows_when_pages_fill() {
        let source = HeapPages::default();
        let cache = Cache::new(1024).unwrap();
        let max = cache.objects_per_page();

        let objects: Vec<_> = (0..max + 1).map(|_| cache.alloc(&source).unwrap()).collect();
        assert_eq!(source.live_pages(), 2);
        assert_eq!(page_states(&cache), (0, 1, 1));
        for object in objects {
            cache.free(object);
        }
        assert_eq!(page_states(&cache), (2, 0, 0));
        assert_eq!(cache.stats().free_objects, 2 * max);
    }

    #[test]
    fn shrink_returns_empty_pages() {
        let source = HeapPages::default();
        let cache = Cache::new(1024).unwrap();
        let max = cache.objects_per_page();

        let mut objects: Vec<_> = (0..max + 1).map(|_| cache.alloc(&source).unwrap()).collect();
        // Empty the first page completely, keep one object on the second.
        let last = objects.pop().unwrap();
        for object in objects {
            cache.free(object);
        }

        assert_eq!(cache.shrink(&source), 1);
        assert_eq!(source.live_pages(), 1);
        cache.free(last);
        assert_eq!(cache.shrink(&source), 1);
        assert_eq!(source.live_pages(), 0);
    }

    #[test]
    fn meta_cache_hosts_caches_and_keeps_its_pages() {
        let source = HeapPages::default();
        let meta = Cache::bootstrap();
        assert!(meta.is_permanent());

        let cache = Cache::create(&meta, 24, &source).unwrap();
        assert_eq!(cache.object_size(), 24);
        let object = cache.alloc(&source).unwrap();
        cache.free(object);

        assert_eq!(meta.stats().partial_pages, 1);
        assert_eq!(meta.shrink(&source), 0);
        assert_eq!(cache.shrink(&source), 1);
    }

    #[test]
    fn rejects_impossible_sizes() {
        assert!(matches!(Cache::new(0), Err(CacheError::ObjectSize(0))));
        assert!(matches!(Cache::new(PAGE_SIZE), Err(CacheError::ObjectSize(_))));
    }

    #[test]
    fn reports_page_exhaustion() {
        let source = HeapPages::with_limit(1);
        let cache = Cache::new(2048).unwrap();
        cache.alloc(&source).unwrap();
        assert!(matches!(cache.alloc(&source), Err(MemoryError::Alloc(_))));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let source = HeapPages::default();
        let cache = Cache::new(64).unwrap();
        let object = cache.alloc(&source).unwrap();
        cache.free(object);
        cache.free(object);
    }

    #[test]
    #[cfg(feature = "debug-mm")]
    #[should_panic(expected = "double free")]
    fn double_free_on_a_partial_page_panics() {
        let source = HeapPages::default();
        let cache = Cache::new(64).unwrap();
        let object = cache.alloc(&source).unwrap();
        let _kept = cache.alloc(&source).unwrap();
        cache.free(object);
        cache.free(object);
    }

    #[test]
    #[should_panic(expected = "belongs to a 64-byte cache")]
    fn free_to_wrong_cache_panics() {
        let source = HeapPages::default();
        let small = Cache::new(64).unwrap();
        let large = Cache::new(128).unwrap();
        let object = small.alloc(&source).unwrap();
        large.free(object);
    }
}
