//! General purpose allocation through a ladder of power-of-two caches.

use core::ptr::NonNull;

use super::{Cache, CacheError, PageSource};

/// Shift of the smallest size class (8 bytes).
pub const KALLOC_SHIFT_MIN: u32 = 3;
/// Shift of the largest size class (2048 bytes).
pub const KALLOC_SHIFT_MAX: u32 = 11;
/// Number of size classes.
pub const KALLOC_NUM_CACHES: usize = (KALLOC_SHIFT_MAX - KALLOC_SHIFT_MIN + 1) as usize;
/// Largest size served by `kalloc`.
pub const KALLOC_MAX: usize = 1 << KALLOC_SHIFT_MAX;

/// Returns the index of the smallest size class holding `size` bytes, or `None` if
/// `size` exceeds [`KALLOC_MAX`]. Zero-sized requests use the smallest class.
pub const fn size_class(size: usize) -> Option<usize> {
    if size > KALLOC_MAX {
        return None;
    }

    let shift = size.next_power_of_two().trailing_zeros();
    let shift = if shift < KALLOC_SHIFT_MIN {
        KALLOC_SHIFT_MIN
    } else {
        shift
    };
    Some((shift - KALLOC_SHIFT_MIN) as usize)
}

/// The `kalloc` caches, one per size class.
pub struct SizeClasses {
    caches: [NonNull<Cache>; KALLOC_NUM_CACHES],
}

// SAFETY: the caches are meta-cache objects that are never freed, and `Cache` locks its
// own state.
unsafe impl Send for SizeClasses {}
unsafe impl Sync for SizeClasses {}

impl SizeClasses {
    /// Creates one cache per size class, with records allocated from `meta`.
    ///
    /// The result must not outlive `meta`.
    pub fn new<S: PageSource + ?Sized>(meta: &Cache, source: &S) -> Result<Self, CacheError> {
        let mut caches = [NonNull::dangling(); KALLOC_NUM_CACHES];
        for (class, slot) in caches.iter_mut().enumerate() {
            let size = 1 << (class as u32 + KALLOC_SHIFT_MIN);
            *slot = NonNull::from(Cache::create(meta, size, source)?);
        }
        Ok(Self { caches })
    }

    /// Returns the cache serving requests of `size` bytes.
    pub fn cache_for(&self, size: usize) -> Option<&Cache> {
        // SAFETY: the caches live as long as the meta cache, which outlives `self`.
        size_class(size).map(|class| unsafe { self.caches[class].as_ref() })
    }

    /// Iterates over the caches, smallest first.
    pub fn iter(&self) -> impl Iterator<Item = &Cache> + '_ {
        // SAFETY: as in `cache_for`.
        self.caches.iter().map(|cache| unsafe { cache.as_ref() })
    }

    /// Allocates `size` bytes from the matching size class.
    pub fn alloc<S: PageSource + ?Sized>(
        &self,
        size: usize,
        source: &S,
    ) -> Result<NonNull<u8>, CacheError> {
        let cache = self.cache_for(size).ok_or(CacheError::ObjectSize(size))?;
        Ok(cache.alloc(source)?)
    }

    /// Frees an allocation of `size` bytes.
    ///
    /// # Panics
    /// Panics if `size` exceeds [`KALLOC_MAX`] or `ptr` was not allocated with a size in
    /// the same class.
    pub fn free(&self, ptr: NonNull<u8>, size: usize) {
        match self.cache_for(size) {
            Some(cache) => cache.free(ptr),
            None => panic!("kfree: size {size} exceeds {KALLOC_MAX}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::HeapPages;

    #[test]
    fn size_classes_round_up() {
        assert_eq!(KALLOC_NUM_CACHES, 9);
        assert_eq!(size_class(0), Some(0));
        assert_eq!(size_class(1), Some(0));
        assert_eq!(size_class(8), Some(0));
        assert_eq!(size_class(9), Some(1));
        assert_eq!(size_class(100), Some(4));
        assert_eq!(size_class(1025), Some(8));
        assert_eq!(size_class(KALLOC_MAX), Some(KALLOC_NUM_CACHES - 1));
        assert_eq!(size_class(KALLOC_MAX + 1), None);
    }

    #[test]
    fn ladder_covers_every_class() {
        let source = HeapPages::default();
        let meta = Cache::bootstrap();
        let classes = SizeClasses::new(&meta, &source).unwrap();

        let sizes: Vec<_> = classes.iter().map(Cache::object_size).collect();
        assert_eq!(sizes, [8, 16, 32, 64, 128, 256, 512, 1024, 2048]);
        assert_eq!(classes.cache_for(100).unwrap().object_size(), 128);
        assert_eq!(classes.cache_for(0).unwrap().object_size(), 8);
    }

    #[test]
    fn allocations_land_in_their_class() {
        let source = HeapPages::default();
        let meta = Cache::bootstrap();
        let classes = SizeClasses::new(&meta, &source).unwrap();

        let ptr = classes.alloc(100, &source).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0x5A, 100) };
        assert_eq!(classes.cache_for(128).unwrap().stats().partial_pages, 1);

        classes.free(ptr, 100);
        let stats = classes.cache_for(128).unwrap().stats();
        assert_eq!((stats.partial_pages, stats.empty_pages), (0, 1));
    }

    #[test]
    fn oversized_requests_are_refused() {
        let source = HeapPages::default();
        let meta = Cache::bootstrap();
        let classes = SizeClasses::new(&meta, &source).unwrap();

        assert!(matches!(
            classes.alloc(KALLOC_MAX + 1, &source),
            Err(CacheError::ObjectSize(_))
        ));
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn oversized_free_panics() {
        let source = HeapPages::default();
        let meta = Cache::bootstrap();
        let classes = SizeClasses::new(&meta, &source).unwrap();
        classes.free(NonNull::dangling(), KALLOC_MAX + 1);
    }
}
