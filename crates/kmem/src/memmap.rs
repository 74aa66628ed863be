//! Boot-time description of physical memory.
//!
//! The boot loader hands over a list of regions, each usable or reserved. On top of
//! that the kernel knows ranges it must never hand out: its own image, the modules the
//! boot loader loaded, and later the Page Frame Table itself. [`MemoryMap`] combines
//! both and answers the two questions initialization asks: where can the descriptor
//! table go, and which runs of frames are free to seed the allocator with.
//!
//! # Building a Memory Map
//!
//! Implement [`BootMemoryRegion`] on the boot loader's entry type:
//!
//! ```ignore
//! impl BootMemoryRegion for MultibootEntry {
//!     fn base(&self) -> u64 { self.addr }
//!     fn size(&self) -> u64 { self.len }
//!     fn is_usable(&self) -> bool { self.kind == MULTIBOOT_MEMORY_AVAILABLE }
//! }
//!
//! let mut map = MemoryMap::new(entries, PhysAddr::new(0x0010_0000)..kernel_end);
//! map.reserve(module_start, module_end)?;
//! ```

use core::fmt;
use core::ops::Range;

use crate::paging::PAGE_SIZE;
use crate::{FrameNumber, PhysAddr};

/// Number of frames addressable with 32-bit physical addresses.
pub const MAX_FRAMES: usize = 1 << 20;

/// Maximum number of explicit reservations a memory map can hold.
pub const MAX_RESERVATIONS: usize = 16;

const ADDRESS_SPACE_END: u64 = (MAX_FRAMES * PAGE_SIZE) as u64;

/// Represents a single entry in a boot-time memory map.
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> u64;

    /// Returns the size of this region in bytes.
    fn size(&self) -> u64;

    /// Returns whether this region contains usable memory.
    ///
    /// Reserved, ACPI, and device memory return `false`.
    fn is_usable(&self) -> bool;
}

/// Errors raised while setting up memory management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The memory map contains no usable memory below 4 GiB.
    NoUsableMemory,
    /// No contiguous usable region is large enough for the Page Frame Table.
    NoContiguousRegion,
    /// More than [`MAX_RESERVATIONS`] ranges were reserved.
    TooManyReservations,
    /// The kernel window cannot map the boot-time structures.
    WindowExhausted,
    /// The `kalloc` size-class caches could not be created.
    SizeClasses,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            InitError::NoUsableMemory => "no usable memory",
            InitError::NoContiguousRegion => {
                "could not find a sufficiently large contiguous memory region"
            }
            InitError::TooManyReservations => "too many reserved ranges",
            InitError::WindowExhausted => "kernel window exhausted during initialization",
            InitError::SizeClasses => "could not create the kalloc caches",
        };
        f.write_str(msg)
    }
}

/// A half-open range of frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameRange {
    start: usize,
    end: usize,
}

impl FrameRange {
    /// The frames touched by the byte range `[start, end)`, rounded outward.
    fn covering(start: u64, end: u64) -> Self {
        let page = PAGE_SIZE as u64;
        let end = end.min(ADDRESS_SPACE_END);
        let start = start.min(end);
        Self {
            start: (start / page) as usize,
            end: end.div_ceil(page) as usize,
        }
    }

    /// The whole frames inside the byte range `[start, end)`, rounded inward.
    fn within(start: u64, end: u64) -> Self {
        let page = PAGE_SIZE as u64;
        let end = end.min(ADDRESS_SPACE_END);
        let start = start.min(end);
        let first = start.div_ceil(page) as usize;
        let last = (end / page) as usize;
        Self {
            start: first,
            end: last.max(first),
        }
    }

    fn contains(&self, frame: usize) -> bool {
        frame >= self.start && frame < self.end
    }

    fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Physical memory layout as known at boot.
pub struct MemoryMap<'a, R> {
    regions: &'a [R],
    kernel_image: Range<PhysAddr>,
    reserved: [FrameRange; MAX_RESERVATIONS],
    reserved_len: usize,
}

impl<'a, R: BootMemoryRegion> MemoryMap<'a, R> {
    /// Creates a memory map from boot regions and the physical extent of the kernel
    /// image, which is reserved.
    pub fn new(regions: &'a [R], kernel_image: Range<PhysAddr>) -> Self {
        let mut reserved = [FrameRange { start: 0, end: 0 }; MAX_RESERVATIONS];
        reserved[0] = FrameRange::covering(
            u64::from(kernel_image.start.as_u32()),
            u64::from(kernel_image.end.as_u32()),
        );

        Self {
            regions,
            kernel_image,
            reserved,
            reserved_len: 1,
        }
    }

    /// Reserves the byte range `[start, end)`, e.g. a boot module.
    pub fn reserve(&mut self, start: PhysAddr, end: PhysAddr) -> Result<(), InitError> {
        let range = FrameRange::covering(u64::from(start.as_u32()), u64::from(end.as_u32()));
        if range.is_empty() {
            return Ok(());
        }
        if self.reserved_len == MAX_RESERVATIONS {
            return Err(InitError::TooManyReservations);
        }

        self.reserved[self.reserved_len] = range;
        self.reserved_len += 1;
        Ok(())
    }

    /// Returns the physical extent of the kernel image.
    pub fn kernel_image(&self) -> Range<PhysAddr> {
        self.kernel_image.clone()
    }

    /// Returns the number of frames the Page Frame Table must describe: up to the end of
    /// the highest usable region below 4 GiB.
    pub fn frame_count(&self) -> usize {
        self.usable_regions()
            .map(|range| range.end)
            .max()
            .unwrap_or(0)
    }

    /// Returns the number of usable bytes that cannot be managed because they lie
    /// above 4 GiB.
    pub fn unmanageable_bytes(&self) -> u64 {
        self.regions
            .iter()
            .filter(|region| region.is_usable())
            .map(|region| {
                let end = region.base().saturating_add(region.size());
                end.saturating_sub(region.base().max(ADDRESS_SPACE_END))
            })
            .sum()
    }

    /// Iterates over maximal runs of usable, unreserved frames as `(first, count)`.
    pub fn usable_runs(&self) -> UsableRuns<'_, 'a, R> {
        UsableRuns {
            map: self,
            region: 0,
            cursor: 0,
            end: 0,
        }
    }

    /// Returns the first run of at least `pages` usable, unreserved frames.
    pub fn find_region(&self, pages: usize) -> Option<FrameNumber> {
        self.usable_runs()
            .find(|&(_, count)| count >= pages)
            .map(|(start, _)| start)
    }

    fn usable_regions(&self) -> impl Iterator<Item = FrameRange> + '_ {
        self.regions
            .iter()
            .filter(|region| region.is_usable())
            .map(|region| {
                FrameRange::within(region.base(), region.base().saturating_add(region.size()))
            })
            .filter(|range| !range.is_empty())
    }

    /// Returns the end of the exclusion containing `frame`, if any.
    fn excluded_until(&self, frame: usize) -> Option<usize> {
        let reserved = self.reserved[..self.reserved_len]
            .iter()
            .copied()
            .filter(|range| range.contains(frame));
        let holes = self
            .regions
            .iter()
            .filter(|region| !region.is_usable())
            .map(|region| {
                FrameRange::covering(region.base(), region.base().saturating_add(region.size()))
            })
            .filter(|range| range.contains(frame));

        reserved.chain(holes).map(|range| range.end).max()
    }

    /// Returns the start of the first exclusion beginning after `frame`.
    fn next_exclusion(&self, frame: usize) -> Option<usize> {
        let reserved = self.reserved[..self.reserved_len].iter().copied();
        let holes = self
            .regions
            .iter()
            .filter(|region| !region.is_usable())
            .map(|region| {
                FrameRange::covering(region.base(), region.base().saturating_add(region.size()))
            });

        reserved
            .chain(holes)
            .filter(|range| !range.is_empty() && range.start > frame)
            .map(|range| range.start)
            .min()
    }
}

/// Iterator returned by [`MemoryMap::usable_runs`].
pub struct UsableRuns<'m, 'a, R> {
    map: &'m MemoryMap<'a, R>,
    region: usize,
    cursor: usize,
    end: usize,
}

impl<R: BootMemoryRegion> Iterator for UsableRuns<'_, '_, R> {
    type Item = (FrameNumber, usize);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cursor >= self.end {
                let region = self.map.regions.get(self.region)?;
                self.region += 1;
                if !region.is_usable() {
                    continue;
                }
                let range =
                    FrameRange::within(region.base(), region.base().saturating_add(region.size()));
                self.cursor = range.start;
                self.end = range.end;
                continue;
            }

            if let Some(end) = self.map.excluded_until(self.cursor) {
                self.cursor = end;
                continue;
            }

            let run_end = self
                .map
                .next_exclusion(self.cursor)
                .map_or(self.end, |start| start.min(self.end));
            let start = self.cursor;
            self.cursor = run_end;
            return Some((FrameNumber::new(start as u32), run_end - start));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Test implementation of BootMemoryRegion.
    pub(crate) struct TestRegion {
        base: u64,
        size: u64,
        usable: bool,
    }

    impl TestRegion {
        pub(crate) fn usable(base: u64, size: u64) -> Self {
            Self {
                base,
                size,
                usable: true,
            }
        }

        pub(crate) fn reserved(base: u64, size: u64) -> Self {
            Self {
                base,
                size,
                usable: false,
            }
        }
    }

    impl BootMemoryRegion for TestRegion {
        fn base(&self) -> u64 {
            self.base
        }

        fn size(&self) -> u64 {
            self.size
        }

        fn is_usable(&self) -> bool {
            self.usable
        }
    }

    const PAGE: u64 = PAGE_SIZE as u64;

    fn no_image() -> Range<PhysAddr> {
        PhysAddr::new(0)..PhysAddr::new(0)
    }

    fn runs<R: BootMemoryRegion>(map: &MemoryMap<'_, R>) -> Vec<(u32, usize)> {
        map.usable_runs()
            .map(|(start, count)| (start.as_u32(), count))
            .collect()
    }

    #[test]
    fn empty_boot_map_has_no_frames() {
        let boot_map: &[TestRegion] = &[];
        let map = MemoryMap::new(boot_map, no_image());

        assert_eq!(map.frame_count(), 0);
        assert!(runs(&map).is_empty());
        assert_eq!(map.find_region(1), None);
    }

    #[test]
    fn single_usable_region() {
        let boot_map = [TestRegion::usable(0, PAGE * 100)];
        let map = MemoryMap::new(&boot_map, no_image());

        assert_eq!(map.frame_count(), 100);
        assert_eq!(runs(&map), [(0, 100)]);
    }

    #[test]
    fn partial_pages_are_rounded_inward() {
        let boot_map = [TestRegion::usable(0x800, PAGE * 4)];
        let map = MemoryMap::new(&boot_map, no_image());

        assert_eq!(runs(&map), [(1, 3)]);
        assert_eq!(map.frame_count(), 4);
    }

    #[test]
    fn kernel_image_and_reservations_are_skipped() {
        let boot_map = [TestRegion::usable(0, PAGE * 100)];
        let mut map = MemoryMap::new(&boot_map, PhysAddr::new(0)..PhysAddr::new(0x0000_a800));
        map.reserve(PhysAddr::new(0x0002_0000), PhysAddr::new(0x0002_2000))
            .unwrap();

        // Image covers frames 0..11, module 32..34.
        assert_eq!(runs(&map), [(11, 21), (34, 66)]);
    }

    #[test]
    fn reserved_holes_within_usable_region() {
        let boot_map = [
            TestRegion::usable(0, PAGE * 100),
            TestRegion::reserved(PAGE * 40, PAGE * 20),
        ];
        let map = MemoryMap::new(&boot_map, no_image());

        assert_eq!(runs(&map), [(0, 40), (60, 40)]);
        assert_eq!(map.frame_count(), 100);
    }

    #[test]
    fn overlapping_exclusions_merge() {
        let boot_map = [TestRegion::usable(0, PAGE * 64)];
        let mut map = MemoryMap::new(&boot_map, PhysAddr::new(0)..PhysAddr::new(0x8000));
        map.reserve(PhysAddr::new(0x4000), PhysAddr::new(0xc000)).unwrap();

        assert_eq!(runs(&map), [(12, 52)]);
    }

    #[test]
    fn memory_above_four_gib_is_ignored() {
        let boot_map = [
            TestRegion::usable(0xFFFF_0000, PAGE * 32),
            TestRegion::usable(0x1_0000_0000, PAGE * 16),
        ];
        let map = MemoryMap::new(&boot_map, no_image());

        assert_eq!(runs(&map), [(0xFFFF0, 16)]);
        assert_eq!(map.frame_count(), MAX_FRAMES);
        assert_eq!(map.unmanageable_bytes(), PAGE * 32);
    }

    #[test]
    fn find_region_picks_first_fit() {
        let boot_map = [
            TestRegion::usable(0, PAGE * 8),
            TestRegion::reserved(PAGE * 8, PAGE * 8),
            TestRegion::usable(PAGE * 16, PAGE * 64),
        ];
        let map = MemoryMap::new(&boot_map, no_image());

        assert_eq!(map.find_region(4), Some(FrameNumber::new(0)));
        assert_eq!(map.find_region(9), Some(FrameNumber::new(16)));
        assert_eq!(map.find_region(65), None);
    }

    #[test]
    fn reservations_are_bounded() {
        let boot_map = [TestRegion::usable(0, PAGE * 64)];
        let mut map = MemoryMap::new(&boot_map, no_image());

        for i in 1..MAX_RESERVATIONS as u32 {
            map.reserve(PhysAddr::new(i * 0x1000), PhysAddr::new(i * 0x1000 + 1))
                .unwrap();
        }
        assert_eq!(
            map.reserve(PhysAddr::new(0x3_0000), PhysAddr::new(0x3_1000)),
            Err(InitError::TooManyReservations)
        );
        // Empty ranges never consume a slot.
        assert_eq!(map.reserve(PhysAddr::new(0x5000), PhysAddr::new(0x5000)), Ok(()));
    }
}
