//! Buddy allocator over the Page Frame Table.
//!
//! Free memory is kept as blocks of 2^order contiguous frames, for orders 0 through
//! [`MAX_ORDER`]. Every block starts at a frame index aligned to its size, which makes a
//! block's buddy (the other half of the next larger block) a single XOR away.
//!
//! All frames of a free block have empty flags; only the first frame (the block head)
//! is linked on the free list for its order and records that order. Allocated frames
//! carry [`FrameFlag::Used`].

use core::fmt;

use crate::frame_table::{FreeList, FreeListIter, PageFrameTable};
use crate::{FrameFlag, FrameFlags, FrameNumber};

/// Largest block order (order 10 = 1024 frames = 4 MiB).
pub const MAX_ORDER: usize = 10;

/// Number of free lists (orders 0 through MAX_ORDER inclusive).
const NUM_FREE_LISTS: usize = MAX_ORDER + 1;

/// Largest number of frames a single allocation can return.
pub const MAX_BLOCK_FRAMES: usize = 1 << MAX_ORDER;

/// Errors reported by the buddy allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free block large enough exists.
    OutOfMemory,
    /// The requested order exceeds [`MAX_ORDER`].
    OrderTooLarge,
    /// The requested frame count is zero or larger than one maximal block.
    InvalidCount,
    /// The frame is not described by the Page Frame Table.
    OutOfRange,
    /// The frame is not allocated (double free, or a frame that was never handed out).
    NotAllocated,
    /// The frame is permanent and can never be freed.
    Permanent,
    /// The block is freed with an order other than the one it was allocated with.
    OrderMismatch,
    /// The frame was not reserved at boot, so it cannot be claimed.
    NotReserved,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::OutOfMemory => "out of memory",
            AllocError::OrderTooLarge => "block order too large",
            AllocError::InvalidCount => "invalid frame count",
            AllocError::OutOfRange => "frame outside the page frame table",
            AllocError::NotAllocated => "frame is not allocated",
            AllocError::Permanent => "frame is permanent",
            AllocError::OrderMismatch => "block freed with the wrong order",
            AllocError::NotReserved => "frame is not reserved",
        };
        f.write_str(msg)
    }
}

/// Returns the smallest order whose block holds at least `count` frames.
pub const fn order_for(count: usize) -> usize {
    if count <= 1 {
        0
    } else {
        (usize::BITS - (count - 1).leading_zeros()) as usize
    }
}

/// Returns the order of the largest block not exceeding `count` frames.
const fn floor_order(count: usize) -> usize {
    (usize::BITS - 1 - count.leading_zeros()) as usize
}

/// Buddy allocator managing the frames of a [`PageFrameTable`].
///
/// The allocator does no locking of its own; the memory manager wraps it in an
/// interrupt-safe spinlock.
pub struct BuddyAllocator {
    table: PageFrameTable,
    free_lists: [FreeList; NUM_FREE_LISTS],
    total_frames: usize,
    free_frames: usize,
}

impl BuddyAllocator {
    /// Creates an allocator with no free memory over the given table.
    ///
    /// Memory becomes available through [`BuddyAllocator::release_range`].
    pub fn new(table: PageFrameTable) -> Self {
        Self {
            table,
            free_lists: [const { FreeList::new() }; NUM_FREE_LISTS],
            total_frames: 0,
            free_frames: 0,
        }
    }

    /// Hands a run of reserved frames over to the allocator.
    ///
    /// The run is inserted as a sequence of maximal aligned blocks, each coalescing with
    /// any free neighbours.
    pub fn release_range(&mut self, start: FrameNumber, count: usize) -> Result<(), AllocError> {
        if count == 0 {
            return Ok(());
        }
        if start.as_usize() + count > self.table.len() {
            return Err(AllocError::OutOfRange);
        }
        if self.table.run(start, count).iter().any(|desc| desc.is_free()) {
            return Err(AllocError::NotAllocated);
        }

        for desc in self.table.run_mut(start, count) {
            desc.flags = FrameFlags::new();
        }

        let mut frame = start;
        let mut remaining = count;
        while remaining > 0 {
            let mut order = MAX_ORDER;
            while order > 0 && (!frame.is_order_aligned(order) || (1 << order) > remaining) {
                order -= 1;
            }

            self.coalesce_and_insert(frame, order);
            frame = frame + (1 << order);
            remaining -= 1 << order;
        }

        self.total_frames += count;
        self.free_frames += count;
        Ok(())
    }

    /// Hands frames reserved at boot (loaded modules, init-only code) over to the
    /// allocator once their contents are no longer needed.
    ///
    /// Every frame of the run must still be reserved; nothing is released otherwise.
    pub fn claim(&mut self, start: FrameNumber, count: usize) -> Result<(), AllocError> {
        if start.as_usize() + count > self.table.len() {
            return Err(AllocError::OutOfRange);
        }
        let reserved = self
            .table
            .run(start, count)
            .iter()
            .all(|desc| desc.flags.test(FrameFlag::Permanent));
        if !reserved {
            return Err(AllocError::NotReserved);
        }
        self.release_range(start, count)
    }

    /// Allocates a block of 2^order contiguous frames aligned to its size.
    pub fn allocate(&mut self, order: usize) -> Result<FrameNumber, AllocError> {
        if order > MAX_ORDER {
            return Err(AllocError::OrderTooLarge);
        }
        self.allocate_run(1 << order)
    }

    /// Allocates exactly `count` contiguous frames.
    ///
    /// The run is carved out of the smallest sufficient block; the unused tail goes back
    /// to the free lists. The run is recorded as descending power-of-two pieces, which is
    /// the shape [`BuddyAllocator::free_exact`] expects back.
    pub fn allocate_exact(&mut self, count: usize) -> Result<FrameNumber, AllocError> {
        if count == 0 || count > MAX_BLOCK_FRAMES {
            return Err(AllocError::InvalidCount);
        }
        self.allocate_run(count)
    }

    /// Frees a block of 2^order frames previously returned by [`BuddyAllocator::allocate`].
    pub fn free(&mut self, frame: FrameNumber, order: usize) -> Result<(), AllocError> {
        if order > MAX_ORDER {
            return Err(AllocError::OrderTooLarge);
        }
        self.check_freeable(frame, order)?;
        self.release_block(frame, order);
        Ok(())
    }

    /// Frees a run of `count` frames previously returned by
    /// [`BuddyAllocator::allocate_exact`].
    pub fn free_exact(&mut self, frame: FrameNumber, count: usize) -> Result<(), AllocError> {
        if count == 0 || count > MAX_BLOCK_FRAMES {
            return Err(AllocError::InvalidCount);
        }

        let mut piece = frame;
        let mut remaining = count;
        while remaining > 0 {
            let order = floor_order(remaining);
            self.check_freeable(piece, order)?;
            piece = piece + (1 << order);
            remaining -= 1 << order;
        }

        let mut piece = frame;
        let mut remaining = count;
        while remaining > 0 {
            let order = floor_order(remaining);
            self.release_block(piece, order);
            piece = piece + (1 << order);
            remaining -= 1 << order;
        }
        Ok(())
    }

    /// Returns the number of frames handed to the allocator.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Returns the number of free frames across all orders.
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Returns the number of allocated frames.
    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_frames
    }

    /// Returns the number of free blocks at a specific order.
    pub fn free_blocks_at_order(&self, order: usize) -> usize {
        self.free_lists.get(order).map_or(0, FreeList::len)
    }

    /// Iterates over the heads of the free blocks at `order`, most recently freed first.
    ///
    /// # Panics
    /// Panics if `order > MAX_ORDER`.
    pub fn free_blocks(&self, order: usize) -> FreeListIter<'_> {
        self.free_lists[order].iter(&self.table)
    }

    /// Returns the Page Frame Table.
    pub fn table(&self) -> &PageFrameTable {
        &self.table
    }

    /// Returns the Page Frame Table mutably.
    pub fn table_mut(&mut self) -> &mut PageFrameTable {
        &mut self.table
    }

    fn allocate_run(&mut self, count: usize) -> Result<FrameNumber, AllocError> {
        let target = order_for(count);
        let order = (target..=MAX_ORDER)
            .find(|&order| !self.free_lists[order].is_empty())
            .ok_or(AllocError::OutOfMemory)?;

        let block = self.free_lists[order]
            .pop_front(&mut self.table)
            .ok_or(AllocError::OutOfMemory)?;
        self.trim(block, order, count);

        for desc in self.table.run_mut(block, count) {
            debug_assert!(desc.flags.is_empty(), "free frame with flags set");
            desc.flags.set(FrameFlag::Used);
        }
        self.mark_interiors(block, count);
        self.free_frames -= count;

        log::trace!("buddy: allocated {count} frame(s) at {block} (from order {order})");
        Ok(block)
    }

    /// Splits the unlinked free block `block` of `order` until exactly `wanted` frames
    /// remain at its start, returning the halves that are not needed to the free lists.
    fn trim(&mut self, mut block: FrameNumber, mut order: usize, mut wanted: usize) {
        loop {
            let size = 1 << order;
            if wanted == size {
                self.set_order(block, order);
                return;
            }
            debug_assert!(order > 0 && wanted < size);

            order -= 1;
            let half = size >> 1;
            let buddy = block.buddy(order);
            self.set_order(block, order);
            self.set_order(buddy, order);

            if wanted <= half {
                self.push_free(buddy, order);
            } else {
                // The lower half is kept whole; carve the rest out of the upper half.
                wanted -= half;
                block = buddy;
            }
        }
    }

    /// Marks every frame of the run that does not head one of its pieces, so only the
    /// piece heads can be freed.
    fn mark_interiors(&mut self, run: FrameNumber, count: usize) {
        let mut piece = run;
        let mut remaining = count;
        while remaining > 0 {
            let size: usize = 1 << floor_order(remaining);
            for desc in self.table.run_mut(piece + 1, size - 1) {
                desc.set_interior();
            }
            piece = piece + size as u32;
            remaining -= size;
        }
    }

    fn check_freeable(&self, frame: FrameNumber, order: usize) -> Result<(), AllocError> {
        let count = 1 << order;
        if frame.as_usize() + count > self.table.len() {
            return Err(AllocError::OutOfRange);
        }

        let head = self.table.get(frame).ok_or(AllocError::OutOfRange)?;
        if head.flags.test(FrameFlag::Permanent) {
            return Err(AllocError::Permanent);
        }
        if !head.flags.test(FrameFlag::Used) {
            return Err(AllocError::NotAllocated);
        }
        if head.order() != order || !frame.is_order_aligned(order) {
            return Err(AllocError::OrderMismatch);
        }

        for desc in self.table.run(frame, count) {
            if desc.flags.test(FrameFlag::Permanent) {
                return Err(AllocError::Permanent);
            }
            if !desc.flags.test(FrameFlag::Used) {
                return Err(AllocError::NotAllocated);
            }
        }
        Ok(())
    }

    fn release_block(&mut self, frame: FrameNumber, order: usize) {
        for desc in self.table.run_mut(frame, 1 << order) {
            desc.flags = FrameFlags::new();
        }
        self.free_frames += 1 << order;
        self.coalesce_and_insert(frame, order);
    }

    /// Merges the free block with its buddy for as long as the buddy is a free block of
    /// the same order, then links the result on its free list.
    fn coalesce_and_insert(&mut self, frame: FrameNumber, order: usize) {
        let mut block = frame;
        let mut order = order;
        self.set_order(block, order);

        while order < MAX_ORDER {
            let buddy = block.buddy(order);
            let mergeable = self
                .table
                .get(buddy)
                .is_some_and(|desc| desc.is_free() && desc.order() == order);
            if !mergeable {
                break;
            }

            self.check_listed(buddy, order);
            self.free_lists[order].remove(&mut self.table, buddy);
            log::trace!("buddy: merged {block} with {buddy} at order {order}");

            block = block.min(buddy);
            order += 1;
            self.set_order(block, order);
        }

        self.push_free(block, order);
    }

    fn push_free(&mut self, frame: FrameNumber, order: usize) {
        self.check_not_listed(frame, order);
        self.free_lists[order].push_front(&mut self.table, frame);
    }

    fn set_order(&mut self, frame: FrameNumber, order: usize) {
        if let Some(desc) = self.table.get_mut(frame) {
            desc.set_order(order);
        }
    }

    #[cfg(feature = "debug-mm")]
    fn check_not_listed(&self, frame: FrameNumber, order: usize) {
        assert!(
            !self.free_blocks(order).any(|listed| listed == frame),
            "frame {frame} is already on the order {order} free list"
        );
    }

    #[cfg(not(feature = "debug-mm"))]
    fn check_not_listed(&self, _frame: FrameNumber, _order: usize) {}

    #[cfg(feature = "debug-mm")]
    fn check_listed(&self, frame: FrameNumber, order: usize) {
        assert!(
            self.free_blocks(order).any(|listed| listed == frame),
            "free frame {frame} is missing from the order {order} free list"
        );
    }

    #[cfg(not(feature = "debug-mm"))]
    fn check_listed(&self, _frame: FrameNumber, _order: usize) {}
}
