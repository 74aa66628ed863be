//! Frame numbers.
//!
//! A frame number is the index of a physical page frame; it doubles as the index
//! into the Page Frame Table and as the link type of the buddy free lists.

use core::{
    fmt,
    iter::Step,
    ops::{Add, Sub},
};

use crate::{PhysAddr, paging::PAGE_SHIFT};

/// A physical memory frame number.
///
/// Frame numbers are zero-indexed and correspond to `PAGE_SIZE`-aligned physical
/// addresses. With 32-bit physical addresses there are at most 2^20 frames.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(u32);

impl FrameNumber {
    /// Creates a new frame number.
    #[inline]
    pub const fn new(number: u32) -> Self {
        Self(number)
    }

    /// Returns the raw frame number.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the frame number as a table index.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysAddr {
        PhysAddr::new(self.0 << PAGE_SHIFT)
    }

    /// Returns true if the frame index is aligned to a block of `2^order` frames.
    #[inline]
    pub const fn is_order_aligned(self, order: usize) -> bool {
        self.0 & ((1 << order) - 1) == 0
    }

    /// Returns the buddy of the block of `2^order` frames starting at this frame.
    ///
    /// Flipping bit `order` of the index yields the other half of the enclosing block of
    /// `2^(order + 1)` frames, whichever half this one is.
    #[inline]
    pub const fn buddy(self, order: usize) -> Self {
        Self(self.0 ^ (1 << order))
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<PhysAddr> for FrameNumber {
    #[inline]
    fn from(addr: PhysAddr) -> Self {
        addr.frame_number()
    }
}

impl Add<u32> for FrameNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<u32> for FrameNumber {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: u32) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub<FrameNumber> for FrameNumber {
    type Output = u32;

    #[inline]
    fn sub(self, rhs: FrameNumber) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Step for FrameNumber {
    fn steps_between(start: &Self, end: &Self) -> (usize, Option<usize>) {
        if start <= end {
            let diff = (end.0 - start.0) as usize;
            (diff, Some(diff))
        } else {
            (0, None)
        }
    }

    fn forward_checked(start: Self, count: usize) -> Option<Self> {
        let count = u32::try_from(count).ok()?;
        start.0.checked_add(count).map(Self)
    }

    fn backward_checked(start: Self, count: usize) -> Option<Self> {
        let count = u32::try_from(count).ok()?;
        start.0.checked_sub(count).map(Self)
    }
}
