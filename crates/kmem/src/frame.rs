//! Page descriptors and page handles.

use core::ops::BitOr;

use crate::{FrameNumber, VirtAddr};

/// Flags describing the state of a physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameFlag {
    /// Frame is allocated (or never entered the free lists).
    Used = 1 << 0,
    /// Frame is reserved: kernel image, descriptor table, boot structures and modules.
    /// Only a claim hands it to the allocator.
    Permanent = 1 << 1,
    /// Frame is owned by a task address space.
    User = 1 << 2,
    /// Frame backs an object cache.
    Cache = 1 << 3,
}

/// Set of [`FrameFlag`]s stored in a page descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Creates an empty flag set.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Creates a flag set from raw bits.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns true if no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Sets the given flag.
    pub fn set(&mut self, flag: FrameFlag) {
        self.0 |= flag as u8;
    }

    /// Clears the given flag.
    pub fn clear(&mut self, flag: FrameFlag) {
        self.0 &= !(flag as u8);
    }

    /// Tests if the given flag is set.
    pub const fn test(self, flag: FrameFlag) -> bool {
        (self.0 & flag as u8) != 0
    }
}

impl core::fmt::Debug for FrameFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut set = f.debug_set();
        for flag in [
            FrameFlag::Used,
            FrameFlag::Permanent,
            FrameFlag::User,
            FrameFlag::Cache,
        ] {
            if self.test(flag) {
                set.entry(&flag);
            }
        }
        set.finish()
    }
}

/// Metadata for one physical page frame.
///
/// Descriptors live in the Page Frame Table, indexed by frame number. The `prev`/`next`
/// links are meaningful only while the frame heads a block on a buddy free list.
#[derive(Debug, Clone, Copy)]
pub struct PageDescriptor {
    /// State of the frame.
    pub flags: FrameFlags,
    order: u8,
    pub(crate) prev: Option<FrameNumber>,
    pub(crate) next: Option<FrameNumber>,
    virt: Option<VirtAddr>,
}

impl PageDescriptor {
    /// A descriptor for a frame that is not managed: used and permanent.
    pub const fn reserved() -> Self {
        Self {
            flags: FrameFlags::from_bits(FrameFlag::Used as u8 | FrameFlag::Permanent as u8),
            order: 0,
            prev: None,
            next: None,
            virt: None,
        }
    }

    /// Order recorded for frames inside an allocated block.
    const INTERIOR: u8 = u8::MAX;

    /// Returns the order of the block this frame heads. Frames inside an allocated
    /// block report an order no block can have.
    pub fn order(&self) -> usize {
        self.order as usize
    }

    /// Marks the frame as lying inside a block headed by another frame.
    pub fn set_interior(&mut self) {
        self.order = Self::INTERIOR;
    }

    /// Sets the order of the block this frame heads.
    pub fn set_order(&mut self, order: usize) {
        debug_assert!(order <= u8::MAX as usize);
        self.order = order as u8;
    }

    /// Returns true if the frame is neither used nor permanent.
    pub fn is_free(&self) -> bool {
        !self.flags.test(FrameFlag::Used) && !self.flags.test(FrameFlag::Permanent)
    }

    /// Returns the cached kernel-window address of this frame, if it has been mapped.
    pub fn virt(&self) -> Option<VirtAddr> {
        self.virt
    }

    /// Records the kernel-window address of this frame.
    pub fn set_virt(&mut self, virt: VirtAddr) {
        self.virt = Some(virt);
    }
}

impl Default for PageDescriptor {
    fn default() -> Self {
        Self::reserved()
    }
}

/// Handle to an allocated page (or the first page of an allocated run).
///
/// The handle is the frame number itself; the descriptor, physical address and window
/// address are derived from it by the memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageHandle(FrameNumber);

impl PageHandle {
    /// Creates a handle for the given frame.
    pub const fn new(frame: FrameNumber) -> Self {
        Self(frame)
    }

    /// Returns the frame this handle refers to.
    pub const fn frame(self) -> FrameNumber {
        self.0
    }

    /// Returns the handle `count` frames further on.
    pub fn offset(self, count: u32) -> Self {
        Self(self.0 + count)
    }
}

/// Options for page allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags(u8);

impl AllocFlags {
    /// No options.
    pub const NONE: Self = Self(0);
    /// Zero-fill the pages before returning them.
    pub const ZERO: Self = Self(1 << 0);
    /// The pages back an object cache.
    pub const CACHE: Self = Self(1 << 1);

    /// Returns true if every option in `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl BitOr for AllocFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
