//! Address types for physical and virtual memory.
//!
//! The kernel runs with 32-bit two-level paging, so both kinds of address are thin
//! `u32` newtypes. Keeping them distinct makes the compiler reject the classic bug of
//! writing a virtual address into a page-table entry (or dereferencing a physical one).

use core::fmt;
use core::ops::{Add, Sub};

use crate::FrameNumber;
use crate::paging::{ENTRIES_PER_TABLE, KERNEL_VIRTUAL_BASE, PAGE_SHIFT, PAGE_SIZE};

/// Generates the representation and arithmetic shared by both address types.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: u32) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_u32(self) -> u32 {
                self.0
            }

            /// Returns the raw address value widened to `usize`.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: u32) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: u32) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: u32) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> u32 {
                self.0 & (PAGE_SIZE as u32 - 1)
            }

            /// Returns the start of the page containing this address.
            #[inline]
            pub const fn page_base(self) -> Self {
                Self(self.0 & !(PAGE_SIZE as u32 - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#010x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(addr: u32) -> Self {
                Self(addr)
            }
        }

        impl From<$name> for u32 {
            #[inline]
            fn from(addr: $name) -> Self {
                addr.0
            }
        }

        impl Add<u32> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u32) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<u32> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: u32) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = u32;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysAddr,
    "A physical memory address.\n\n\
     Physical addresses are what page-table entries and the buddy allocator deal in.\n\
     They can only be dereferenced after being mapped through the kernel window."
);

impl PhysAddr {
    /// Returns the frame containing this address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 >> PAGE_SHIFT)
    }
}

impl_address_common!(
    VirtAddr,
    "A virtual memory address.\n\n\
     Addresses at or above `KERNEL_VIRTUAL_BASE` belong to the kernel region shared by\n\
     every page directory; everything below is per-task user space."
);

impl VirtAddr {
    /// Builds the address selected by a directory index and a table index.
    #[inline]
    pub const fn from_indices(directory: usize, table: usize) -> Self {
        Self(((directory as u32) << 22) | ((table as u32) << PAGE_SHIFT))
    }

    /// Returns the page-directory index (bits 22-31).
    #[inline]
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Returns the page-table index (bits 12-21).
    #[inline]
    pub const fn table_index(self) -> usize {
        ((self.0 >> PAGE_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1)
    }

    /// Returns true if the address lies in the kernel region.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_VIRTUAL_BASE
    }

    /// Converts the address to a pointer.
    ///
    /// Only meaningful while the address is mapped in the active directory.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}
