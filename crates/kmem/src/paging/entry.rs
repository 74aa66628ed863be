//! Page directory / page table entry.

use crate::PhysAddr;

use super::flags::PageFlags;

/// A single 32-bit directory or table entry.
///
/// - Bits 0-11: flags
/// - Bits 12-31: physical frame address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// Physical address mask (bits 12-31).
    const ADDRESS_MASK: u32 = 0xFFFF_F000;

    /// An entry with nothing mapped.
    pub const EMPTY: Self = Self(0);

    /// Creates a new entry.
    ///
    /// The physical address must be page-aligned.
    pub fn new(address: PhysAddr, flags: PageFlags) -> Self {
        debug_assert!(
            address.page_offset() == 0,
            "physical address must be page-aligned"
        );

        Self((address.as_u32() & Self::ADDRESS_MASK) | flags.to_raw())
    }

    /// Returns the physical address stored in this entry, or `None` if it is not present.
    pub fn address(self) -> Option<PhysAddr> {
        self.is_present()
            .then_some(PhysAddr::new(self.0 & Self::ADDRESS_MASK))
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0)
    }

    /// Returns whether this entry is present.
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Clears this entry.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw value of this entry.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}
