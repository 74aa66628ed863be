//! Page-table entry flags.

/// Flags carried in the low 12 bits of a directory or table entry.
///
/// Bit positions are the hardware ones, so the raw value can be or-ed straight into an
/// entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(u32);

impl PageFlags {
    /// Present bit (bit 0).
    const PRESENT: u32 = 1 << 0;

    /// Writable bit (bit 1).
    const WRITABLE: u32 = 1 << 1;

    /// User-accessible bit (bit 2).
    const USER: u32 = 1 << 2;

    /// Global bit (bit 8), honoured for kernel mappings when CR4.PGE is set.
    const GLOBAL: u32 = 1 << 8;

    /// First software-available bit (bit 9): the address space owns the mapped frame.
    const OWNED: u32 = 1 << 9;

    /// Mask of every bit a flag value may occupy.
    pub const MASK: u32 = 0xFFF;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Present and writable, supervisor only. Used for the kernel window.
    pub const fn kernel() -> Self {
        Self(Self::PRESENT | Self::WRITABLE)
    }

    /// Present, writable and user accessible. Used for user tables and pages.
    pub const fn user() -> Self {
        Self(Self::PRESENT | Self::WRITABLE | Self::USER)
    }

    /// Creates page flags from a raw value, discarding bits outside [`Self::MASK`].
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & Self::MASK)
    }

    /// Returns the raw value of these flags.
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Returns whether the present bit is set.
    pub const fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    /// Sets or clears the present bit.
    pub fn set_present(&mut self, present: bool) {
        self.assign(Self::PRESENT, present);
    }

    /// Returns whether the writable bit is set.
    pub const fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.assign(Self::WRITABLE, writable);
    }

    /// Returns whether the user-accessible bit is set.
    pub const fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.assign(Self::USER, user);
    }

    /// Returns whether the global bit is set.
    pub const fn is_global(self) -> bool {
        (self.0 & Self::GLOBAL) != 0
    }

    /// Sets or clears the global bit.
    pub fn set_global(&mut self, global: bool) {
        self.assign(Self::GLOBAL, global);
    }

    /// Returns whether the owned bit is set.
    pub const fn is_owned(self) -> bool {
        (self.0 & Self::OWNED) != 0
    }

    /// Sets or clears the owned bit. The processor ignores it.
    pub fn set_owned(&mut self, owned: bool) {
        self.assign(Self::OWNED, owned);
    }

    fn assign(&mut self, bit: u32, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets() {
        assert!(PageFlags::kernel().is_present());
        assert!(PageFlags::kernel().is_writable());
        assert!(!PageFlags::kernel().is_user());
        assert!(PageFlags::user().is_user());
        assert_eq!(PageFlags::user().to_raw(), 0b111);
    }

    #[test]
    fn setters_toggle_bits() {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_global(true);
        assert_eq!(flags.to_raw(), 0x101);
        flags.set_present(false);
        assert!(!flags.is_present());
        assert!(flags.is_global());
    }

    #[test]
    fn owned_is_a_software_bit() {
        let mut flags = PageFlags::user();
        assert!(!flags.is_owned());
        flags.set_owned(true);
        assert_eq!(flags.to_raw(), 0x207);
        assert!(flags.is_owned() && flags.is_user());
    }

    #[test]
    fn from_raw_truncates() {
        assert_eq!(PageFlags::from_raw(0xFFFF_F003).to_raw(), 0x003);
    }
}
