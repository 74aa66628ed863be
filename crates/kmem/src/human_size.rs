//! Human-readable byte counts for log lines.

use core::fmt;

/// Wraps a size in bytes and formats it with binary prefixes.
///
/// Values are shown with up to two decimal places, trailing zeros dropped. Formatting is
/// done in integer arithmetic so it is usable from interrupt context.
///
/// ```
/// use kmem::HumanSize;
///
/// assert_eq!(HumanSize(1023).to_string(), "1023B");
/// assert_eq!(HumanSize(1536).to_string(), "1.5KiB");
/// assert_eq!(HumanSize(16 << 20).to_string(), "16MiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub u64);

impl HumanSize {
    const UNITS: [&'static str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

    /// Returns the raw byte count.
    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl From<u32> for HumanSize {
    fn from(value: u32) -> Self {
        Self(u64::from(value))
    }
}

impl From<u64> for HumanSize {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<usize> for HumanSize {
    fn from(value: usize) -> Self {
        Self(value as u64)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut unit = 0;
        while unit + 1 < Self::UNITS.len() && self.0 >> (10 * (unit + 1)) > 0 {
            unit += 1;
        }
        if unit == 0 {
            return write!(f, "{}B", self.0);
        }

        let scale = 1u128 << (10 * unit);
        let hundredths = (u128::from(self.0) * 100 + scale / 2) / scale;
        let (whole, frac) = (hundredths / 100, hundredths % 100);
        let suffix = Self::UNITS[unit];
        match frac {
            0 => write!(f, "{whole}{suffix}"),
            _ if frac % 10 == 0 => write!(f, "{whole}.{}{suffix}", frac / 10),
            _ => write!(f, "{whole}.{frac:02}{suffix}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes() {
        assert_eq!(HumanSize(0).to_string(), "0B");
        assert_eq!(HumanSize(512).to_string(), "512B");
        assert_eq!(HumanSize(1023).to_string(), "1023B");
    }

    #[test]
    fn formats_binary_units() {
        assert_eq!(HumanSize(1024).to_string(), "1KiB");
        assert_eq!(HumanSize(4096).to_string(), "4KiB");
        assert_eq!(HumanSize(1 << 20).to_string(), "1MiB");
        assert_eq!(HumanSize(3 << 30).to_string(), "3GiB");
        assert_eq!(HumanSize(1 << 40).to_string(), "1TiB");
    }

    #[test]
    fn drops_trailing_zeros() {
        assert_eq!(HumanSize(1536).to_string(), "1.5KiB");
        assert_eq!(HumanSize(1_310_720).to_string(), "1.25MiB");
        assert_eq!(HumanSize(1_610_612_736).to_string(), "1.5GiB");
    }

    #[test]
    fn rounds_to_two_decimals() {
        assert_eq!(HumanSize(1025).to_string(), "1KiB");
        assert_eq!(HumanSize(1034).to_string(), "1.01KiB");
    }

    #[test]
    fn converts_from_integers() {
        assert_eq!(HumanSize::from(4096u32), HumanSize(4096));
        assert_eq!(HumanSize::from(4096usize).bytes(), 4096);
    }
}
