//! Bit manipulation helpers for integer and bit-string values.
//!
//! Logix addresses individual bits inside integers (`Tag.5`) and packs BOOL
//! arrays into DWORDs. These helpers work on any width up to 64 bits; index 0 is
//! always the least significant bit.
//!
//! # Example
//!
//! ```
//! use logix_cip::utils::{from_bits, get_bit, to_bits};
//!
//! let value: u64 = 0b1010_0101;
//!
//! assert!(get_bit(value, 0));
//! assert!(!get_bit(value, 1));
//!
//! let bits = to_bits(value, 8);
//! assert_eq!(bits.len(), 8);
//! assert_eq!(from_bits(&bits), value);
//! ```

/// Gets a single bit.
///
/// # Arguments
///
/// * `value` - The value to extract from
/// * `bit` - Bit position (0-63, where 0 is LSB)
///
/// # Example
///
/// ```
/// use logix_cip::utils::get_bit;
///
/// assert!(get_bit(0b101, 2));
/// assert!(!get_bit(0b101, 1));
/// ```
#[inline]
pub fn get_bit(value: u64, bit: u32) -> bool {
    bit < 64 && (value >> bit) & 1 != 0
}

/// Sets or clears a single bit.
///
/// # Example
///
/// ```
/// use logix_cip::utils::set_bit;
///
/// assert_eq!(set_bit(0, 5, true), 0b10_0000);
/// assert_eq!(set_bit(0xFF, 0, false), 0xFE);
/// ```
#[inline]
pub fn set_bit(value: u64, bit: u32, state: bool) -> u64 {
    if bit >= 64 {
        return value;
    }
    if state {
        value | (1 << bit)
    } else {
        value & !(1 << bit)
    }
}

/// Returns a mask with the low `width` bits set.
#[inline]
pub fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Expands the low `width` bits of a value into booleans, index 0 = LSB.
///
/// # Arguments
///
/// * `value` - The value to expand
/// * `width` - Number of bits to produce (at most 64)
///
/// # Example
///
/// ```
/// use logix_cip::utils::to_bits;
///
/// let bits = to_bits(0b11, 16);
/// assert_eq!(bits.len(), 16);
/// assert!(bits[0] && bits[1] && !bits[2]);
/// ```
pub fn to_bits(value: u64, width: u32) -> Vec<bool> {
    (0..width.min(64)).map(|i| get_bit(value, i)).collect()
}

/// Packs booleans (index 0 = LSB) back into a value. Bits past 64 are ignored.
///
/// # Example
///
/// ```
/// use logix_cip::utils::from_bits;
///
/// assert_eq!(from_bits(&[true, true, false, true]), 0b1011);
/// ```
pub fn from_bits(bits: &[bool]) -> u64 {
    bits.iter()
        .take(64)
        .enumerate()
        .filter(|(_, &bit)| bit)
        .fold(0, |acc, (i, _)| acc | (1 << i))
}

/// Number of 32-bit words needed to cover `count` bits starting at `first_bit`.
///
/// This is how many DWORD elements a BOOL-array range touches.
///
/// # Example
///
/// ```
/// use logix_cip::utils::words_spanned;
///
/// assert_eq!(words_spanned(0, 32), 1);
/// assert_eq!(words_spanned(31, 2), 2);
/// assert_eq!(words_spanned(5, 70), 3);
/// ```
#[inline]
pub fn words_spanned(first_bit: u32, count: u32) -> u32 {
    (first_bit + count).div_ceil(32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_bit() {
        let value: u64 = 0b0000_0101;
        assert!(get_bit(value, 0));
        assert!(!get_bit(value, 1));
        assert!(get_bit(value, 2));
        assert!(!get_bit(value, 63));
        assert!(get_bit(u64::MAX, 63));
        assert!(!get_bit(u64::MAX, 64));
    }

    #[test]
    fn test_set_bit() {
        assert_eq!(set_bit(0, 0, true), 1);
        assert_eq!(set_bit(1, 0, false), 0);
        assert_eq!(set_bit(0, 31, true), 0x8000_0000);
        assert_eq!(set_bit(0xFFFF, 8, false), 0xFEFF);
        assert_eq!(set_bit(7, 64, true), 7);
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask(0), 0);
        assert_eq!(mask(8), 0xFF);
        assert_eq!(mask(32), 0xFFFF_FFFF);
        assert_eq!(mask(64), u64::MAX);
    }

    #[test]
    fn test_bits_roundtrip() {
        for width in [8, 16, 32, 64] {
            for value in [0u64, 1, 0xA5, mask(width), 1 << (width - 1)] {
                let bits = to_bits(value, width);
                assert_eq!(bits.len(), width as usize);
                assert_eq!(from_bits(&bits), value, "width {width}");
            }
        }
    }

    #[test]
    fn test_to_bits_truncates_to_width() {
        assert_eq!(from_bits(&to_bits(0x1FF, 8)), 0xFF);
    }

    #[test]
    fn test_words_spanned() {
        assert_eq!(words_spanned(0, 1), 1);
        assert_eq!(words_spanned(0, 33), 2);
        assert_eq!(words_spanned(3, 1), 1);
        assert_eq!(words_spanned(31, 1), 1);
        assert_eq!(words_spanned(31, 2), 2);
    }
}
