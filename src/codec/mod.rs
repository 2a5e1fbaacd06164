// MIT License - Copyright (c) 2021 TJForc

//! Wire codecs for the two supported frame families.
//!
//! - [`vrcop`]: line oriented, start marker `<`/`>`, CR terminated,
//!   optional backslash continuation.
//! - [`redrat`]: byte oriented, bracketed, decoded through an explicit
//!   state machine.

pub mod redrat;
pub mod vrcop;

/// Byte-sum of a slice truncated to one byte. Both families use it.
pub fn sum_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Two uppercase hex digits for a checksum byte.
pub(crate) fn hex_pair(value: u8) -> [u8; 2] {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    [DIGITS[(value >> 4) as usize], DIGITS[(value & 0x0F) as usize]]
}

/// Value of one hex digit, either case.
pub(crate) fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_checksum_wraps() {
        assert_eq!(sum_checksum(b""), 0);
        assert_eq!(sum_checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(sum_checksum(b"P"), 0x50);
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(&hex_pair(0x3C), b"3C");
        assert_eq!(&hex_pair(0x05), b"05");
        assert_eq!(hex_value(b'c'), Some(12));
        assert_eq!(hex_value(b'G'), None);
    }
}
