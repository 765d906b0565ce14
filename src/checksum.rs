//! Trigger 5 bulk header checksum
//!
//! The last byte of every Trigger 5 bulk header makes the byte sum of the
//! whole header wrap to zero.

/// Compute the checksum byte for `bytes`
///
/// Returns the two's-complement negation of the byte sum, truncated to 8 bits.
#[inline]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Verify a buffer whose final byte is a checksum over the preceding bytes
///
/// An empty buffer never verifies.
#[inline]
pub fn verify(bytes: &[u8]) -> bool {
    match bytes.split_last() {
        Some((&expected, body)) => checksum(body) == expected,
        None => false,
    }
}
