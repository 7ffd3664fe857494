//! Constant-time API key comparison.

use subtle::ConstantTimeEq;

/// Compares `presented` against `expected` in constant time with respect to
/// both the bytes and the lengths. Pads the shorter value up to the longer
/// one before comparing so that timing leaks neither the byte contents nor
/// an early length mismatch, then additionally requires the real lengths
/// to match.
pub fn keys_match(presented: &str, expected: &str) -> bool {
    let max_len = presented.len().max(expected.len());
    let mut a = vec![0u8; max_len];
    let mut b = vec![0u8; max_len];
    a[..presented.len()].copy_from_slice(presented.as_bytes());
    b[..expected.len()].copy_from_slice(expected.as_bytes());

    let bytes_equal: bool = a.ct_eq(&b).into();
    let lengths_equal = presented.len() == expected.len();
    bytes_equal & lengths_equal
}

/// Checks a presented key against any key in the configured set.
pub fn key_in_set(presented: &str, keys: &[String]) -> bool {
    // Every candidate is checked -- short-circuiting on the first match
    // would leak which position matched via timing.
    keys.iter()
        .fold(false, |found, candidate| found | keys_match(presented, candidate))
}
