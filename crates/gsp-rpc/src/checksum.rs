//! Element checksum.
//!
//! The element is folded as little-endian 64-bit words (a short tail is zero
//! padded) and the two 32-bit halves of the fold are XORed together. The writer
//! stores the fold of the element taken with the checksum field zeroed; the
//! reader folds the complete element and must get zero.

use crate::layout::MsgElementHeader;

pub fn fold(bytes: &[u8]) -> u32 {
    let mut acc = 0u64;
    let mut words = bytes.chunks_exact(8);
    for word in &mut words {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(word);
        acc ^= u64::from_le_bytes(buf);
    }
    let tail = words.remainder();
    if !tail.is_empty() {
        let mut buf = [0u8; 8];
        buf[..tail.len()].copy_from_slice(tail);
        acc ^= u64::from_le_bytes(buf);
    }
    (acc >> 32) as u32 ^ acc as u32
}

/// Fills in the checksum field of a complete element image.
pub fn stamp(element: &mut [u8]) {
    let field = MsgElementHeader::CHECKSUM_OFFSET..MsgElementHeader::CHECKSUM_OFFSET + 4;
    element[field.clone()].fill(0);
    let sum = fold(element);
    element[field].copy_from_slice(&sum.to_le_bytes());
}

pub fn verify(element: &[u8]) -> bool {
    fold(element) == 0
}
