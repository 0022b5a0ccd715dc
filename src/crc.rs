//! 4-bit link checksum.
//!
//! The checksum covers the first seven bytes of a frame, MSB first, through a
//! bit-serial feedback register (polynomial `x^4 + x + 1`). It is stored in the
//! low nibble of the last frame byte; the high nibble belongs to the feedback
//! flags and is never touched here.

use crate::frame::{FRAME_BYTES, WireFrame};

/// Number of leading frame bytes covered by the checksum
pub const CRC_COVERED_BYTES: usize = FRAME_BYTES - 1;

const CRC_NIBBLE_MASK: u8 = 0x0F;
const FEEDBACK_BIT: u8 = 0x10;
const FEEDBACK_TAPS: u8 = 0x03;

/// Compute the checksum nibble over the covered part of `frame`.
pub fn compute(frame: &WireFrame) -> u8 {
    compute_bytes(&frame.as_bytes()[..CRC_COVERED_BYTES])
}

/// Compute the checksum nibble over an arbitrary byte prefix.
pub fn compute_bytes(bytes: &[u8]) -> u8 {
    let mut register: u8 = 0;

    for byte in bytes {
        for bit in (0..8).rev() {
            let mut scratch = register << 1;
            if (byte >> bit) & 1 == 1 {
                scratch ^= FEEDBACK_BIT;
            }
            if scratch & FEEDBACK_BIT != 0 {
                scratch = (scratch ^ FEEDBACK_TAPS) & !FEEDBACK_BIT;
            }
            register = scratch & CRC_NIBBLE_MASK;
        }
    }

    register
}

/// Store the checksum in the low nibble of the last byte.
///
/// With `invalidate` set the 4-bit complement is stored instead, which makes
/// the receiving end fail its verification on purpose. Discovery and the CRC
/// self-test modes rely on this.
pub fn apply(frame: &mut WireFrame, invalidate: bool) {
    let crc = compute(frame);
    let stored = if invalidate { !crc & CRC_NIBBLE_MASK } else { crc };
    let last = &mut frame.as_bytes_mut()[FRAME_BYTES - 1];
    *last = (*last & !CRC_NIBBLE_MASK) | stored;
}

/// Read back the stored checksum nibble.
pub fn stored(frame: &WireFrame) -> u8 {
    frame.as_bytes()[FRAME_BYTES - 1] & CRC_NIBBLE_MASK
}

/// `true` when the stored nibble matches a fresh, non-inverted computation.
pub fn verify(frame: &WireFrame) -> bool {
    stored(frame) == compute(frame)
}
