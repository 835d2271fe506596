//! Zero-coding, the run-length scheme simulators use for sparse bodies.
//!
//! A run of `n` zero bytes is written as the pair `0x00, n`. Runs longer
//! than 255 are split into several pairs. Every other byte is copied
//! through unchanged, so data without zeros encodes to itself.

use crate::wire::{WireError, MAX_DECODED_SIZE};

/// Compress runs of zero bytes.
pub fn zero_encode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut run: u8 = 0;

    for &byte in src {
        if byte == 0 {
            if run == u8::MAX {
                out.extend_from_slice(&[0x00, run]);
                run = 0;
            }
            run += 1;
            continue;
        }
        if run > 0 {
            out.extend_from_slice(&[0x00, run]);
            run = 0;
        }
        out.push(byte);
    }

    if run > 0 {
        out.extend_from_slice(&[0x00, run]);
    }
    out
}

/// Expand a zero-coded region.
///
/// A `0x00` with no count byte after it is malformed. Output is capped at
/// [`MAX_DECODED_SIZE`].
pub fn zero_decode(src: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(src.len() * 2);
    let mut iter = src.iter().enumerate();

    while let Some((i, &byte)) = iter.next() {
        if byte != 0 {
            out.push(byte);
        } else {
            let (_, &count) = iter.next().ok_or(WireError::Truncated {
                needed: 1,
                remaining: src.len() - i - 1,
            })?;
            out.resize(out.len() + count as usize, 0);
        }

        if out.len() > MAX_DECODED_SIZE {
            return Err(WireError::DecodedTooLarge);
        }
    }
    Ok(out)
}
