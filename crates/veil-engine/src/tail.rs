//! Cryptographic tail: filler + padding block after the file data.
//!
//! ```text
//! | header (H) | data (L) | filler (F) | padding block (B) |
//! F = (B - L % B) % B, random bytes completing the last data block
//! padding block = "VEILTAIL" | F:u32 LE | crc32 of the previous 12 bytes | random
//! ```
//!
//! The physical size `H + L + F + B` is always a multiple of `B`, so the file
//! never ends inside a sector and the exact plaintext length is only
//! recoverable with the file key. The padding block is encrypted with the file
//! key at its logical offset like any other data block.

use veil_core::IntegrityError;
use veil_crypto::{crc32, random_fill};

pub const TAIL_BLOCK_SIZE: usize = 512;

const TAIL_MAGIC: &[u8; 8] = b"VEILTAIL";
const MARKER_LEN: usize = 16;

/// Sizes of the two tail parts for one logical length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailLayout {
    pub filler: usize,
    pub padding: usize,
}

impl TailLayout {
    pub fn for_length(valid_length: u64) -> Self {
        TailLayout {
            filler: filler_for(valid_length),
            padding: TAIL_BLOCK_SIZE,
        }
    }

    /// Total tail bytes.
    pub fn len(&self) -> u64 {
        (self.filler + self.padding) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Filler bytes needed after `valid_length` data bytes.
pub fn filler_for(valid_length: u64) -> usize {
    let rem = (valid_length % TAIL_BLOCK_SIZE as u64) as usize;
    (TAIL_BLOCK_SIZE - rem) % TAIL_BLOCK_SIZE
}

/// Data + tail bytes that follow a header of `header_size`.
pub fn physical_size(header_size: u64, valid_length: u64) -> u64 {
    header_size + valid_length + TailLayout::for_length(valid_length).len()
}

/// Logical offset of the padding block for a file of `valid_length` bytes.
pub fn padding_offset(valid_length: u64) -> u64 {
    valid_length + filler_for(valid_length) as u64
}

/// Build a plaintext padding block recording `filler`.
pub fn padding_block(filler: usize) -> Vec<u8> {
    let mut block = vec![0u8; TAIL_BLOCK_SIZE];
    random_fill(&mut block[MARKER_LEN..]);
    block[..8].copy_from_slice(TAIL_MAGIC);
    block[8..12].copy_from_slice(&(filler as u32).to_le_bytes());
    let crc = crc32(&block[..12]);
    block[12..16].copy_from_slice(&crc.to_le_bytes());
    block
}

/// Read the filler length out of a plaintext padding block.
pub fn parse_padding_block(block: &[u8]) -> Result<usize, IntegrityError> {
    if block.len() < MARKER_LEN {
        return Err(IntegrityError::Truncated {
            len: block.len(),
            needed: MARKER_LEN,
        });
    }
    if &block[..8] != TAIL_MAGIC {
        return Err(IntegrityError::TailMarker);
    }
    let stored = u32::from_le_bytes([block[12], block[13], block[14], block[15]]);
    if stored != crc32(&block[..12]) {
        return Err(IntegrityError::TailMarker);
    }
    let filler = u32::from_le_bytes([block[8], block[9], block[10], block[11]]) as usize;
    if filler >= TAIL_BLOCK_SIZE {
        return Err(IntegrityError::TailMarker);
    }
    Ok(filler)
}

/// Complete the final partial block: keep `valid_len` bytes of `buf`, append
/// random filler up to the block boundary and the padding block.
pub fn add_padding_filler(buf: &mut Vec<u8>, valid_len: usize) -> TailLayout {
    buf.truncate(valid_len);
    let layout = TailLayout::for_length(valid_len as u64);
    let start = buf.len();
    buf.resize(start + layout.filler, 0);
    random_fill(&mut buf[start..]);
    buf.extend_from_slice(&padding_block(layout.filler));
    layout
}

/// Number of valid data bytes in a buffer produced by [`add_padding_filler`].
pub fn get_padding(buf: &[u8]) -> Result<usize, IntegrityError> {
    if buf.len() < TAIL_BLOCK_SIZE {
        return Err(IntegrityError::Truncated {
            len: buf.len(),
            needed: TAIL_BLOCK_SIZE,
        });
    }
    let padding_start = buf.len() - TAIL_BLOCK_SIZE;
    let filler = parse_padding_block(&buf[padding_start..])?;
    padding_start
        .checked_sub(filler)
        .ok_or(IntegrityError::Layout(format!(
            "filler {filler} exceeds data before padding ({padding_start})"
        )))
}
