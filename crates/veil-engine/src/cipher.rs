//! Header and tail access on one underlying file.
//!
//! The [`CipherManager`] owns the on-disk layout rules: where the header
//! lives, how its size is discovered, and how the encrypted tail is read back
//! and rewritten. The resize migration lives in [`crate::migrate`].

use veil_core::config::EngineConfig;
use veil_core::{CfsError, CfsResult, IntegrityError};
use veil_crypto::{decode, encode, FileKey};

use crate::aligned::AlignedIo;
use crate::header::{Header, HEADER_ALIGNMENT};
use crate::tail::{add_padding_filler, parse_padding_block, TAIL_BLOCK_SIZE};

/// What the first bytes of a file turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderProbe {
    /// Zero-length file.
    Empty,
    /// Shorter than one header alignment unit, so it cannot carry a header.
    TooSmall { size: u64 },
    /// No valid header. The file is treated as unencrypted.
    Plain(IntegrityError),
    Present(Header),
}

impl HeaderProbe {
    pub fn header(&self) -> Option<&Header> {
        match self {
            HeaderProbe::Present(h) => Some(h),
            _ => None,
        }
    }

    pub fn into_header(self) -> Option<Header> {
        match self {
            HeaderProbe::Present(h) => Some(h),
            _ => None,
        }
    }

    /// True for a file with no bytes at all.
    pub fn is_empty(&self) -> bool {
        matches!(self, HeaderProbe::Empty)
    }
}

/// Logical length recovered from the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailInfo {
    pub valid_length: u64,
    pub filler: usize,
    /// The marker did not verify and the length is a best-effort guess.
    pub recovered: bool,
}

#[derive(Debug, Clone)]
pub struct CipherManager {
    pub(crate) chunk_size: usize,
    pub(crate) recovery_mode: bool,
}

impl CipherManager {
    pub fn new(config: &EngineConfig) -> Self {
        CipherManager {
            chunk_size: config.migration_chunk_size.max(1),
            recovery_mode: config.recovery_mode,
        }
    }

    pub fn recovery_mode(&self) -> bool {
        self.recovery_mode
    }

    /// Probe the file for a header.
    ///
    /// Reads one alignment unit first and only fetches the rest of the block
    /// when the prefix announces a larger header.
    pub fn read_header(&self, io: &AlignedIo<'_>) -> CfsResult<HeaderProbe> {
        let size = io.size()?;
        if size == 0 {
            return Ok(HeaderProbe::Empty);
        }
        if size < HEADER_ALIGNMENT as u64 {
            return Ok(HeaderProbe::TooSmall { size });
        }

        let first = io.read(0, HEADER_ALIGNMENT as usize)?;
        let prefix = match Header::peek(&first) {
            Ok(prefix) => prefix,
            Err(e) => return Ok(HeaderProbe::Plain(e)),
        };
        if prefix.block_size as u64 > size {
            return Ok(HeaderProbe::Plain(IntegrityError::Truncated {
                len: size as usize,
                needed: prefix.block_size as usize,
            }));
        }

        let full = if prefix.block_size > HEADER_ALIGNMENT {
            io.read(0, prefix.block_size as usize)?
        } else {
            first
        };
        Ok(match Header::decode(&full) {
            Ok(header) => HeaderProbe::Present(header),
            Err(e) => HeaderProbe::Plain(e),
        })
    }

    /// Write `header` at offset 0 in a single aligned write.
    ///
    /// The file is extended to at least `block_size`; a longer file keeps its
    /// size.
    pub fn write_header(&self, io: &AlignedIo<'_>, header: &Header) -> CfsResult<()> {
        let bytes = header.encode();
        let size = io.size()?;
        let target = size.max(bytes.len() as u64);
        if size < target {
            io.set_size(target)?;
        }
        io.write(0, &bytes)?;
        if io.size()? != target {
            io.set_size(target)?;
        }
        tracing::debug!(
            file = %io.file(),
            header_size = header.block_size,
            "header written"
        );
        Ok(())
    }

    /// Decrypt the padding block and derive the logical file length.
    pub fn retrieve_tail(
        &self,
        io: &AlignedIo<'_>,
        header_size: u64,
        key: &FileKey,
        nonce: u64,
        recover: bool,
    ) -> CfsResult<TailInfo> {
        let recover = recover || self.recovery_mode;
        let physical = io.size()?;
        let block = TAIL_BLOCK_SIZE as u64;
        if physical < header_size + block {
            return tail_failure(
                IntegrityError::Layout(format!(
                    "file of {physical} bytes cannot hold header {header_size} and tail"
                )),
                physical,
                header_size,
                recover,
            );
        }

        let padding_at = physical - block;
        let logical = padding_at - header_size;
        if logical % block != 0 {
            return tail_failure(
                IntegrityError::Layout(format!("padding block at unaligned offset {logical}")),
                physical,
                header_size,
                recover,
            );
        }

        let mut padding = io.read(padding_at, TAIL_BLOCK_SIZE)?;
        decode(&mut padding, key, nonce, logical)?;
        match parse_padding_block(&padding) {
            Ok(filler) if filler as u64 <= logical => Ok(TailInfo {
                valid_length: logical - filler as u64,
                filler,
                recovered: false,
            }),
            Ok(filler) => tail_failure(
                IntegrityError::Layout(format!("filler {filler} larger than data {logical}")),
                physical,
                header_size,
                recover,
            ),
            Err(e) => tail_failure(e, physical, header_size, recover),
        }
    }

    /// Rewrite the tail for `valid_length` bytes of data and set the exact
    /// physical size. Returns that size.
    pub fn update_tail(
        &self,
        io: &AlignedIo<'_>,
        header_size: u64,
        key: &FileKey,
        nonce: u64,
        valid_length: u64,
    ) -> CfsResult<u64> {
        let tail = encrypted_tail(key, nonce, valid_length)?;
        io.write(header_size + valid_length, &tail)?;
        let physical = header_size + valid_length + tail.len() as u64;
        io.set_size(physical)?;
        Ok(physical)
    }
}

/// Filler plus padding block for `valid_length`, encrypted at its logical
/// offset.
pub(crate) fn encrypted_tail(key: &FileKey, nonce: u64, valid_length: u64) -> CfsResult<Vec<u8>> {
    let partial = (valid_length % TAIL_BLOCK_SIZE as u64) as usize;
    let mut block = vec![0u8; partial];
    add_padding_filler(&mut block, partial);
    let mut tail = block.split_off(partial);
    encode(&mut tail, key, nonce, valid_length)?;
    Ok(tail)
}

fn tail_failure(
    err: IntegrityError,
    physical: u64,
    header_size: u64,
    recover: bool,
) -> CfsResult<TailInfo> {
    if !recover {
        return Err(CfsError::Integrity(err));
    }
    let valid_length = physical.saturating_sub(header_size + TAIL_BLOCK_SIZE as u64);
    tracing::warn!(
        error = %err,
        physical,
        header_size,
        valid_length,
        "tail verification failed, continuing in recovery mode"
    );
    Ok(TailInfo {
        valid_length,
        filler: 0,
        recovered: true,
    })
}
