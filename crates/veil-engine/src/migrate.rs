//! Header-resize migration.
//!
//! Moves the file content by `future.block_size - present.block_size` bytes
//! and re-encrypts it from the present key to the future key. Either side may
//! be absent (plain file). Growing copies end to start, shrinking copies start
//! to end, so a chunk never overwrites source bytes that have not been read.
//!
//! ```text
//! grow:    [H_p| data ....... |tail]      shrink:  [H_p   | data ..... |tail]
//!          [H_f    | data ....... |tail]           [H_f| data ..... |tail]
//! ```
//!
//! Callers hold the file's I/O gate exclusively for the whole migration.

use veil_core::{CfsError, CfsResult};
use veil_crypto::{decode, encode, FileKey};
use veil_storage::align_up;

use crate::aligned::AlignedIo;
use crate::cipher::{encrypted_tail, CipherManager};
use crate::header::Header;

/// Header and file key for one side of a migration.
#[derive(Debug, Clone, Copy)]
pub struct FileCrypto<'a> {
    pub header: &'a Header,
    pub key: &'a FileKey,
}

impl FileCrypto<'_> {
    fn header_size(&self) -> u64 {
        self.header.block_size as u64
    }

    fn nonce(&self) -> u64 {
        self.header.nonce
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub present_header_size: u64,
    pub future_header_size: u64,
    /// Logical length of the content that was moved.
    pub valid_length: u64,
    pub physical_size: u64,
    /// Tail verification failed and the length was guessed.
    pub recovered: bool,
}

impl CipherManager {
    /// Rewrite the file from the `present` layout to the `future` layout.
    pub fn process_file(
        &self,
        io: &AlignedIo<'_>,
        present: Option<FileCrypto<'_>>,
        future: Option<FileCrypto<'_>>,
        recover: bool,
    ) -> CfsResult<MigrationReport> {
        let original_size = io.size()?;
        let (valid_length, recovered) = match present {
            Some(p) => {
                let tail = self.retrieve_tail(io, p.header_size(), p.key, p.nonce(), recover)?;
                (tail.valid_length, tail.recovered)
            }
            None => (original_size, false),
        };

        let mut run = Migration {
            io,
            chunk: self.chunk_size,
            present,
            future,
            valid_length,
            committed: false,
        };
        let result = run.execute();
        match result {
            Ok(physical_size) => {
                let report = MigrationReport {
                    present_header_size: present.map_or(0, |p| p.header_size()),
                    future_header_size: future.map_or(0, |f| f.header_size()),
                    valid_length,
                    physical_size,
                    recovered,
                };
                tracing::info!(
                    file = %io.file(),
                    from = report.present_header_size,
                    to = report.future_header_size,
                    valid_length,
                    "migration complete"
                );
                Ok(report)
            }
            Err(e) => {
                if !run.committed {
                    if let Err(restore) = io.set_size(original_size) {
                        tracing::warn!(file = %io.file(), error = %restore, "could not restore size");
                    }
                }
                tracing::warn!(
                    file = %io.file(),
                    committed = run.committed,
                    error = %e,
                    "migration aborted"
                );
                Err(CfsError::Migration {
                    committed: run.committed,
                    reason: e.to_string(),
                })
            }
        }
    }
}

struct Migration<'a, 'k> {
    io: &'a AlignedIo<'a>,
    chunk: usize,
    present: Option<FileCrypto<'k>>,
    future: Option<FileCrypto<'k>>,
    valid_length: u64,
    committed: bool,
}

impl Migration<'_, '_> {
    fn present_size(&self) -> u64 {
        self.present.map_or(0, |p| p.header_size())
    }

    fn future_size(&self) -> u64 {
        self.future.map_or(0, |f| f.header_size())
    }

    fn final_size(&self) -> u64 {
        match self.future {
            Some(f) => crate::tail::physical_size(f.header_size(), self.valid_length),
            None => self.valid_length,
        }
    }

    /// Same key and nonce on both sides: content bytes only move.
    fn passthrough(&self) -> bool {
        match (self.present, self.future) {
            (Some(p), Some(f)) => p.key == f.key && p.nonce() == f.nonce(),
            (None, None) => true,
            _ => false,
        }
    }

    fn execute(&mut self) -> CfsResult<u64> {
        let from = self.present_size();
        let to = self.future_size();
        let final_size = self.final_size();

        if to > from {
            // Room for the aligned writes past the current end of file
            let scratch = align_up(final_size, self.io.sector());
            if scratch > self.io.size()? {
                self.io.set_size(scratch)?;
            }
            self.write_tail()?;
            let mut pos = self.valid_length;
            while pos > 0 {
                let len = (self.chunk as u64).min(pos);
                let start = pos - len;
                self.copy_chunk(start, len as usize)?;
                pos = start;
            }
        } else if from != to || !self.passthrough() {
            let mut pos = 0;
            while pos < self.valid_length {
                let len = (self.chunk as u64).min(self.valid_length - pos);
                self.copy_chunk(pos, len as usize)?;
                pos += len;
            }
            self.write_tail()?;
        }

        if let Some(f) = self.future {
            let bytes = f.header.encode();
            self.io.write(0, &bytes)?;
            self.committed = true;
        }
        self.io.set_size(final_size)?;
        Ok(final_size)
    }

    fn write_tail(&mut self) -> CfsResult<()> {
        let Some(f) = self.future else {
            return Ok(());
        };
        let tail = encrypted_tail(f.key, f.nonce(), self.valid_length)?;
        self.io.write(f.header_size() + self.valid_length, &tail)?;
        self.committed = true;
        Ok(())
    }

    fn copy_chunk(&mut self, logical: u64, len: usize) -> CfsResult<()> {
        let mut buf = self.io.read(self.present_size() + logical, len)?;
        if buf.len() != len {
            return Err(CfsError::Storage(format!(
                "source truncated at logical offset {logical}: {} of {len} bytes",
                buf.len()
            )));
        }
        if !self.passthrough() {
            if let Some(p) = self.present {
                decode(&mut buf, p.key, p.nonce(), logical)?;
            }
            if let Some(f) = self.future {
                encode(&mut buf, f.key, f.nonce(), logical)?;
            }
        }
        self.io.write(self.future_size() + logical, &buf)?;
        self.committed = true;
        Ok(())
    }
}
