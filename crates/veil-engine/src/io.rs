//! Read/write translation for one open file.
//!
//! Applications address logical offsets. For an encrypted file the physical
//! offset is `logical + header_size`, data is encrypted positionally at the
//! logical offset, and the tail after the data is never visible. Every
//! request reaches storage through [`AlignedIo`], so unaligned requests are
//! repaired with read-modify-write there.
//!
//! Bytes between `valid_data_length` and `valid_length` were never written
//! (the file was extended by a size change). Reads synthesize zeros for them,
//! and they are materialized as encrypted zeros before anything else depends
//! on the on-disk bytes.

use veil_core::CfsResult;
use veil_crypto::{decode, encode};
use veil_storage::{align_up, DirEntry};

use crate::aligned::AlignedIo;
use crate::cipher::CipherManager;
use crate::tail::{physical_size, TAIL_BLOCK_SIZE};
use crate::tracker::{LinkCrypto, LinkState};

/// Zero-fill step when materializing unwritten ranges.
const ZERO_CHUNK: u64 = 64 * 1024;

/// Sizes as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSizes {
    pub end_of_file: u64,
    pub allocation_size: u64,
}

/// Read up to `len` bytes at logical `offset`. Empty at or past end of file.
pub fn read(io: &AlignedIo<'_>, state: &LinkState, offset: u64, len: usize) -> CfsResult<Vec<u8>> {
    let eof = state.valid_length;
    if offset >= eof || len == 0 {
        return Ok(Vec::new());
    }
    let len = (eof - offset).min(len as u64) as usize;

    let Some(crypto) = &state.crypto else {
        return io.read(offset, len);
    };

    let mut out = vec![0u8; len];
    let vdl = state.valid_data_length;
    if offset < vdl {
        let stored = (vdl - offset).min(len as u64) as usize;
        let mut buf = io.read(crypto.header_size() + offset, stored)?;
        buf.resize(stored, 0);
        decode(&mut buf, &crypto.file_key, crypto.nonce(), offset)?;
        out[..stored].copy_from_slice(&buf);
    }
    Ok(out)
}

/// Write `data` at logical `offset`. Returns the bytes written.
pub fn write(
    io: &AlignedIo<'_>,
    cipher: &CipherManager,
    state: &mut LinkState,
    offset: u64,
    data: &[u8],
) -> CfsResult<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let end = offset + data.len() as u64;

    let Some(crypto) = state.crypto.as_ref() else {
        io.write(offset, data)?;
        let valid_length = state.valid_length.max(end);
        trim_to(io, valid_length)?;
        state.valid_length = valid_length;
        state.valid_data_length = valid_length;
        return Ok(data.len());
    };

    if offset > state.valid_data_length {
        zero_fill(io, crypto, state.valid_data_length, offset)?;
    }

    let mut buf = data.to_vec();
    encode(&mut buf, &crypto.file_key, crypto.nonce(), offset)?;
    io.write(crypto.header_size() + offset, &buf)?;

    // Lengths move only once the tail on disk agrees with them
    if end > state.valid_length {
        cipher.update_tail(
            io,
            crypto.header_size(),
            &crypto.file_key,
            crypto.nonce(),
            end,
        )?;
        state.valid_length = end;
    } else {
        trim_to(io, physical_size(crypto.header_size(), state.valid_length))?;
    }
    state.valid_data_length = state.valid_data_length.max(end);
    tracing::trace!(file = %io.file(), offset, len = data.len(), "write");
    Ok(data.len())
}

/// Set the logical end of file, moving the tail.
pub fn set_size(
    io: &AlignedIo<'_>,
    cipher: &CipherManager,
    state: &mut LinkState,
    new_len: u64,
) -> CfsResult<()> {
    let Some(crypto) = state.crypto.as_ref() else {
        io.set_size(new_len)?;
        state.valid_length = new_len;
        state.valid_data_length = new_len;
        return Ok(());
    };
    if new_len == state.valid_length {
        return Ok(());
    }
    cipher.update_tail(
        io,
        crypto.header_size(),
        &crypto.file_key,
        crypto.nonce(),
        new_len,
    )?;
    state.valid_data_length = state.valid_data_length.min(new_len);
    state.valid_length = new_len;
    Ok(())
}

/// Write encrypted zeros over `[valid_data_length, valid_length)`.
pub fn materialize(io: &AlignedIo<'_>, state: &mut LinkState) -> CfsResult<()> {
    let Some(crypto) = state.crypto.as_ref() else {
        return Ok(());
    };
    if state.valid_data_length < state.valid_length {
        zero_fill(io, crypto, state.valid_data_length, state.valid_length)?;
        trim_to(io, physical_size(crypto.header_size(), state.valid_length))?;
        state.valid_data_length = state.valid_length;
    }
    Ok(())
}

pub fn sizes(state: &LinkState, sector: u64) -> FileSizes {
    let end_of_file = state.valid_length;
    let allocation_size = match &state.crypto {
        Some(c) => {
            let physical = align_up(physical_size(c.header_size(), end_of_file), sector);
            physical
                .saturating_sub(c.header_size() + TAIL_BLOCK_SIZE as u64)
                .max(end_of_file)
        }
        None => align_up(end_of_file, sector),
    };
    FileSizes {
        end_of_file,
        allocation_size,
    }
}

/// Rewrite one enumeration record with the logical size of an encrypted file.
pub fn translate_entry(mut entry: DirEntry, logical_size: u64, header_size: u64, sector: u64) -> DirEntry {
    entry.size = logical_size;
    entry.allocation_size = align_up(entry.allocation_size.max(entry.size), sector)
        .saturating_sub(header_size + TAIL_BLOCK_SIZE as u64)
        .max(logical_size);
    entry
}

/// Logical size of an encrypted file whose tail could not be read.
pub fn estimate_logical(physical: u64, header_size: u64) -> u64 {
    physical.saturating_sub(header_size + TAIL_BLOCK_SIZE as u64)
}

fn zero_fill(io: &AlignedIo<'_>, crypto: &LinkCrypto, from: u64, to: u64) -> CfsResult<()> {
    let mut pos = from;
    while pos < to {
        let len = (to - pos).min(ZERO_CHUNK);
        let mut zeros = vec![0u8; len as usize];
        encode(&mut zeros, &crypto.file_key, crypto.nonce(), pos)?;
        io.write(crypto.header_size() + pos, &zeros)?;
        pos += len;
    }
    Ok(())
}

/// Undo any growth caused by sector rounding of the last write.
fn trim_to(io: &AlignedIo<'_>, size: u64) -> CfsResult<()> {
    if io.size()? > size {
        io.set_size(size)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Header, CIPHER_CHACHA20};
    use veil_core::config::EngineConfig;
    use veil_core::{FileId, FileKind, HeaderId, NormalizedPath};
    use veil_crypto::generate_file_key;
    use veil_storage::{MemoryStack, StorageStack};

    fn setup(sector: u32) -> (MemoryStack, FileId, CipherManager, LinkState) {
        let stack = MemoryStack::new().with_strict_alignment();
        stack.set_sector_size("c", sector);
        let info = stack
            .create(&NormalizedPath::file("c", &[], "f"), FileKind::File)
            .unwrap();
        let cm = CipherManager::new(&EngineConfig::default());
        let mut header = Header::new(CIPHER_CHACHA20, 512, 0, b"p".to_vec()).unwrap();
        header.nonce = 42;
        let state = LinkState::encrypted(
            LinkCrypto {
                header_id: Some(HeaderId(1)),
                header: header.clone(),
                file_key: generate_file_key(),
            },
            0,
            false,
        );
        {
            let io = AlignedIo::new(&stack, info.id, sector).unwrap();
            cm.write_header(&io, &header).unwrap();
            cm.update_tail(&io, 512, &state.crypto.as_ref().unwrap().file_key, 42, 0)
                .unwrap();
        }
        (stack, info.id, cm, state)
    }

    #[test]
    fn write_4096_then_read_back() {
        let (stack, id, cm, mut state) = setup(512);
        let io = AlignedIo::new(&stack, id, 512).unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();

        assert_eq!(write(&io, &cm, &mut state, 0, &data).unwrap(), 4096);
        assert_eq!(read(&io, &state, 0, 4096).unwrap(), data);
        assert_eq!(sizes(&state, 512).end_of_file, 4096);
        assert_eq!(stack.size(id).unwrap(), 512 + 4096 + 512);
        assert_ne!(stack.raw_contents(id).unwrap()[512..4608], data[..]);
    }

    #[test]
    fn unaligned_writes_and_reads() {
        let (stack, id, cm, mut state) = setup(512);
        let io = AlignedIo::new(&stack, id, 512).unwrap();
        write(&io, &cm, &mut state, 0, &[1u8; 1000]).unwrap();
        write(&io, &cm, &mut state, 777, b"hello").unwrap();

        let back = read(&io, &state, 770, 20).unwrap();
        assert_eq!(&back[..7], &[1u8; 7]);
        assert_eq!(&back[7..12], b"hello");
        assert_eq!(read(&io, &state, 995, 100).unwrap().len(), 5);
        assert!(read(&io, &state, 1000, 10).unwrap().is_empty());
        assert_eq!(cm.retrieve_tail(&io, 512, &state.crypto.as_ref().unwrap().file_key, 42, false)
            .unwrap()
            .valid_length, 1000);
    }

    #[test]
    fn write_past_end_zero_fills_gap() {
        let (stack, id, cm, mut state) = setup(512);
        let io = AlignedIo::new(&stack, id, 512).unwrap();
        write(&io, &cm, &mut state, 0, b"abc").unwrap();
        write(&io, &cm, &mut state, 3000, b"xyz").unwrap();

        let back = read(&io, &state, 0, 3003).unwrap();
        assert_eq!(&back[..3], b"abc");
        assert!(back[3..3000].iter().all(|&b| b == 0));
        assert_eq!(&back[3000..], b"xyz");
    }

    #[test]
    fn extend_reads_zeros_until_materialized() {
        let (stack, id, cm, mut state) = setup(4096);
        let io = AlignedIo::new(&stack, id, 4096).unwrap();
        write(&io, &cm, &mut state, 0, &[9u8; 100]).unwrap();
        set_size(&io, &cm, &mut state, 5000).unwrap();

        assert_eq!(state.valid_data_length, 100);
        let back = read(&io, &state, 90, 100).unwrap();
        assert_eq!(&back[..10], &[9u8; 10]);
        assert!(back[10..].iter().all(|&b| b == 0));

        materialize(&io, &mut state).unwrap();
        assert_eq!(state.valid_data_length, 5000);
        let back = read(&io, &state, 0, 5000).unwrap();
        assert!(back[100..].iter().all(|&b| b == 0));
        assert_eq!(stack.size(id).unwrap(), physical_size(512, 5000));
    }

    #[test]
    fn failed_tail_update_keeps_lengths() {
        let (stack, id, cm, mut state) = setup(512);
        let io = AlignedIo::new(&stack, id, 512).unwrap();
        write(&io, &cm, &mut state, 0, b"abc").unwrap();

        stack.fail_writes_after(1);
        assert!(write(&io, &cm, &mut state, 3, &[7u8; 100]).is_err());
        assert!(set_size(&io, &cm, &mut state, 10).is_err());
        stack.clear_write_failures();

        assert_eq!(state.valid_length, 3);
        assert_eq!(state.valid_data_length, 3);
        let tail = cm
            .retrieve_tail(&io, 512, &state.crypto.as_ref().unwrap().file_key, 42, false)
            .unwrap();
        assert_eq!(tail.valid_length, 3);
        assert_eq!(read(&io, &state, 0, 100).unwrap(), b"abc");
    }

    #[test]
    fn shrink_moves_tail() {
        let (stack, id, cm, mut state) = setup(512);
        let io = AlignedIo::new(&stack, id, 512).unwrap();
        write(&io, &cm, &mut state, 0, &[5u8; 3000]).unwrap();
        set_size(&io, &cm, &mut state, 10).unwrap();
        assert_eq!(read(&io, &state, 0, 100).unwrap(), vec![5u8; 10]);
        assert_eq!(stack.size(id).unwrap(), 1024 + 512);
    }

    #[test]
    fn plain_file_passthrough() {
        let stack = MemoryStack::new();
        let info = stack
            .create(&NormalizedPath::file("c", &[], "p"), FileKind::File)
            .unwrap();
        let io = AlignedIo::new(&stack, info.id, 512).unwrap();
        let cm = CipherManager::new(&EngineConfig::default());
        let mut state = LinkState::plain(0);
        write(&io, &cm, &mut state, 0, b"plain text").unwrap();
        assert_eq!(stack.raw_contents(info.id).unwrap(), b"plain text");
        assert_eq!(read(&io, &state, 6, 10).unwrap(), b"text");
        assert_eq!(sizes(&state, 512).allocation_size, 512);
    }

    #[test]
    fn entry_translation_hides_layout() {
        let entry = DirEntry {
            name: "f".into(),
            id: FileId(1),
            kind: FileKind::File,
            size: 512 + 4096 + 512,
            allocation_size: 512 + 4096 + 512,
        };
        let out = translate_entry(entry, 4096, 512, 512);
        assert_eq!(out.size, 4096);
        assert_eq!(out.allocation_size, 4096);
        assert_eq!(estimate_logical(512 + 4096 + 512, 512), 4096);
    }
}
