//! Sector-aligned raw I/O.
//!
//! Every request that reaches the storage stack goes through here and is
//! expanded to the enclosing sector-aligned region: reads fetch the region and
//! trim, writes read the partial head/tail sectors, patch them and write the
//! whole region back. No cryptography happens at this layer.

use veil_core::{CfsError, CfsResult, FileId};
use veil_storage::{align_down, align_up, StorageStack};

pub struct AlignedIo<'a> {
    storage: &'a dyn StorageStack,
    file: FileId,
    sector: u64,
}

impl<'a> AlignedIo<'a> {
    pub fn new(storage: &'a dyn StorageStack, file: FileId, sector: u32) -> CfsResult<Self> {
        if sector == 0 || !sector.is_power_of_two() {
            return Err(CfsError::Alignment(format!(
                "sector size {sector} is not a power of two"
            )));
        }
        Ok(AlignedIo {
            storage,
            file,
            sector: sector as u64,
        })
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn storage(&self) -> &'a dyn StorageStack {
        self.storage
    }

    pub fn size(&self) -> CfsResult<u64> {
        self.storage.size(self.file)
    }

    pub fn set_size(&self, size: u64) -> CfsResult<()> {
        self.storage.set_size(self.file, size)
    }

    /// Read up to `len` bytes at `offset`. Short only at end of file.
    pub fn read(&self, offset: u64, len: usize) -> CfsResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = checked_end(offset, len)?;
        let start = align_down(offset, self.sector);
        let region_end = align_up(end, self.sector);
        let mut region = vec![0u8; region_len(start, region_end)?];
        let got = self.read_region(start, &mut region)?;

        let skip = (offset - start) as usize;
        let available = got.saturating_sub(skip).min(len);
        region.truncate(skip + available);
        region.drain(..skip);
        Ok(region)
    }

    /// Write `data` at `offset` with read-modify-write of the partial sectors.
    ///
    /// The aligned region may extend past end of file; callers that need an
    /// exact size set it afterwards.
    pub fn write(&self, offset: u64, data: &[u8]) -> CfsResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = checked_end(offset, data.len())?;
        let start = align_down(offset, self.sector);
        let region_end = align_up(end, self.sector);
        let mut region = vec![0u8; region_len(start, region_end)?];
        let sector = self.sector as usize;

        if offset != start {
            self.read_region(start, &mut region[..sector])?;
        }
        let last = region.len() - sector;
        if end != region_end && (last != 0 || offset == start) {
            self.read_region(region_end - self.sector, &mut region[last..])?;
        }

        let skip = (offset - start) as usize;
        region[skip..skip + data.len()].copy_from_slice(data);
        self.write_region(start, &region)
    }

    fn read_region(&self, offset: u64, buf: &mut [u8]) -> CfsResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .storage
                .read_at(self.file, offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled as u64 % self.sector != 0 {
                // Short, unaligned read means end of file
                break;
            }
        }
        buf[filled..].fill(0);
        Ok(filled)
    }

    fn write_region(&self, offset: u64, buf: &[u8]) -> CfsResult<()> {
        let written = self.storage.write_at(self.file, offset, buf)?;
        if written != buf.len() {
            return Err(CfsError::Storage(format!(
                "short write on {}: {written} of {} bytes at {offset}",
                self.file,
                buf.len()
            )));
        }
        Ok(())
    }
}

fn checked_end(offset: u64, len: usize) -> CfsResult<u64> {
    offset
        .checked_add(len as u64)
        .ok_or_else(|| CfsError::Alignment(format!("range {offset}+{len} overflows")))
}

fn region_len(start: u64, end: u64) -> CfsResult<usize> {
    usize::try_from(end - start)
        .map_err(|_| CfsError::Alignment(format!("aligned region {start}..{end} too large")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::{FileKind, NormalizedPath};
    use veil_storage::MemoryStack;

    fn setup() -> (MemoryStack, FileId) {
        let stack = MemoryStack::new().with_strict_alignment();
        let info = stack
            .create(&NormalizedPath::file("c", &[], "f"), FileKind::File)
            .unwrap();
        (stack, info.id)
    }

    #[test]
    fn unaligned_write_preserves_neighbours() {
        let (stack, id) = setup();
        let io = AlignedIo::new(&stack, id, 512).unwrap();
        io.write(0, &[1u8; 1024]).unwrap();
        io.write(500, &[9u8; 30]).unwrap();

        let raw = stack.raw_contents(id).unwrap();
        assert_eq!(raw.len(), 1024);
        assert!(raw[..500].iter().all(|&b| b == 1));
        assert!(raw[500..530].iter().all(|&b| b == 9));
        assert!(raw[530..].iter().all(|&b| b == 1));
    }

    #[test]
    fn unaligned_read_trims() {
        let (stack, id) = setup();
        let io = AlignedIo::new(&stack, id, 512).unwrap();
        let data: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        io.write(0, &data).unwrap();

        assert_eq!(io.read(100, 50).unwrap(), data[100..150].to_vec());
        assert_eq!(io.read(1000, 100).unwrap(), data[1000..].to_vec());
        assert!(io.read(2048, 10).unwrap().is_empty());
    }

    #[test]
    fn small_write_inside_one_sector() {
        let (stack, id) = setup();
        let io = AlignedIo::new(&stack, id, 512).unwrap();
        io.write(0, &[5u8; 512]).unwrap();
        io.write(10, b"abc").unwrap();
        let back = io.read(0, 512).unwrap();
        assert_eq!(&back[10..13], b"abc");
        assert_eq!(back[9], 5);
        assert_eq!(back[13], 5);
    }

    #[test]
    fn rejects_bad_sector() {
        let (stack, id) = setup();
        assert!(AlignedIo::new(&stack, id, 1000).is_err());
    }
}
