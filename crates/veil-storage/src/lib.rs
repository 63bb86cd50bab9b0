//! veil-storage: the storage stack underneath the encryption layer
//!
//! The engine only ever talks to a [`StorageStack`]: a synchronous,
//! byte-addressed file store with a per-volume sector size. Two backends ship
//! with the crate:
//!   - [`MemoryStack`]: in-process tree with optional strict sector alignment,
//!     8.3 short-name aliases and write fault injection (tests)
//!   - [`LocalStack`]: a host directory, one subdirectory per volume (CLI)

pub mod health;
pub mod local;
pub mod memory;

pub use health::check_health;
pub use local::LocalStack;
pub use memory::MemoryStack;

use veil_core::{CfsResult, FileId, FileKind, NormalizedPath};

/// What a lookup or create returns about a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub id: FileId,
    pub kind: FileKind,
    pub size: u64,
}

/// One directory enumeration record, sizes as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub id: FileId,
    pub kind: FileKind,
    pub size: u64,
    pub allocation_size: u64,
}

/// Synchronous storage stack consumed by the engine.
///
/// `read_at` returns fewer bytes than requested only at end of file.
/// `write_at` past end of file extends the file.
pub trait StorageStack: Send + Sync {
    /// Sector size of the volume; non-cached I/O must be aligned to it.
    fn sector_size(&self, volume: &str) -> CfsResult<u32>;

    fn lookup(&self, path: &NormalizedPath) -> CfsResult<Option<FileInfo>>;

    /// Current path of a file opened by id.
    fn path_of(&self, id: FileId) -> CfsResult<NormalizedPath>;

    fn create(&self, path: &NormalizedPath, kind: FileKind) -> CfsResult<FileInfo>;

    fn remove(&self, path: &NormalizedPath) -> CfsResult<()>;

    fn rename(&self, from: &NormalizedPath, to: &NormalizedPath) -> CfsResult<()>;

    fn list(&self, dir: &NormalizedPath) -> CfsResult<Vec<DirEntry>>;

    fn read_at(&self, file: FileId, offset: u64, buf: &mut [u8]) -> CfsResult<usize>;

    fn write_at(&self, file: FileId, offset: u64, data: &[u8]) -> CfsResult<usize>;

    fn size(&self, file: FileId) -> CfsResult<u64>;

    fn set_size(&self, file: FileId, size: u64) -> CfsResult<()>;

    /// Expand a short (8.3) component inside `dir` to its long form.
    fn query_long_name(&self, dir: &NormalizedPath, short: &str) -> CfsResult<Option<String>>;
}

/// Round `value` down to a multiple of `align`.
pub fn align_down(value: u64, align: u64) -> u64 {
    value - value % align
}

/// Round `value` up to a multiple of `align`.
pub fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}
