//! In-memory storage stack.
//!
//! Keeps the whole tree in a map guarded by one lock. Besides plain storage it
//! can emulate the quirks the engine has to cope with on a real stack:
//!   - strict sector alignment for every read and write (`with_strict_alignment`)
//!   - 8.3 short-name aliases resolved by `query_long_name`
//!   - write failures after N successful writes (`fail_writes_after`)
//!   - directories that refuse removal (`fail_directory_removals`)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use veil_core::{CfsError, CfsResult, FileId, FileKind, NormalizedPath};

use crate::{DirEntry, FileInfo, StorageStack};

const DEFAULT_SECTOR_SIZE: u32 = 512;

struct Node {
    path: NormalizedPath,
    kind: FileKind,
    data: Vec<u8>,
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<FileId, Node>,
    index: HashMap<String, FileId>,
    short_names: HashMap<String, String>,
}

pub struct MemoryStack {
    tree: RwLock<Tree>,
    sector_sizes: RwLock<HashMap<String, u32>>,
    strict_alignment: bool,
    next_id: AtomicU64,
    writes: AtomicU64,
    /// Writes allowed before every further write fails (u64::MAX = never)
    fail_after: AtomicU64,
    fail_dir_removal: AtomicBool,
}

impl Default for MemoryStack {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStack {
    pub fn new() -> Self {
        MemoryStack {
            tree: RwLock::new(Tree::default()),
            sector_sizes: RwLock::new(HashMap::new()),
            strict_alignment: false,
            next_id: AtomicU64::new(1),
            writes: AtomicU64::new(0),
            fail_after: AtomicU64::new(u64::MAX),
            fail_dir_removal: AtomicBool::new(false),
        }
    }

    /// Reject any read or write whose offset or length is not sector aligned.
    pub fn with_strict_alignment(mut self) -> Self {
        self.strict_alignment = true;
        self
    }

    pub fn set_sector_size(&self, volume: &str, sector_size: u32) {
        self.sector_sizes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(volume.to_ascii_lowercase(), sector_size);
    }

    /// Register `short` as an alias of `long` inside `dir`.
    pub fn add_short_name(&self, dir: &NormalizedPath, short: &str, long: &str) {
        self.write_tree()
            .short_names
            .insert(short_key(dir, short), long.to_string());
    }

    /// Let `n` more writes succeed, then fail every write.
    pub fn fail_writes_after(&self, n: u64) {
        self.fail_after
            .store(self.writes.load(Ordering::SeqCst) + n, Ordering::SeqCst);
    }

    pub fn clear_write_failures(&self) {
        self.fail_after.store(u64::MAX, Ordering::SeqCst);
    }

    pub fn fail_directory_removals(&self, fail: bool) {
        self.fail_dir_removal.store(fail, Ordering::SeqCst);
    }

    /// Total successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Raw on-disk bytes of a file, bypassing every check.
    pub fn raw_contents(&self, file: FileId) -> Option<Vec<u8>> {
        self.read_tree().nodes.get(&file).map(|n| n.data.clone())
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, Tree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tree(&self) -> RwLockWriteGuard<'_, Tree> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn sector_of(&self, volume: &str) -> u32 {
        self.sector_sizes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&volume.to_ascii_lowercase())
            .copied()
            .unwrap_or(DEFAULT_SECTOR_SIZE)
    }

    fn check_alignment(&self, volume: &str, offset: u64, len: usize) -> CfsResult<()> {
        if !self.strict_alignment {
            return Ok(());
        }
        let sector = self.sector_of(volume) as u64;
        if offset % sector != 0 || len as u64 % sector != 0 {
            return Err(CfsError::Alignment(format!(
                "offset {offset} length {len} not aligned to sector {sector}"
            )));
        }
        Ok(())
    }
}

fn path_key(path: &NormalizedPath) -> String {
    path.to_string().to_ascii_lowercase()
}

fn short_key(dir: &NormalizedPath, short: &str) -> String {
    format!("{}|{}", path_key(dir), short.to_ascii_lowercase())
}

fn is_volume_root(path: &NormalizedPath) -> bool {
    path.is_directory() && path.directory.is_empty()
}

impl Tree {
    fn node(&self, file: FileId) -> CfsResult<&Node> {
        self.nodes
            .get(&file)
            .ok_or_else(|| CfsError::NotFound(file.to_string()))
    }

    fn node_mut(&mut self, file: FileId) -> CfsResult<&mut Node> {
        self.nodes
            .get_mut(&file)
            .ok_or_else(|| CfsError::NotFound(file.to_string()))
    }

    fn dir_exists(&self, dir: &NormalizedPath) -> bool {
        if is_volume_root(dir) {
            return true;
        }
        self.index
            .get(&path_key(dir))
            .and_then(|id| self.nodes.get(id))
            .is_some_and(|n| n.kind == FileKind::Directory)
    }

    fn children(&self, dir: &NormalizedPath) -> Vec<(FileId, &Node)> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.path.parent().is_some_and(|p| p == *dir))
            .map(|(id, n)| (*id, n))
            .collect()
    }
}

impl StorageStack for MemoryStack {
    fn sector_size(&self, volume: &str) -> CfsResult<u32> {
        Ok(self.sector_of(volume))
    }

    fn lookup(&self, path: &NormalizedPath) -> CfsResult<Option<FileInfo>> {
        let tree = self.read_tree();
        Ok(tree.index.get(&path_key(path)).and_then(|id| {
            tree.nodes.get(id).map(|n| FileInfo {
                id: *id,
                kind: n.kind,
                size: n.data.len() as u64,
            })
        }))
    }

    fn path_of(&self, id: FileId) -> CfsResult<NormalizedPath> {
        Ok(self.read_tree().node(id)?.path.clone())
    }

    fn create(&self, path: &NormalizedPath, kind: FileKind) -> CfsResult<FileInfo> {
        if is_volume_root(path) {
            return Err(CfsError::InvalidRequest("cannot create a volume root".into()));
        }
        let mut tree = self.write_tree();
        let key = path_key(path);
        if tree.index.contains_key(&key) {
            return Err(CfsError::InvalidRequest(format!("{path} already exists")));
        }
        let parent = path
            .parent()
            .ok_or_else(|| CfsError::InvalidRequest(format!("{path} has no parent")))?;
        if !tree.dir_exists(&parent) {
            return Err(CfsError::NotFound(parent.to_string()));
        }
        let id = FileId(self.next_id.fetch_add(1, Ordering::SeqCst));
        tree.nodes.insert(
            id,
            Node {
                path: path.clone(),
                kind,
                data: Vec::new(),
            },
        );
        tree.index.insert(key, id);
        Ok(FileInfo { id, kind, size: 0 })
    }

    fn remove(&self, path: &NormalizedPath) -> CfsResult<()> {
        let mut tree = self.write_tree();
        let key = path_key(path);
        let id = *tree
            .index
            .get(&key)
            .ok_or_else(|| CfsError::NotFound(path.to_string()))?;
        if tree.node(id)?.kind == FileKind::Directory {
            if !tree.children(path).is_empty() {
                return Err(CfsError::InvalidRequest(format!("{path} is not empty")));
            }
            if self.fail_dir_removal.load(Ordering::SeqCst) {
                return Err(CfsError::Storage(format!("injected removal failure on {path}")));
            }
        }
        tree.index.remove(&key);
        tree.nodes.remove(&id);
        Ok(())
    }

    fn rename(&self, from: &NormalizedPath, to: &NormalizedPath) -> CfsResult<()> {
        let mut tree = self.write_tree();
        let from_key = path_key(from);
        let to_key = path_key(to);
        let id = *tree
            .index
            .get(&from_key)
            .ok_or_else(|| CfsError::NotFound(from.to_string()))?;
        if tree.index.contains_key(&to_key) {
            return Err(CfsError::InvalidRequest(format!("{to} already exists")));
        }
        let to_parent = to
            .parent()
            .ok_or_else(|| CfsError::InvalidRequest(format!("{to} has no parent")))?;
        if !tree.dir_exists(&to_parent) {
            return Err(CfsError::NotFound(to_parent.to_string()));
        }

        let kind = tree.node(id)?.kind;
        tree.index.remove(&from_key);
        tree.node_mut(id)?.path = to.clone();
        tree.index.insert(to_key, id);

        if kind == FileKind::Directory {
            // Re-home every descendant under the new directory path
            let from_dir = from.as_directory();
            let to_dir = to.as_directory();
            let moved: Vec<FileId> = tree
                .nodes
                .iter()
                .filter(|(nid, n)| **nid != id && from_dir.contains(&n.path))
                .map(|(nid, _)| *nid)
                .collect();
            for nid in moved {
                let old_path = tree.node(nid)?.path.clone();
                let mut new_path = old_path.clone();
                new_path.volume = to_dir.volume.clone();
                new_path.directory = to_dir
                    .directory
                    .iter()
                    .chain(old_path.directory[from_dir.depth()..].iter())
                    .cloned()
                    .collect();
                tree.index.remove(&path_key(&old_path));
                tree.index.insert(path_key(&new_path), nid);
                tree.node_mut(nid)?.path = new_path;
            }
        }
        Ok(())
    }

    fn list(&self, dir: &NormalizedPath) -> CfsResult<Vec<DirEntry>> {
        let tree = self.read_tree();
        if !tree.dir_exists(dir) {
            return Err(CfsError::NotFound(dir.to_string()));
        }
        let sector = self.sector_of(&dir.volume) as u64;
        let mut entries: Vec<DirEntry> = tree
            .children(dir)
            .into_iter()
            .map(|(id, n)| DirEntry {
                name: n.path.name().unwrap_or_default().to_string(),
                id,
                kind: n.kind,
                size: n.data.len() as u64,
                allocation_size: crate::align_up(n.data.len() as u64, sector),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read_at(&self, file: FileId, offset: u64, buf: &mut [u8]) -> CfsResult<usize> {
        let tree = self.read_tree();
        let node = tree.node(file)?;
        self.check_alignment(&node.path.volume, offset, buf.len())?;
        let len = node.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(node.data.len() - start);
        buf[..n].copy_from_slice(&node.data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, file: FileId, offset: u64, data: &[u8]) -> CfsResult<usize> {
        let mut tree = self.write_tree();
        let volume = tree.node(file)?.path.volume.clone();
        self.check_alignment(&volume, offset, data.len())?;
        if self.writes.load(Ordering::SeqCst) >= self.fail_after.load(Ordering::SeqCst) {
            return Err(CfsError::Storage(format!(
                "injected write failure on {file} at offset {offset}"
            )));
        }
        let node = tree.node_mut(file)?;
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(data.len())
    }

    fn size(&self, file: FileId) -> CfsResult<u64> {
        Ok(self.read_tree().node(file)?.data.len() as u64)
    }

    fn set_size(&self, file: FileId, size: u64) -> CfsResult<()> {
        let mut tree = self.write_tree();
        tree.node_mut(file)?.data.resize(size as usize, 0);
        Ok(())
    }

    fn query_long_name(&self, dir: &NormalizedPath, short: &str) -> CfsResult<Option<String>> {
        Ok(self.read_tree().short_names.get(&short_key(dir, short)).cloned())
    }
}
