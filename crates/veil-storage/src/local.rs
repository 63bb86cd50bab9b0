//! Local-directory storage stack.
//!
//! Layout: `{root}/{volume}/{dir...}/{file}`. File ids are handed out on first
//! sight and kept stable across renames made through this stack.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use veil_core::{CfsError, CfsResult, FileId, FileKind, NormalizedPath};

use crate::{DirEntry, FileInfo, StorageStack};

#[derive(Default)]
struct IdMap {
    by_path: HashMap<PathBuf, FileId>,
    by_id: HashMap<FileId, (PathBuf, NormalizedPath)>,
}

pub struct LocalStack {
    root: PathBuf,
    sector_size: u32,
    ids: RwLock<IdMap>,
    next_id: AtomicU64,
}

impl LocalStack {
    /// Serve volumes from subdirectories of `root`.
    pub fn new(root: impl Into<PathBuf>, sector_size: u32) -> Self {
        LocalStack {
            root: root.into(),
            sector_size,
            ids: RwLock::new(IdMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path backing a normalized path.
    pub fn host_path(&self, path: &NormalizedPath) -> PathBuf {
        let mut out = self.root.join(&path.volume);
        for component in &path.directory {
            out.push(component);
        }
        if let Some(file) = &path.file {
            out.push(file);
        }
        out
    }

    fn id_for(&self, host: &Path, path: &NormalizedPath) -> FileId {
        let mut ids = self.ids.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = ids.by_path.get(host) {
            return *id;
        }
        let id = FileId(self.next_id.fetch_add(1, Ordering::SeqCst));
        ids.by_path.insert(host.to_path_buf(), id);
        ids.by_id.insert(id, (host.to_path_buf(), path.clone()));
        id
    }

    fn host_of(&self, id: FileId) -> CfsResult<PathBuf> {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&id)
            .map(|(host, _)| host.clone())
            .ok_or_else(|| CfsError::NotFound(id.to_string()))
    }

    fn forget(&self, host: &Path) {
        let mut ids = self.ids.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = ids.by_path.remove(host) {
            ids.by_id.remove(&id);
        }
    }
}

fn kind_of(meta: &fs::Metadata) -> FileKind {
    if meta.is_dir() {
        FileKind::Directory
    } else {
        FileKind::File
    }
}

impl StorageStack for LocalStack {
    fn sector_size(&self, _volume: &str) -> CfsResult<u32> {
        Ok(self.sector_size)
    }

    fn lookup(&self, path: &NormalizedPath) -> CfsResult<Option<FileInfo>> {
        let host = self.host_path(path);
        match fs::metadata(&host) {
            Ok(meta) => Ok(Some(FileInfo {
                id: self.id_for(&host, path),
                kind: kind_of(&meta),
                size: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn path_of(&self, id: FileId) -> CfsResult<NormalizedPath> {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&id)
            .map(|(_, path)| path.clone())
            .ok_or_else(|| CfsError::NotFound(id.to_string()))
    }

    fn create(&self, path: &NormalizedPath, kind: FileKind) -> CfsResult<FileInfo> {
        let host = self.host_path(path);
        match kind {
            FileKind::Directory => fs::create_dir(&host)?,
            FileKind::File => {
                OpenOptions::new().write(true).create_new(true).open(&host)?;
            }
        }
        tracing::trace!(path = %host.display(), ?kind, "created");
        Ok(FileInfo {
            id: self.id_for(&host, path),
            kind,
            size: 0,
        })
    }

    fn remove(&self, path: &NormalizedPath) -> CfsResult<()> {
        let host = self.host_path(path);
        if fs::metadata(&host)?.is_dir() {
            fs::remove_dir(&host)?;
        } else {
            fs::remove_file(&host)?;
        }
        self.forget(&host);
        Ok(())
    }

    fn rename(&self, from: &NormalizedPath, to: &NormalizedPath) -> CfsResult<()> {
        let from_host = self.host_path(from);
        let to_host = self.host_path(to);
        if to_host.exists() {
            return Err(CfsError::InvalidRequest(format!("{to} already exists")));
        }
        fs::rename(&from_host, &to_host)?;
        let mut ids = self.ids.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = ids.by_path.remove(&from_host) {
            ids.by_path.insert(to_host.clone(), id);
            ids.by_id.insert(id, (to_host, to.clone()));
        }
        Ok(())
    }

    fn list(&self, dir: &NormalizedPath) -> CfsResult<Vec<DirEntry>> {
        let host = self.host_path(dir);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&host)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let kind = kind_of(&meta);
            let child = match kind {
                FileKind::Directory => dir.join_dir(&name),
                FileKind::File => dir.join_file(&name),
            };
            entries.push(DirEntry {
                id: self.id_for(&entry.path(), &child),
                name,
                kind,
                size: meta.len(),
                allocation_size: crate::align_up(meta.len(), self.sector_size as u64),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read_at(&self, file: FileId, offset: u64, buf: &mut [u8]) -> CfsResult<usize> {
        let mut f = fs::File::open(self.host_of(file)?)?;
        f.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = f.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn write_at(&self, file: FileId, offset: u64, data: &[u8]) -> CfsResult<usize> {
        let mut f = OpenOptions::new().write(true).open(self.host_of(file)?)?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)?;
        Ok(data.len())
    }

    fn size(&self, file: FileId) -> CfsResult<u64> {
        Ok(fs::metadata(self.host_of(file)?)?.len())
    }

    fn set_size(&self, file: FileId, size: u64) -> CfsResult<()> {
        let f = OpenOptions::new().write(true).open(self.host_of(file)?)?;
        f.set_len(size)?;
        Ok(())
    }

    fn query_long_name(&self, _dir: &NormalizedPath, _short: &str) -> CfsResult<Option<String>> {
        // Host directories have no 8.3 aliases
        Ok(None)
    }
}
