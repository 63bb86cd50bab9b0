//! AutoConfig files: directory-inherited policy headers.
//!
//! A directory carries its policy in a hidden file whose whole content is one
//! header block with the `CIPHER_AUTOCONFIG` sentinel. Its deepness is the
//! remaining recursion budget below that directory.

use veil_core::{CfsError, CfsResult, FileKind, NormalizedPath};
use veil_storage::StorageStack;

use crate::aligned::AlignedIo;
use crate::cipher::{CipherManager, HeaderProbe};
use crate::header::Header;

pub fn autoconfig_path(dir: &NormalizedPath, name: &str) -> NormalizedPath {
    dir.as_directory().join_file(name)
}

/// Directories scanned for an AutoConfig file on behalf of `path`, nearest
/// first: the directory itself (or a file's parent) and up to `depth`
/// ancestors above it.
pub fn discovery_candidates(path: &NormalizedPath, depth: u32) -> Vec<NormalizedPath> {
    let mut dirs = Vec::new();
    let mut current = if path.is_directory() {
        Some(path.clone())
    } else {
        path.parent()
    };
    while let Some(dir) = current {
        if dirs.len() > depth as usize {
            break;
        }
        current = dir.parent();
        dirs.push(dir);
    }
    dirs
}

/// AutoConfig header stored in `dir`, if there is a valid one.
pub fn read_autoconfig(
    storage: &dyn StorageStack,
    cipher: &CipherManager,
    dir: &NormalizedPath,
    name: &str,
) -> CfsResult<Option<Header>> {
    let path = autoconfig_path(dir, name);
    let Some(info) = storage.lookup(&path)? else {
        return Ok(None);
    };
    if info.kind != FileKind::File {
        return Ok(None);
    }
    let io = AlignedIo::new(storage, info.id, storage.sector_size(&dir.volume)?)?;
    match cipher.read_header(&io)? {
        HeaderProbe::Present(header) if header.is_autoconfig() => Ok(Some(header)),
        HeaderProbe::Present(header) => {
            tracing::warn!(path = %path, cipher = header.cipher_id, "AutoConfig file has a data cipher id, ignored");
            Ok(None)
        }
        HeaderProbe::Plain(e) => {
            tracing::warn!(path = %path, error = %e, "invalid AutoConfig file ignored");
            Ok(None)
        }
        HeaderProbe::Empty | HeaderProbe::TooSmall { .. } => Ok(None),
    }
}

/// Write (or overwrite) the AutoConfig file of `dir` from a policy template.
pub fn write_autoconfig(
    storage: &dyn StorageStack,
    cipher: &CipherManager,
    dir: &NormalizedPath,
    name: &str,
    template: &Header,
    deepness: u32,
) -> CfsResult<Header> {
    let header = Header::autoconfig(template.payload.clone(), deepness)?
        .with_block_size(template.block_size)?;
    let path = autoconfig_path(dir, name);
    let id = match storage.lookup(&path)? {
        Some(info) if info.kind == FileKind::File => info.id,
        Some(_) => {
            return Err(CfsError::InvalidRequest(format!(
                "{path} exists and is not a file"
            )))
        }
        None => storage.create(&path, FileKind::File)?.id,
    };
    let io = AlignedIo::new(storage, id, storage.sector_size(&dir.volume)?)?;
    cipher.write_header(&io, &header)?;
    io.set_size(header.block_size as u64)?;
    tracing::info!(dir = %dir, deepness, "AutoConfig written");
    Ok(header)
}

/// Delete the AutoConfig file of `dir`. Returns whether one existed.
pub fn remove_autoconfig(
    storage: &dyn StorageStack,
    dir: &NormalizedPath,
    name: &str,
) -> CfsResult<bool> {
    let path = autoconfig_path(dir, name);
    if storage.lookup(&path)?.is_none() {
        return Ok(false);
    }
    storage.remove(&path)?;
    Ok(true)
}
