//! Request name normalization.
//!
//! Turns the name a request arrived with into a [`NormalizedPath`]:
//!
//! ```text
//! Absolute   "/c/Data/./x/../REPORT~1.DOC"   local stack   -> c:/Data/report-2024.doc
//! Absolute   "\\srv\share\docs\a.txt"       network stack -> srv/share:/docs/a.txt
//! Relative   parent handle path + "sub\b.txt"
//! ById       FileId -> whatever path the storage stack reports
//! ```

use veil_core::{CfsError, CfsResult, FileId, FileKind, NormalizedPath, StackKind};
use veil_storage::StorageStack;

/// A name as it arrives with a request.
#[derive(Debug, Clone, Copy)]
pub enum RawName<'a> {
    /// Full path starting with the volume name.
    Absolute(&'a str),
    /// Name relative to an already open directory.
    Relative {
        parent: &'a NormalizedPath,
        name: &'a str,
    },
    /// File opened by id; the name is whatever the stack reports now.
    ById(FileId),
}

/// Normalize `raw` for a request on a `stack` flavored storage stack.
///
/// `kind` says whether the last component names a file or a directory.
pub fn normalize(
    storage: &dyn StorageStack,
    raw: RawName<'_>,
    stack: StackKind,
    kind: FileKind,
) -> CfsResult<NormalizedPath> {
    match raw {
        RawName::ById(id) => storage.path_of(id),
        RawName::Absolute(name) => {
            let mut parts = components(name);
            let volume = take_volume(&mut parts, stack)
                .ok_or_else(|| CfsError::InvalidRequest(format!("no volume in {name:?}")))?;
            build(storage, NormalizedPath::directory(volume, &[]), parts, kind)
        }
        RawName::Relative { parent, name } => {
            build(storage, parent.as_directory(), components(name), kind)
        }
    }
}

fn components(name: &str) -> Vec<&str> {
    name.split(['/', '\\']).filter(|c| !c.is_empty()).collect()
}

fn take_volume(parts: &mut Vec<&str>, stack: StackKind) -> Option<String> {
    let width = match stack {
        StackKind::Local => 1,
        StackKind::Network => 2,
    };
    if parts.len() < width {
        return None;
    }
    let volume: Vec<&str> = parts.drain(..width).collect();
    let volume = volume.join("/");
    Some(volume.trim_end_matches(':').to_string())
}

fn build(
    storage: &dyn StorageStack,
    base: NormalizedPath,
    parts: Vec<&str>,
    kind: FileKind,
) -> CfsResult<NormalizedPath> {
    let mut dir = base;
    for part in parts {
        match part {
            "." => {}
            ".." => {
                if dir.directory.pop().is_none() {
                    return Err(CfsError::InvalidRequest(format!(
                        "path escapes the root of volume {}",
                        dir.volume
                    )));
                }
            }
            _ => {
                let long = expand_short(storage, &dir, part)?;
                dir.directory.push(long);
            }
        }
    }

    if kind == FileKind::File {
        let name = dir
            .directory
            .pop()
            .ok_or_else(|| CfsError::InvalidRequest("file name is empty".into()))?;
        dir.file = Some(name);
    }
    Ok(dir)
}

/// True for an 8.3 alias such as `PROGRA~1` or `REPORT~12.DOC`.
fn looks_short(component: &str) -> bool {
    let stem = component.split('.').next().unwrap_or(component);
    match stem.rsplit_once('~') {
        Some((head, digits)) => {
            !head.is_empty()
                && stem.len() <= 8
                && !digits.is_empty()
                && digits.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

fn expand_short(
    storage: &dyn StorageStack,
    dir: &NormalizedPath,
    component: &str,
) -> CfsResult<String> {
    if !looks_short(component) {
        return Ok(component.to_string());
    }
    Ok(match storage.query_long_name(dir, component)? {
        Some(long) => {
            tracing::trace!(short = component, long = %long, "expanded short name");
            long
        }
        None => component.to_string(),
    })
}
