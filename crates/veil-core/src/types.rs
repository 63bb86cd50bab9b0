use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an underlying file as reported by the storage stack.
///
/// Two handles opened on the same file share one `FileId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// One open handle, as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u64);

/// Logon session that owns a policy binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

/// Key into the header table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeaderId(pub u64);

impl fmt::Display for HeaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hdr#{}", self.0)
    }
}

/// Entity identifier: volume index in the high 16 bits, per-volume sequence
/// in the low 48 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    const SEQUENCE_BITS: u32 = 48;
    const SEQUENCE_MASK: u64 = (1 << Self::SEQUENCE_BITS) - 1;

    /// Sentinel carried by links whose entity was removed while open.
    pub const DOOMED: EntityId = EntityId(u64::MAX);

    pub fn new(volume_index: u16, sequence: u64) -> Self {
        EntityId(((volume_index as u64) << Self::SEQUENCE_BITS) | (sequence & Self::SEQUENCE_MASK))
    }

    pub fn from_raw(raw: u64) -> Self {
        EntityId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn volume_index(self) -> u16 {
        (self.0 >> Self::SEQUENCE_BITS) as u16
    }

    pub fn sequence(self) -> u64 {
        self.0 & Self::SEQUENCE_MASK
    }

    pub fn is_doomed(self) -> bool {
        self == Self::DOOMED
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_doomed() {
            f.write_str("doomed")
        } else {
            write!(f, "{}-{}", self.volume_index(), self.sequence())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
}

/// Flavor of storage stack a request arrived on. Network stacks name their
/// volume with two components (`server/share`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StackKind {
    #[default]
    Local,
    Network,
}

/// A path split into volume, directory components and an optional file name.
///
/// A directory is represented with every component in `directory` and
/// `file == None`. Comparisons are ASCII case-insensitive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedPath {
    pub volume: String,
    pub directory: Vec<String>,
    pub file: Option<String>,
}

impl NormalizedPath {
    pub fn directory(volume: impl Into<String>, components: &[&str]) -> Self {
        NormalizedPath {
            volume: volume.into(),
            directory: components.iter().map(|c| c.to_string()).collect(),
            file: None,
        }
    }

    pub fn file(volume: impl Into<String>, components: &[&str], name: &str) -> Self {
        NormalizedPath {
            volume: volume.into(),
            directory: components.iter().map(|c| c.to_string()).collect(),
            file: Some(name.to_string()),
        }
    }

    /// Number of directory components.
    pub fn depth(&self) -> usize {
        self.directory.len()
    }

    pub fn is_directory(&self) -> bool {
        self.file.is_none()
    }

    /// Last component, whether file or directory.
    pub fn name(&self) -> Option<&str> {
        self.file
            .as_deref()
            .or_else(|| self.directory.last().map(String::as_str))
    }

    /// Directory containing this path (the volume root has no parent).
    pub fn parent(&self) -> Option<NormalizedPath> {
        match &self.file {
            Some(_) => Some(NormalizedPath {
                volume: self.volume.clone(),
                directory: self.directory.clone(),
                file: None,
            }),
            None if self.directory.is_empty() => None,
            None => Some(NormalizedPath {
                volume: self.volume.clone(),
                directory: self.directory[..self.directory.len() - 1].to_vec(),
                file: None,
            }),
        }
    }

    /// Child file of a directory path.
    pub fn join_file(&self, name: &str) -> NormalizedPath {
        let mut dir = self.as_directory();
        dir.file = Some(name.to_string());
        dir
    }

    /// Child directory of a directory path.
    pub fn join_dir(&self, name: &str) -> NormalizedPath {
        let mut dir = self.as_directory();
        dir.directory.push(name.to_string());
        dir
    }

    /// Reinterpret this path as a directory (a file name becomes a component).
    pub fn as_directory(&self) -> NormalizedPath {
        let mut directory = self.directory.clone();
        if let Some(file) = &self.file {
            directory.push(file.clone());
        }
        NormalizedPath {
            volume: self.volume.clone(),
            directory,
            file: None,
        }
    }

    /// Path with the last component replaced.
    pub fn with_name(&self, name: &str) -> NormalizedPath {
        let mut out = self.clone();
        match &mut out.file {
            Some(file) => *file = name.to_string(),
            None => {
                if let Some(last) = out.directory.last_mut() {
                    *last = name.to_string();
                }
            }
        }
        out
    }

    pub fn same_volume(&self, other: &NormalizedPath) -> bool {
        self.volume.eq_ignore_ascii_case(&other.volume)
    }

    /// Full equality, ignoring ASCII case.
    pub fn same_as(&self, other: &NormalizedPath) -> bool {
        self.same_volume(other)
            && components_eq(&self.directory, &other.directory)
            && match (&self.file, &other.file) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                (None, None) => true,
                _ => false,
            }
    }

    /// Levels below this directory at which `target` lives.
    ///
    /// A file directly inside `self`, or a direct subdirectory, is at depth 0;
    /// `self` itself is also at depth 0. Returns `None` when `target` is not
    /// inside `self`.
    pub fn depth_below(&self, target: &NormalizedPath) -> Option<u32> {
        if !self.same_volume(target) {
            return None;
        }
        let container: &[String] = match &target.file {
            Some(_) => &target.directory,
            None if components_eq(&self.directory, &target.directory) => return Some(0),
            None if target.directory.is_empty() => return None,
            None => &target.directory[..target.directory.len() - 1],
        };
        if container.len() < self.directory.len() {
            return None;
        }
        if !components_eq(&self.directory, &container[..self.directory.len()]) {
            return None;
        }
        Some((container.len() - self.directory.len()) as u32)
    }

    /// True when `self` (a directory) is `other` or one of its ancestors.
    pub fn contains(&self, other: &NormalizedPath) -> bool {
        self.depth_below(other).is_some()
    }
}

impl PartialEq for NormalizedPath {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for NormalizedPath {}

impl fmt::Display for NormalizedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.volume)?;
        for component in &self.directory {
            write!(f, "/{component}")?;
        }
        match &self.file {
            Some(name) => write!(f, "/{name}"),
            None if self.directory.is_empty() => f.write_str("/"),
            None => Ok(()),
        }
    }
}

fn components_eq(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_packs_volume_and_sequence() {
        let id = EntityId::new(3, 42);
        assert_eq!(id.volume_index(), 3);
        assert_eq!(id.sequence(), 42);
        assert!(!id.is_doomed());
        assert!(EntityId::DOOMED.is_doomed());
        assert_eq!(id.to_string(), "3-42");
    }

    #[test]
    fn depth_below_counts_levels() {
        let root = NormalizedPath::directory("c", &["data"]);
        let direct = NormalizedPath::file("c", &["data"], "a.txt");
        let nested = NormalizedPath::file("c", &["data", "x", "y"], "b.txt");
        let subdir = NormalizedPath::directory("c", &["DATA", "x"]);
        let outside = NormalizedPath::file("c", &["other"], "a.txt");

        assert_eq!(root.depth_below(&direct), Some(0));
        assert_eq!(root.depth_below(&nested), Some(2));
        assert_eq!(root.depth_below(&subdir), Some(0));
        assert_eq!(root.depth_below(&root), Some(0));
        assert_eq!(root.depth_below(&outside), None);
    }

    #[test]
    fn case_insensitive_equality() {
        let a = NormalizedPath::file("C", &["Data"], "File.TXT");
        let b = NormalizedPath::file("c", &["data"], "file.txt");
        assert_eq!(a, b);
        assert_ne!(a, NormalizedPath::directory("c", &["data", "file.txt"]));
    }

    #[test]
    fn parent_and_join() {
        let dir = NormalizedPath::directory("v", &["a", "b"]);
        assert_eq!(dir.parent(), Some(NormalizedPath::directory("v", &["a"])));
        let f = dir.join_file("x");
        assert_eq!(f.parent(), Some(dir.clone()));
        assert_eq!(dir.join_dir("c").depth(), 3);
        assert_eq!(NormalizedPath::directory("v", &[]).parent(), None);
        assert_eq!(f.to_string(), "v:/a/b/x");
    }
}
