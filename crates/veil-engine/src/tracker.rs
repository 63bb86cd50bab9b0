//! Open-file tracking.
//!
//! One [`OpenFileLink`] exists per underlying file while any handle to it is
//! open, whatever the number of handles. The link caches the resolved binding
//! (file key, nonce, header size, owning entity) so reads and writes never go
//! back to the resolver.
//!
//! Each link carries the file's I/O gate: a `RwLock` around the mutable part
//! of the binding. Reads share it; writes, size changes and migrations take
//! it exclusively.
//!
//! Revocation never touches the gate. It stores [`EntityId::DOOMED`] in the
//! link's atomic entity slot and every later I/O observes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use veil_core::{CfsError, CfsResult, EntityId, FileId, HeaderId};
use veil_crypto::FileKey;

use crate::header::Header;

/// Entity slot value of a plain (unencrypted) link. Sequences start at 1,
/// so no entity id is ever zero.
const NO_ENTITY: u64 = 0;

/// Key material and layout of an encrypted file.
#[derive(Debug, Clone)]
pub struct LinkCrypto {
    /// Header table entry of the owning entity; `None` for files encrypted
    /// with a key no entity holds.
    pub header_id: Option<HeaderId>,
    /// The file's own header as found on (or written to) disk.
    pub header: Header,
    pub file_key: FileKey,
}

impl LinkCrypto {
    pub fn header_size(&self) -> u64 {
        self.header.block_size as u64
    }

    pub fn nonce(&self) -> u64 {
        self.header.nonce
    }
}

/// Mutable half of a link, guarded by the I/O gate.
#[derive(Debug, Clone)]
pub struct LinkState {
    pub crypto: Option<LinkCrypto>,
    /// Logical end of file.
    pub valid_length: u64,
    /// Bytes actually written; `[valid_data_length, valid_length)` reads as zeros.
    pub valid_data_length: u64,
    /// The tail failed to verify and the length is a guess.
    pub recovered: bool,
}

impl LinkState {
    pub fn plain(size: u64) -> Self {
        LinkState {
            crypto: None,
            valid_length: size,
            valid_data_length: size,
            recovered: false,
        }
    }

    pub fn encrypted(crypto: LinkCrypto, valid_length: u64, recovered: bool) -> Self {
        LinkState {
            crypto: Some(crypto),
            valid_length,
            valid_data_length: valid_length,
            recovered,
        }
    }

    pub fn header_size(&self) -> u64 {
        self.crypto.as_ref().map_or(0, LinkCrypto::header_size)
    }

    /// Swap in the binding produced by a migration.
    pub fn replace_binding(&mut self, crypto: Option<LinkCrypto>, valid_length: u64) {
        self.crypto = crypto;
        self.valid_length = valid_length;
        self.valid_data_length = valid_length;
        self.recovered = false;
    }
}

/// What a resolved open hands to the tracker.
pub struct LinkBinding {
    pub entity: Option<EntityId>,
    pub state: LinkState,
}

pub struct OpenFileLink {
    file: FileId,
    entity: AtomicU64,
    doomed_from: AtomicU64,
    ref_count: AtomicUsize,
    gate: RwLock<LinkState>,
}

impl OpenFileLink {
    fn new(file: FileId, binding: LinkBinding) -> Self {
        OpenFileLink {
            file,
            entity: AtomicU64::new(binding.entity.map_or(NO_ENTITY, EntityId::raw)),
            doomed_from: AtomicU64::new(NO_ENTITY),
            ref_count: AtomicUsize::new(1),
            gate: RwLock::new(binding.state),
        }
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    /// Owning entity; `Some(EntityId::DOOMED)` once revoked.
    pub fn entity(&self) -> Option<EntityId> {
        match self.entity.load(Ordering::Acquire) {
            NO_ENTITY => None,
            raw => Some(EntityId::from_raw(raw)),
        }
    }

    pub fn is_doomed(&self) -> bool {
        self.entity().is_some_and(EntityId::is_doomed)
    }

    /// Entity this link was doomed from.
    pub fn doomed_from(&self) -> Option<EntityId> {
        match self.doomed_from.load(Ordering::Acquire) {
            NO_ENTITY => None,
            raw => Some(EntityId::from_raw(raw)),
        }
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Fail with the doomed-handle error once the link was revoked.
    pub fn check(&self) -> CfsResult<()> {
        if self.is_doomed() {
            return Err(CfsError::Doomed {
                from: self.doomed_from().unwrap_or(EntityId::DOOMED),
            });
        }
        Ok(())
    }

    /// Shared side of the I/O gate.
    pub fn read_gate(&self) -> RwLockReadGuard<'_, LinkState> {
        self.gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive side of the I/O gate.
    pub fn write_gate(&self) -> RwLockWriteGuard<'_, LinkState> {
        self.gate.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind an unencrypted link to an entity after encryption was enabled.
    pub fn attach(&self, entity: EntityId) {
        self.entity.store(entity.raw(), Ordering::Release);
    }

    /// Drop the entity binding after encryption was disabled.
    pub fn detach(&self) {
        self.entity.store(NO_ENTITY, Ordering::Release);
    }

    fn doom(&self, from: EntityId) {
        self.doomed_from.store(from.raw(), Ordering::Release);
        self.entity.store(EntityId::DOOMED.raw(), Ordering::Release);
    }
}

impl std::fmt::Debug for OpenFileLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFileLink")
            .field("file", &self.file)
            .field("entity", &self.entity())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Other handles keep the link alive.
    Remaining(usize),
    Released,
    /// The last handle of a revoked link closed.
    ReleasedDoomed(EntityId),
}

#[derive(Default)]
pub struct FileTracker {
    links: RwLock<HashMap<FileId, Arc<OpenFileLink>>>,
    open_gates: Mutex<HashMap<FileId, Arc<Mutex<()>>>>,
}

impl FileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, file: FileId) -> Option<Arc<OpenFileLink>> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&file)
            .cloned()
    }

    fn acquire_existing(&self, file: FileId) -> Option<Arc<OpenFileLink>> {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        let link = links.get(&file)?;
        link.ref_count.fetch_add(1, Ordering::AcqRel);
        Some(Arc::clone(link))
    }

    /// Open one handle on `file`.
    ///
    /// An existing link is shared. Otherwise `prepare` runs (header probe,
    /// key unwrap or a fresh header for a new file) with no tracker lock held
    /// and serialized against other first opens of the same file.
    pub fn on_open<F>(&self, file: FileId, prepare: F) -> CfsResult<Arc<OpenFileLink>>
    where
        F: FnOnce() -> CfsResult<LinkBinding>,
    {
        if let Some(link) = self.acquire_existing(file) {
            return Ok(link);
        }

        let gate = {
            let mut gates = self.open_gates.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(gates.entry(file).or_default())
        };
        let result = {
            let _serialized = gate.lock().unwrap_or_else(PoisonError::into_inner);
            match self.acquire_existing(file) {
                Some(link) => Ok(link),
                None => prepare().map(|binding| {
                    let link = Arc::new(OpenFileLink::new(file, binding));
                    self.links
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(file, Arc::clone(&link));
                    tracing::debug!(%file, entity = ?link.entity(), "link created");
                    link
                }),
            }
        };

        let mut gates = self.open_gates.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&gate) == 2 {
            gates.remove(&file);
        }
        result
    }

    /// Close one handle on `file`.
    pub fn on_close(&self, file: FileId) -> CfsResult<CloseOutcome> {
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        let link = links
            .get(&file)
            .ok_or_else(|| CfsError::NotFound(format!("no open link for {file}")))?;
        let previous = link.ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous > 1 {
            return Ok(CloseOutcome::Remaining(previous - 1));
        }
        let link = links.remove(&file).map(|l| (l.is_doomed(), l.doomed_from()));
        tracing::debug!(%file, "link released");
        Ok(match link {
            Some((true, Some(from))) => CloseOutcome::ReleasedDoomed(from),
            _ => CloseOutcome::Released,
        })
    }

    /// Doom every link bound to `entity`. Returns how many were doomed.
    pub fn revoke(&self, entity: EntityId) -> usize {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        let mut doomed = 0;
        for link in links.values() {
            if link.entity() == Some(entity) {
                link.doom(entity);
                doomed += 1;
            }
        }
        if doomed > 0 {
            tracing::info!(%entity, links = doomed, "open links revoked");
        }
        doomed
    }

    /// Move links of a consolidated entity onto its survivor.
    pub fn repoint(&self, from: EntityId, to: EntityId) -> usize {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        let mut moved = 0;
        for link in links.values() {
            if link
                .entity
                .compare_exchange(from.raw(), to.raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                moved += 1;
            }
        }
        moved
    }

    /// Links currently bound to `entity`.
    pub fn links_of(&self, entity: EntityId) -> usize {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|l| l.entity() == Some(entity))
            .count()
    }

    pub fn len(&self) -> usize {
        self.links.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every link. Handles still held observe nothing new; used on shutdown.
    pub fn clear(&self) -> Vec<Arc<OpenFileLink>> {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, l)| l)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CIPHER_CHACHA20;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use veil_crypto::generate_file_key;

    fn binding(entity: EntityId) -> LinkBinding {
        let header = Header::new(CIPHER_CHACHA20, 512, 0, vec![]).unwrap();
        LinkBinding {
            entity: Some(entity),
            state: LinkState::encrypted(
                LinkCrypto {
                    header_id: Some(HeaderId(1)),
                    header,
                    file_key: generate_file_key(),
                },
                0,
                false,
            ),
        }
    }

    #[test]
    fn concurrent_opens_share_one_link() {
        let tracker = Arc::new(FileTracker::new());
        let prepared = Arc::new(AtomicUsize::new(0));
        let entity = EntityId::new(0, 1);
        let n = 16;

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let prepared = Arc::clone(&prepared);
                thread::spawn(move || {
                    tracker
                        .on_open(FileId(7), || {
                            prepared.fetch_add(1, Ordering::SeqCst);
                            Ok(binding(entity))
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(prepared.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get(FileId(7)).unwrap().ref_count(), n);

        for i in 0..n {
            let outcome = tracker.on_close(FileId(7)).unwrap();
            if i + 1 < n {
                assert_eq!(outcome, CloseOutcome::Remaining(n - i - 1));
            } else {
                assert_eq!(outcome, CloseOutcome::Released);
            }
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn revoke_dooms_and_reports_on_last_close() {
        let tracker = FileTracker::new();
        let entity = EntityId::new(0, 3);
        let link = tracker.on_open(FileId(1), || Ok(binding(entity))).unwrap();
        tracker.on_open(FileId(1), || unreachable!()).unwrap();

        assert_eq!(tracker.revoke(entity), 1);
        assert!(link.is_doomed());
        assert!(matches!(link.check(), Err(CfsError::Doomed { from }) if from == entity));

        assert_eq!(tracker.on_close(FileId(1)).unwrap(), CloseOutcome::Remaining(1));
        assert_eq!(
            tracker.on_close(FileId(1)).unwrap(),
            CloseOutcome::ReleasedDoomed(entity)
        );
    }

    #[test]
    fn failed_prepare_leaves_no_link() {
        let tracker = FileTracker::new();
        let err = tracker
            .on_open(FileId(2), || Err(CfsError::KeyBrokerUnavailable))
            .unwrap_err();
        assert!(matches!(err, CfsError::KeyBrokerUnavailable));
        assert!(tracker.is_empty());
        assert!(tracker.open_gates.lock().unwrap().is_empty());
    }

    #[test]
    fn repoint_moves_links() {
        let tracker = FileTracker::new();
        let (a, b) = (EntityId::new(0, 1), EntityId::new(0, 2));
        tracker.on_open(FileId(1), || Ok(binding(a))).unwrap();
        tracker.on_open(FileId(2), || Ok(binding(b))).unwrap();
        assert_eq!(tracker.repoint(b, a), 1);
        assert_eq!(tracker.links_of(a), 2);
        assert_eq!(tracker.links_of(b), 0);
    }

    #[test]
    fn plain_links_have_no_entity() {
        let tracker = FileTracker::new();
        let link = tracker
            .on_open(FileId(5), || {
                Ok(LinkBinding {
                    entity: None,
                    state: LinkState::plain(100),
                })
            })
            .unwrap();
        assert_eq!(link.entity(), None);
        assert!(link.check().is_ok());
        assert_eq!(tracker.revoke(EntityId::new(0, 1)), 0);
        assert_eq!(link.read_gate().valid_length, 100);
    }
}
