//! Engine facade: the operations a filter front end forwards.
//!
//! Lock order is entities, then headers, then the tracker. A link's I/O gate
//! may be held while the tables are read; nothing waits on a gate while
//! holding a table lock. No std lock is held across an `.await`.

mod admin;
mod namespace;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use veil_core::config::VeilConfig;
use veil_core::{
    CfsError, CfsResult, EntityId, FileId, FileKind, HandleId, HeaderId, NormalizedPath,
    SessionId, StackKind,
};
use veil_crypto::{generate_file_key, generate_nonce, unwrap_key, wrap_key, EntityKey};
use veil_storage::{FileInfo, StorageStack};

use crate::aligned::AlignedIo;
use crate::broker::KeyBroker;
use crate::cipher::{CipherManager, HeaderProbe};
use crate::entity::EntityTable;
use crate::escape::EscapeTracker;
use crate::header::Header;
use crate::headers::HeaderTable;
use crate::io::{self, FileSizes};
use crate::negative_cache::NegativeCache;
use crate::path::{normalize, RawName};
use crate::tracker::{CloseOutcome, FileTracker, LinkBinding, LinkCrypto, LinkState, OpenFileLink};

pub use admin::EntitySpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    /// Fail when the target does not exist.
    Open,
    /// Fail when the target exists.
    Create,
    #[default]
    OpenIf,
}

#[derive(Debug, Clone, Copy)]
pub struct OpenRequest<'a> {
    pub name: RawName<'a>,
    pub stack: StackKind,
    pub kind: FileKind,
    pub session: SessionId,
    pub disposition: Disposition,
}

impl<'a> OpenRequest<'a> {
    pub fn file(name: &'a str, session: SessionId) -> Self {
        OpenRequest {
            name: RawName::Absolute(name),
            stack: StackKind::Local,
            kind: FileKind::File,
            session,
            disposition: Disposition::OpenIf,
        }
    }

    pub fn directory(name: &'a str, session: SessionId) -> Self {
        OpenRequest {
            kind: FileKind::Directory,
            ..Self::file(name, session)
        }
    }

    pub fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    pub fn on_stack(mut self, stack: StackKind) -> Self {
        self.stack = stack;
        self
    }
}

/// One open handle.
#[derive(Debug)]
pub struct Handle {
    pub id: HandleId,
    pub file: FileId,
    /// Path at open time.
    pub path: NormalizedPath,
    pub kind: FileKind,
    pub session: SessionId,
    link: Option<Arc<OpenFileLink>>,
}

impl Handle {
    fn link(&self) -> CfsResult<&Arc<OpenFileLink>> {
        self.link
            .as_ref()
            .ok_or_else(|| CfsError::InvalidRequest(format!("{} is a directory", self.path)))
    }
}

/// Policy resolved for an open, captured under the table locks.
#[derive(Clone)]
struct Binding {
    entity: EntityId,
    header: HeaderId,
    template: Arc<Header>,
    key: EntityKey,
}

pub struct Engine {
    config: VeilConfig,
    storage: Arc<dyn StorageStack>,
    cipher: CipherManager,
    entities: RwLock<EntityTable>,
    headers: RwLock<HeaderTable>,
    tracker: FileTracker,
    broker: KeyBroker,
    negative: NegativeCache,
    escapes: EscapeTracker,
    handles: RwLock<HashMap<HandleId, Arc<Handle>>>,
    next_handle: AtomicU64,
    shutting_down: AtomicBool,
}

impl Engine {
    pub fn new(config: VeilConfig, storage: Arc<dyn StorageStack>) -> CfsResult<Self> {
        config.engine.validate()?;
        let engine = &config.engine;
        tracing::info!(
            header_size = engine.default_header_size,
            recovery_mode = engine.recovery_mode,
            discovery_depth = engine.discovery_depth,
            "engine starting"
        );
        Ok(Engine {
            cipher: CipherManager::new(engine),
            entities: RwLock::new(EntityTable::new(engine.autoconfig_name.clone())),
            headers: RwLock::new(HeaderTable::new()),
            tracker: FileTracker::new(),
            broker: KeyBroker::new(config.broker.clone()),
            negative: NegativeCache::new(engine.negative_cache_ttl()),
            escapes: EscapeTracker::new(engine.escape_window()),
            handles: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            storage,
            config,
        })
    }

    pub fn config(&self) -> &VeilConfig {
        &self.config
    }

    pub fn storage(&self) -> &dyn StorageStack {
        self.storage.as_ref()
    }

    fn entities_read(&self) -> RwLockReadGuard<'_, EntityTable> {
        self.entities.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn entities_write(&self) -> RwLockWriteGuard<'_, EntityTable> {
        self.entities.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn headers_read(&self) -> RwLockReadGuard<'_, HeaderTable> {
        self.headers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn headers_write(&self) -> RwLockWriteGuard<'_, HeaderTable> {
        self.headers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_running(&self) -> CfsResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CfsError::ShuttingDown);
        }
        Ok(())
    }

    fn aligned(&self, file: FileId, volume: &str) -> CfsResult<AlignedIo<'_>> {
        AlignedIo::new(self.storage.as_ref(), file, self.storage.sector_size(volume)?)
    }

    fn handle(&self, id: HandleId) -> CfsResult<Arc<Handle>> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(CfsError::InvalidHandle(id.0))
    }

    /// Entity and key material that apply to `path` for `session`.
    fn bind(&self, path: &NormalizedPath, session: SessionId) -> Option<Binding> {
        let entities = self.entities_read();
        let m = entities.resolve(path, session)?;
        let headers = self.headers_read();
        let entry = headers.get(m.header)?;
        Some(Binding {
            entity: m.id,
            header: m.header,
            template: Arc::clone(&entry.header),
            key: entry.key.clone(),
        })
    }

    /// Open a file or directory.
    pub async fn open(&self, request: OpenRequest<'_>) -> CfsResult<HandleId> {
        self.check_running()?;
        let path = normalize(self.storage.as_ref(), request.name, request.stack, request.kind)?;
        let (info, created) = self.lookup_or_create(&path, request.kind, request.disposition)?;
        if info.kind != request.kind {
            return Err(CfsError::InvalidRequest(format!(
                "{path} is a {:?}, not a {:?}",
                info.kind, request.kind
            )));
        }

        let link = match request.kind {
            FileKind::Directory => {
                if created {
                    self.propagate_autoconfig(&path, request.session)?;
                }
                self.discover(&path, request.session).await?;
                None
            }
            FileKind::File => Some(self.open_file(&path, info, created, request.session).await?),
        };

        let id = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(Handle {
            id,
            file: info.id,
            path,
            kind: request.kind,
            session: request.session,
            link,
        });
        tracing::debug!(handle = id.0, path = %handle.path, created, "opened");
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle);
        Ok(id)
    }

    fn lookup_or_create(
        &self,
        path: &NormalizedPath,
        kind: FileKind,
        disposition: Disposition,
    ) -> CfsResult<(FileInfo, bool)> {
        if path.is_directory() && path.depth() == 0 {
            let info = FileInfo {
                id: FileId(0),
                kind: FileKind::Directory,
                size: 0,
            };
            return match disposition {
                Disposition::Create => Err(CfsError::InvalidRequest(format!("{path} exists"))),
                _ => Ok((info, false)),
            };
        }
        match (self.storage.lookup(path)?, disposition) {
            (Some(_), Disposition::Create) => {
                Err(CfsError::InvalidRequest(format!("{path} already exists")))
            }
            (Some(info), _) => Ok((info, false)),
            (None, Disposition::Open) => Err(CfsError::NotFound(path.to_string())),
            (None, disposition) => match self.storage.create(path, kind) {
                Ok(info) => Ok((info, true)),
                // Lost a create race with another opener
                Err(e) => match (disposition, self.storage.lookup(path)?) {
                    (Disposition::OpenIf, Some(info)) => Ok((info, false)),
                    _ => Err(e),
                },
            },
        }
    }

    async fn open_file(
        &self,
        path: &NormalizedPath,
        info: FileInfo,
        created: bool,
        session: SessionId,
    ) -> CfsResult<Arc<OpenFileLink>> {
        let hidden = self.entities_read().is_autoconfig_file(path);
        let mut binding = if hidden { None } else { self.bind(path, session) };
        if binding.is_none() && !hidden {
            if created && self.reattach_escape(path, session) {
                binding = self.bind(path, session);
            }
            if binding.is_none() && self.discover(path, session).await?.is_some() {
                binding = self.bind(path, session);
            }
        }
        if let Some(b) = &binding {
            self.escapes.record(session, path, b.header);
        }

        let sector = self.storage.sector_size(&path.volume)?;
        let storage = self.storage.as_ref();
        let cipher = &self.cipher;
        let mut rebound = false;
        loop {
            let link = self.tracker.on_open(info.id, || {
                prepare_link(storage, cipher, info.id, sector, binding.as_ref())
            })?;

            // A revoked link admits no new handles. An entity gone between
            // resolve and link creation was usually folded into another one.
            let (from, vanished) = match link.entity() {
                Some(entity) if entity.is_doomed() => (link.doomed_from(), false),
                Some(entity) if self.entities_read().get(entity).is_none() => (Some(entity), true),
                _ => (None, false),
            };
            let Some(from) = from else {
                return Ok(link);
            };
            if let CloseOutcome::ReleasedDoomed(released) = self.tracker.on_close(info.id)? {
                self.release_retired(released);
            }
            if vanished && !rebound {
                rebound = true;
                tracing::debug!(path = %path, entity = %from, "entity replaced during open, binding again");
                binding = self.bind(path, session);
                continue;
            }
            return Err(CfsError::Doomed { from });
        }
    }

    /// Close a handle. The last close of a file zero-fills any unwritten
    /// extension and, for a revoked link, finishes the entity release.
    pub fn close(&self, handle: HandleId) -> CfsResult<()> {
        let handle = self
            .handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
            .ok_or(CfsError::InvalidHandle(handle.0))?;
        let Some(link) = &handle.link else {
            return Ok(());
        };

        if !link.is_doomed() && link.ref_count() == 1 {
            let mut state = link.write_gate();
            let filled = self
                .aligned(handle.file, &handle.path.volume)
                .and_then(|io| io::materialize(&io, &mut state));
            if let Err(e) = filled {
                tracing::warn!(file = %handle.file, error = %e, "zero-fill on close failed");
            }
        }

        match self.tracker.on_close(handle.file)? {
            CloseOutcome::ReleasedDoomed(from) => self.release_retired(from),
            CloseOutcome::Released | CloseOutcome::Remaining(_) => {}
        }
        tracing::debug!(handle = handle.id.0, "closed");
        Ok(())
    }

    fn release_retired(&self, from: EntityId) {
        let mut entities = self.entities_write();
        if let Some(header) = entities.retired_link_closed(from) {
            let mut headers = self.headers_write();
            headers.release(header);
            tracing::info!(entity = %from, "revoked entity fully released");
        }
    }

    pub fn read(&self, handle: HandleId, offset: u64, len: usize) -> CfsResult<Vec<u8>> {
        let handle = self.handle(handle)?;
        let link = handle.link()?;
        link.check()?;
        let state = link.read_gate();
        link.check()?;
        let io = self.aligned(handle.file, &handle.path.volume)?;
        io::read(&io, &state, offset, len)
    }

    pub fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> CfsResult<usize> {
        let handle = self.handle(handle)?;
        let link = handle.link()?;
        link.check()?;
        let mut state = link.write_gate();
        link.check()?;
        let io = self.aligned(handle.file, &handle.path.volume)?;
        io::write(&io, &self.cipher, &mut state, offset, data)
    }

    /// Set the logical end of file.
    pub fn set_size(&self, handle: HandleId, size: u64) -> CfsResult<()> {
        let handle = self.handle(handle)?;
        let link = handle.link()?;
        link.check()?;
        let mut state = link.write_gate();
        link.check()?;
        let io = self.aligned(handle.file, &handle.path.volume)?;
        io::set_size(&io, &self.cipher, &mut state, size)
    }

    pub fn query_size(&self, handle: HandleId) -> CfsResult<FileSizes> {
        let handle = self.handle(handle)?;
        let link = handle.link()?;
        link.check()?;
        let state = link.read_gate();
        let sector = self.storage.sector_size(&handle.path.volume)? as u64;
        Ok(io::sizes(&state, sector))
    }

    /// Path the handle was opened with.
    pub fn handle_path(&self, handle: HandleId) -> CfsResult<NormalizedPath> {
        Ok(self.handle(handle)?.path.clone())
    }

    /// Whether the handle's file is stored encrypted.
    pub fn is_encrypted(&self, handle: HandleId) -> CfsResult<bool> {
        let handle = self.handle(handle)?;
        let link = handle.link()?;
        let state = link.read_gate();
        Ok(state.crypto.is_some())
    }

    /// Entity bound to the handle's link, if any.
    pub fn handle_entity(&self, handle: HandleId) -> CfsResult<Option<EntityId>> {
        Ok(self.handle(handle)?.link()?.entity())
    }

    pub fn open_handles(&self) -> usize {
        self.handles.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Handles sharing the link of `file`, or 0 when it is not open.
    pub fn link_ref_count(&self, file: FileId) -> usize {
        self.tracker.get(file).map_or(0, |l| l.ref_count())
    }

    pub fn open_links(&self) -> usize {
        self.tracker.len()
    }

    pub fn header_count(&self) -> usize {
        self.headers_read().len()
    }

    pub fn file_id(&self, handle: HandleId) -> CfsResult<FileId> {
        Ok(self.handle(handle)?.file)
    }

    /// Stop accepting requests, close every handle and drop all policy state.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.broker.disconnect();
        let open: Vec<HandleId> = self
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        for handle in open {
            if let Err(e) = self.close(handle) {
                tracing::warn!(handle = handle.0, error = %e, "close during shutdown failed");
            }
        }
        {
            let mut entities = self.entities_write();
            let mut headers = self.headers_write();
            for header in entities.clear() {
                headers.release(header);
            }
            headers.clear();
        }
        self.tracker.clear();
        self.negative.clear();
        self.escapes.clear();
        tracing::info!("engine shut down");
    }
}

/// Build the binding for the first open of a file.
fn prepare_link(
    storage: &dyn StorageStack,
    cipher: &CipherManager,
    file: FileId,
    sector: u32,
    binding: Option<&Binding>,
) -> CfsResult<LinkBinding> {
    let io = AlignedIo::new(storage, file, sector)?;
    let Some(b) = binding else {
        return Ok(LinkBinding {
            entity: None,
            state: LinkState::plain(io.size()?),
        });
    };

    match cipher.read_header(&io)? {
        HeaderProbe::Present(header) if !header.is_autoconfig() => {
            if !header.same_policy(&b.template) {
                tracing::warn!(%file, entity = %b.entity, "on-disk header belongs to another policy");
                return Err(CfsError::PolicyMismatch);
            }
            let file_key = unwrap_key(&b.key, header.nonce, &header.encrypted_file_key)?;
            let tail = cipher
                .retrieve_tail(&io, header.block_size as u64, &file_key, header.nonce, false)
                .map_err(|e| {
                    if e.is_integrity() {
                        CfsError::KeyRejected(format!("{file} does not verify under the entity key: {e}"))
                    } else {
                        e
                    }
                })?;
            Ok(LinkBinding {
                entity: Some(b.entity),
                state: LinkState::encrypted(
                    LinkCrypto {
                        header_id: Some(b.header),
                        header,
                        file_key,
                    },
                    tail.valid_length,
                    tail.recovered,
                ),
            })
        }
        HeaderProbe::Empty => {
            let file_key = generate_file_key();
            let nonce = generate_nonce();
            let slot = wrap_key(&b.key, nonce, &file_key)?;
            let header = b.template.for_file(nonce, slot);
            let header_size = header.block_size as u64;
            cipher.write_header(&io, &header)?;
            cipher.update_tail(&io, header_size, &file_key, nonce, 0)?;
            tracing::info!(%file, entity = %b.entity, header_size, "new file encrypted");
            Ok(LinkBinding {
                entity: Some(b.entity),
                state: LinkState::encrypted(
                    LinkCrypto {
                        header_id: Some(b.header),
                        header,
                        file_key,
                    },
                    0,
                    false,
                ),
            })
        }
        probe => {
            tracing::debug!(%file, ?probe, "existing plain content under a policy left as is");
            Ok(LinkBinding {
                entity: None,
                state: LinkState::plain(io.size()?),
            })
        }
    }
}
