//! Name-space operations: AutoConfig discovery and propagation, escape
//! re-attachment, delete, rename and directory enumeration.

use std::collections::BTreeSet;

use veil_core::{CfsError, CfsResult, EntityId, FileId, FileKind, NormalizedPath, SessionId, StackKind};
use veil_crypto::{unwrap_key, EntityKey};
use veil_storage::DirEntry;

use super::Engine;
use crate::aligned::AlignedIo;
use crate::autoconfig::{discovery_candidates, read_autoconfig, remove_autoconfig, write_autoconfig};
use crate::cipher::HeaderProbe;
use crate::entity::{child_deepness, AddOutcome, EntityOrigin, MatchKind, NewEntity};
use crate::header::{Header, HEADER_ALIGNMENT};
use crate::io::{estimate_logical, translate_entry};
use crate::path::{normalize, RawName};

impl Engine {
    /// Look for AutoConfig files on behalf of `path` and turn the nearest
    /// one into an entity.
    pub(super) async fn discover(
        &self,
        path: &NormalizedPath,
        session: SessionId,
    ) -> CfsResult<Option<EntityId>> {
        let engine = &self.config.engine;
        let candidates = if path.is_directory() {
            vec![path.clone()]
        } else {
            discovery_candidates(path, engine.discovery_depth)
        };

        for dir in candidates {
            if self.negative.is_negative(&dir) {
                continue;
            }
            {
                let entities = self.entities_read();
                if entities.is_excluded(&dir) || entities.find_exact(&dir, FileKind::Directory).is_some() {
                    continue;
                }
            }
            let Some(header) =
                read_autoconfig(self.storage.as_ref(), &self.cipher, &dir, &engine.autoconfig_name)?
            else {
                self.negative.insert(&dir);
                continue;
            };
            let id = self.adopt_autoconfig(&dir, header, session).await?;
            return Ok(Some(id));
        }
        Ok(None)
    }

    async fn adopt_autoconfig(
        &self,
        dir: &NormalizedPath,
        header: Header,
        session: SessionId,
    ) -> CfsResult<EntityId> {
        let known = self.headers_read().find_template(&header).map(|(_, key)| key);
        let key = match known {
            Some(key) => key,
            None => self.broker.fire_key(dir, &header.payload).await?,
        };
        tracing::info!(dir = %dir, deepness = header.deepness, session = session.0, "AutoConfig discovered");
        let outcome = self.register(
            dir,
            FileKind::Directory,
            header.deepness,
            BTreeSet::new(),
            EntityOrigin::AutoConfig,
            &header,
            &key,
        )?;
        Ok(outcome.id)
    }

    /// Add an entity holding a fresh reference on `(template, key)` and
    /// settle any consolidation it caused.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn register(
        &self,
        path: &NormalizedPath,
        kind: FileKind,
        deepness: u32,
        owners: BTreeSet<SessionId>,
        origin: EntityOrigin,
        template: &Header,
        key: &EntityKey,
    ) -> CfsResult<AddOutcome> {
        let mut entities = self.entities_write();
        let mut headers = self.headers_write();
        let header = headers.acquire(template, key);
        let outcome = entities.add(NewEntity {
            path: path.clone(),
            kind,
            deepness,
            header,
            owners,
            origin,
        });
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                headers.release(header);
                return Err(e);
            }
        };
        for merge in &outcome.merges {
            headers.release(merge.header);
            self.tracker.repoint(merge.removed, merge.into);
        }
        Ok(outcome)
    }

    /// Give a directory created under a policy its own AutoConfig file.
    pub(super) fn propagate_autoconfig(&self, dir: &NormalizedPath, session: SessionId) -> CfsResult<()> {
        let engine = &self.config.engine;
        if !engine.propagate_autoconfig {
            return Ok(());
        }
        let (template, deepness) = {
            let entities = self.entities_read();
            let Some(m) = entities.resolve(dir, session) else {
                return Ok(());
            };
            if m.kind == MatchKind::Exact {
                return Ok(());
            }
            let Some(deepness) = child_deepness(m.deepness, m.below) else {
                return Ok(());
            };
            let Some(template) = self.headers_read().header(m.header) else {
                return Ok(());
            };
            (template, deepness)
        };
        write_autoconfig(
            self.storage.as_ref(),
            &self.cipher,
            dir,
            &engine.autoconfig_name,
            &template,
            deepness,
        )?;
        self.negative.remove(dir);
        Ok(())
    }

    /// Re-attach a tracked file's policy to a fresh copy of it elsewhere.
    pub(super) fn reattach_escape(&self, path: &NormalizedPath, session: SessionId) -> bool {
        let Some(departure) = self.escapes.claim(session, path) else {
            return false;
        };
        let mut entities = self.entities_write();
        if entities.is_excluded(path) {
            return false;
        }
        let mut headers = self.headers_write();
        if !headers.retain(departure.header) {
            return false;
        }
        let added = entities.add(NewEntity {
            path: path.clone(),
            kind: FileKind::File,
            deepness: 0,
            header: departure.header,
            owners: BTreeSet::new(),
            origin: EntityOrigin::Escape,
        });
        match added {
            Ok(outcome) => {
                tracing::info!(from = %departure.from, to = %path, entity = %outcome.id, "escaped file re-attached");
                true
            }
            Err(e) => {
                headers.release(departure.header);
                tracing::warn!(to = %path, error = %e, "escape re-attach failed");
                false
            }
        }
    }

    /// Drop AutoConfig-derived entities at or below a deleted directory.
    fn forget_autoconfig_entities(&self, dir: &NormalizedPath) {
        let dir = dir.as_directory();
        let mut entities = self.entities_write();
        let doomed: Vec<EntityId> = entities
            .iter()
            .filter(|e| e.origin == EntityOrigin::AutoConfig && dir.contains(&e.path))
            .map(|e| e.id)
            .collect();
        let mut headers = self.headers_write();
        for id in doomed {
            let Some(record) = entities.remove(id) else {
                continue;
            };
            let open = self.tracker.revoke(id);
            if let Some(header) = entities.retire(&record, open) {
                headers.release(header);
            }
        }
        drop(headers);
        drop(entities);
        self.negative.remove_subtree(&dir);
    }

    /// Delete a file or an (otherwise empty) directory.
    pub fn delete(&self, name: RawName<'_>, stack: StackKind, kind: FileKind) -> CfsResult<()> {
        self.check_running()?;
        let path = normalize(self.storage.as_ref(), name, stack, kind)?;
        if kind == FileKind::Directory {
            self.delete_directory(&path)?;
        } else {
            self.storage.remove(&path)?;
        }
        tracing::debug!(path = %path, "deleted");
        Ok(())
    }

    /// The AutoConfig file and the entities it produced only go once the
    /// directory itself is gone. A failed removal puts the file back.
    fn delete_directory(&self, path: &NormalizedPath) -> CfsResult<()> {
        let storage = self.storage.as_ref();
        let name = &self.config.engine.autoconfig_name;
        let occupied = storage
            .list(path)?
            .iter()
            .any(|e| e.kind == FileKind::Directory || !e.name.eq_ignore_ascii_case(name));
        if occupied {
            return Err(CfsError::InvalidRequest(format!("{path} is not empty")));
        }

        let saved = read_autoconfig(storage, &self.cipher, path, name)?;
        remove_autoconfig(storage, path, name)?;
        if let Err(e) = storage.remove(path) {
            if let Some(header) = saved {
                if let Err(restore) =
                    write_autoconfig(storage, &self.cipher, path, name, &header, header.deepness)
                {
                    tracing::error!(dir = %path, error = %restore, "AutoConfig restore failed");
                }
            }
            return Err(e);
        }
        self.forget_autoconfig_entities(path);
        Ok(())
    }

    /// Rename (move) a file or directory.
    ///
    /// A tracked file moved to a place no policy covers keeps its policy
    /// through an exact-path entity. Entities discovered inside a moved
    /// directory move with it.
    pub fn rename(
        &self,
        session: SessionId,
        from: RawName<'_>,
        to: RawName<'_>,
        stack: StackKind,
        kind: FileKind,
    ) -> CfsResult<()> {
        self.check_running()?;
        let storage = self.storage.as_ref();
        let from = normalize(storage, from, stack, kind)?;
        let to = normalize(storage, to, stack, kind)?;
        let tracked = match kind {
            FileKind::File => self.entities_read().resolve(&from, session),
            FileKind::Directory => None,
        };

        storage.rename(&from, &to)?;
        tracing::debug!(from = %from, to = %to, "renamed");

        match kind {
            FileKind::Directory => {
                self.entities_write().rebase(&from, &to);
                self.negative.remove_subtree(&from);
                self.negative.remove_subtree(&to);
            }
            FileKind::File => {
                let Some(m) = tracked else {
                    return Ok(());
                };
                let mut entities = self.entities_write();
                if entities.resolve(&to, session).is_some() || entities.is_excluded(&to) {
                    return Ok(());
                }
                let mut headers = self.headers_write();
                if !headers.retain(m.header) {
                    return Ok(());
                }
                let added = entities.add(NewEntity {
                    path: to.clone(),
                    kind: FileKind::File,
                    deepness: 0,
                    header: m.header,
                    owners: BTreeSet::new(),
                    origin: EntityOrigin::Escape,
                });
                if let Err(e) = added {
                    headers.release(m.header);
                    return Err(e);
                }
                tracing::info!(from = %from, to = %to, "policy follows renamed file");
            }
        }
        Ok(())
    }

    /// Enumerate a directory with logical sizes; AutoConfig files are hidden.
    pub fn list_directory(&self, session: SessionId, dir: &NormalizedPath) -> CfsResult<Vec<DirEntry>> {
        self.check_running()?;
        let dir = dir.as_directory();
        let sector = self.storage.sector_size(&dir.volume)?;
        let autoconfig = &self.config.engine.autoconfig_name;
        let mut out = Vec::new();
        for entry in self.storage.list(&dir)? {
            if entry.kind == FileKind::Directory {
                out.push(entry);
                continue;
            }
            if entry.name.eq_ignore_ascii_case(autoconfig) {
                continue;
            }
            let path = dir.join_file(&entry.name);
            match self.logical_size(&path, entry.id, entry.size, session, sector)? {
                Some((logical, header_size)) => {
                    out.push(translate_entry(entry, logical, header_size, sector as u64))
                }
                None => out.push(entry),
            }
        }
        Ok(out)
    }

    /// Enumerate the directory behind an open directory handle.
    pub fn list_handle(&self, handle: veil_core::HandleId) -> CfsResult<Vec<DirEntry>> {
        let handle = self.handle(handle)?;
        if handle.kind != FileKind::Directory {
            return Err(CfsError::InvalidRequest(format!("{} is not a directory", handle.path)));
        }
        self.list_directory(handle.session, &handle.path)
    }

    /// Logical size and header size of an encrypted file; `None` when plain.
    fn logical_size(
        &self,
        path: &NormalizedPath,
        file: FileId,
        physical: u64,
        session: SessionId,
        sector: u32,
    ) -> CfsResult<Option<(u64, u64)>> {
        if let Some(link) = self.tracker.get(file) {
            let state = link.read_gate();
            return Ok(state
                .crypto
                .as_ref()
                .map(|c| (state.valid_length, c.header_size())));
        }
        if physical < HEADER_ALIGNMENT as u64 {
            return Ok(None);
        }
        let io = AlignedIo::new(self.storage.as_ref(), file, sector)?;
        let HeaderProbe::Present(header) = self.cipher.read_header(&io)? else {
            return Ok(None);
        };
        if header.is_autoconfig() {
            return Ok(None);
        }
        let header_size = header.block_size as u64;
        let key = self
            .bind(path, session)
            .filter(|b| b.template.same_policy(&header))
            .map(|b| b.key);
        if let Some(key) = key {
            let verified = unwrap_key(&key, header.nonce, &header.encrypted_file_key)
                .ok()
                .and_then(|fk| {
                    self.cipher
                        .retrieve_tail(&io, header_size, &fk, header.nonce, false)
                        .ok()
                });
            if let Some(tail) = verified {
                return Ok(Some((tail.valid_length, header_size)));
            }
        }
        Ok(Some((estimate_logical(physical, header_size), header_size)))
    }
}
