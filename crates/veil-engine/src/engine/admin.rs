//! Administrative surface: policy entities, per-file header changes and
//! the key agent connection.

use std::collections::BTreeSet;
use std::sync::PoisonError;

use veil_core::{CfsError, CfsResult, EntityId, FileKind, HandleId, HeaderId, NormalizedPath, SessionId};
use veil_crypto::{generate_file_key, generate_nonce, unwrap_key, wrap_key, EntityKey};

use super::{Engine, Handle};
use crate::aligned::AlignedIo;
use crate::autoconfig::{remove_autoconfig, write_autoconfig};
use crate::broker::KeyAgent;
use crate::entity::{EntityOrigin, EntityRecord};
use crate::header::{smallest_block_for, Header, CIPHER_CHACHA20, DEEPNESS_UNLIMITED};
use crate::io;
use crate::migrate::{FileCrypto, MigrationReport};
use crate::tracker::{LinkCrypto, LinkState, OpenFileLink};

/// Policy entity to register with [`Engine::add_entity`].
#[derive(Debug, Clone)]
pub struct EntitySpec {
    pub path: NormalizedPath,
    pub kind: FileKind,
    pub deepness: u32,
    pub payload: Vec<u8>,
    pub key: EntityKey,
    /// Sessions the entity applies to; empty for all.
    pub owners: BTreeSet<SessionId>,
    /// Also write the directory's AutoConfig file.
    pub persist: bool,
}

impl EntitySpec {
    pub fn directory(path: NormalizedPath, payload: impl Into<Vec<u8>>, key: EntityKey) -> Self {
        EntitySpec {
            path,
            kind: FileKind::Directory,
            deepness: DEEPNESS_UNLIMITED,
            payload: payload.into(),
            key,
            owners: BTreeSet::new(),
            persist: false,
        }
    }

    pub fn file(path: NormalizedPath, payload: impl Into<Vec<u8>>, key: EntityKey) -> Self {
        EntitySpec {
            kind: FileKind::File,
            deepness: 0,
            ..Self::directory(path, payload, key)
        }
    }

    pub fn with_deepness(mut self, deepness: u32) -> Self {
        self.deepness = deepness;
        self
    }

    pub fn owned_by(mut self, session: SessionId) -> Self {
        self.owners.insert(session);
        self
    }

    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }
}

impl Engine {
    pub fn add_entity(&self, spec: EntitySpec) -> CfsResult<EntityId> {
        self.check_running()?;
        if spec.persist && spec.kind != FileKind::Directory {
            return Err(CfsError::InvalidRequest(
                "only directory entities have an AutoConfig file".into(),
            ));
        }
        let block_size = smallest_block_for(spec.payload.len())?
            .max(self.config.engine.default_header_size);
        let deepness = match spec.kind {
            FileKind::Directory => spec.deepness,
            FileKind::File => 0,
        };
        let template = Header::new(CIPHER_CHACHA20, block_size, deepness, spec.payload)?;
        let outcome = self.register(
            &spec.path,
            spec.kind,
            deepness,
            spec.owners,
            EntityOrigin::Explicit,
            &template,
            &spec.key,
        )?;
        if spec.persist {
            write_autoconfig(
                self.storage.as_ref(),
                &self.cipher,
                &spec.path,
                &self.config.engine.autoconfig_name,
                &template,
                deepness,
            )?;
            self.negative.remove(&spec.path);
        }
        tracing::info!(entity = %outcome.id, path = %spec.path, deepness, "entity registered");
        Ok(outcome.id)
    }

    /// Remove an entity. Its open links are revoked at once; its header is
    /// released when the last of them closes. With `purge_autoconfig` the
    /// directory's AutoConfig file is deleted too, so it is not rediscovered.
    pub fn remove_entity(&self, id: EntityId, purge_autoconfig: bool) -> CfsResult<()> {
        let record = {
            let mut entities = self.entities_write();
            let record = entities
                .remove(id)
                .ok_or_else(|| CfsError::NotFound(format!("entity {id}")))?;
            let mut headers = self.headers_write();
            let open = self.tracker.revoke(id);
            if let Some(header) = entities.retire(&record, open) {
                headers.release(header);
            }
            record
        };
        if purge_autoconfig && record.kind == FileKind::Directory {
            remove_autoconfig(
                self.storage.as_ref(),
                &record.path,
                &self.config.engine.autoconfig_name,
            )?;
        }
        Ok(())
    }

    pub fn entities(&self) -> Vec<EntityRecord> {
        self.entities_read().iter().cloned().collect()
    }

    pub fn entity(&self, id: EntityId) -> Option<EntityRecord> {
        self.entities_read().get(id).cloned()
    }

    /// Removed entities still waiting for doomed links to close.
    pub fn retired_entities(&self) -> usize {
        self.entities_read().retired_count()
    }

    pub fn add_negative(&self, dir: &NormalizedPath) -> CfsResult<()> {
        self.entities_write().add_negative(dir)
    }

    pub fn remove_negative(&self, dir: &NormalizedPath) -> bool {
        self.entities_write().remove_negative(dir)
    }

    /// Header of the file behind `handle`, if it has one.
    pub fn get_header(&self, handle: HandleId) -> CfsResult<Option<Header>> {
        let handle = self.handle(handle)?;
        let link = handle.link()?;
        link.check()?;
        {
            let state = link.read_gate();
            if let Some(crypto) = &state.crypto {
                return Ok(Some(crypto.header.clone()));
            }
        }
        let io = self.aligned(handle.file, &handle.path.volume)?;
        Ok(self.cipher.read_header(&io)?.into_header())
    }

    /// Rewrite the file under `template` (payload, deepness, block size),
    /// keeping its file key and nonce.
    pub fn set_header(&self, handle: HandleId, template: &Header, recover: bool) -> CfsResult<MigrationReport> {
        self.exclusive(handle, |handle, link, io, state| {
            let crypto = encrypted(state)?;
            let future = template.for_file(crypto.header.nonce, crypto.header.encrypted_file_key);
            let report = self.cipher.process_file(
                io,
                Some(FileCrypto {
                    header: &crypto.header,
                    key: &crypto.file_key,
                }),
                Some(FileCrypto {
                    header: &future,
                    key: &crypto.file_key,
                }),
                recover,
            )?;
            let key = crypto
                .header_id
                .and_then(|id| self.headers_read().key(id))
                .or_else(|| {
                    self.bind(&handle.path, handle.session)
                        .map(|b| b.key)
                        .filter(|k| verify_key(k, &crypto).is_ok())
                });
            let (entity, header_id) = self.rebind(handle, &future, key.as_ref());
            state.replace_binding(
                Some(LinkCrypto {
                    header_id,
                    header: future,
                    file_key: crypto.file_key,
                }),
                report.valid_length,
            );
            bind_link(link, entity);
            tracing::info!(file = %handle.file, header_size = report.future_header_size, "header replaced");
            Ok(report)
        })
    }

    /// Encrypt the plain file behind `handle` under `template` and `key`.
    pub fn enable_encryption(
        &self,
        handle: HandleId,
        template: &Header,
        key: &EntityKey,
        recover: bool,
    ) -> CfsResult<MigrationReport> {
        self.exclusive(handle, |handle, link, io, state| {
            if state.crypto.is_some() {
                return Err(CfsError::InvalidRequest(format!("{} is already encrypted", handle.path)));
            }
            let file_key = generate_file_key();
            let nonce = generate_nonce();
            let header = template.for_file(nonce, wrap_key(key, nonce, &file_key)?);
            let report = self.cipher.process_file(
                io,
                None,
                Some(FileCrypto {
                    header: &header,
                    key: &file_key,
                }),
                recover,
            )?;
            let (entity, header_id) = self.rebind(handle, &header, Some(key));
            state.replace_binding(
                Some(LinkCrypto {
                    header_id,
                    header,
                    file_key,
                }),
                report.valid_length,
            );
            bind_link(link, entity);
            tracing::info!(file = %handle.file, length = report.valid_length, "encryption enabled");
            Ok(report)
        })
    }

    /// Decrypt the file behind `handle` in place. `key` must unlock its header.
    pub fn disable_encryption(&self, handle: HandleId, key: &EntityKey, recover: bool) -> CfsResult<MigrationReport> {
        self.exclusive(handle, |handle, link, io, state| {
            let crypto = encrypted(state)?;
            verify_key(key, &crypto)?;
            let report = self.cipher.process_file(
                io,
                Some(FileCrypto {
                    header: &crypto.header,
                    key: &crypto.file_key,
                }),
                None,
                recover,
            )?;
            state.replace_binding(None, report.valid_length);
            link.detach();
            tracing::info!(file = %handle.file, length = report.valid_length, "encryption disabled");
            Ok(report)
        })
    }

    /// Re-encrypt the file under a new file key wrapped with `future_key`.
    pub fn rekey(
        &self,
        handle: HandleId,
        present_key: &EntityKey,
        future_key: &EntityKey,
        recover: bool,
    ) -> CfsResult<MigrationReport> {
        self.exclusive(handle, |handle, link, io, state| {
            let crypto = encrypted(state)?;
            verify_key(present_key, &crypto)?;
            let file_key = generate_file_key();
            let nonce = generate_nonce();
            let future = crypto
                .header
                .for_file(nonce, wrap_key(future_key, nonce, &file_key)?);
            let report = self.cipher.process_file(
                io,
                Some(FileCrypto {
                    header: &crypto.header,
                    key: &crypto.file_key,
                }),
                Some(FileCrypto {
                    header: &future,
                    key: &file_key,
                }),
                recover,
            )?;
            let (entity, header_id) = self.rebind(handle, &future, Some(future_key));
            state.replace_binding(
                Some(LinkCrypto {
                    header_id,
                    header: future,
                    file_key,
                }),
                report.valid_length,
            );
            bind_link(link, entity);
            tracing::info!(file = %handle.file, "file rekeyed");
            Ok(report)
        })
    }

    /// Run a migration with the handle's I/O gate held exclusively and every
    /// unwritten range already materialized.
    fn exclusive<T>(
        &self,
        handle: HandleId,
        f: impl FnOnce(&Handle, &OpenFileLink, &AlignedIo<'_>, &mut LinkState) -> CfsResult<T>,
    ) -> CfsResult<T> {
        self.check_running()?;
        let handle = self.handle(handle)?;
        let link = handle.link()?;
        link.check()?;
        let mut state = link.write_gate();
        link.check()?;
        let io = self.aligned(handle.file, &handle.path.volume)?;
        io::materialize(&io, &mut state)?;
        f(&handle, link, &io, &mut state)
    }

    /// Entity and header entry a freshly migrated file belongs to: the one
    /// resolving for its path when that entity's policy and key match.
    fn rebind(
        &self,
        handle: &Handle,
        header: &Header,
        key: Option<&EntityKey>,
    ) -> (Option<EntityId>, Option<HeaderId>) {
        let Some(key) = key else {
            return (None, None);
        };
        match self.bind(&handle.path, handle.session) {
            Some(b) if b.template.same_policy(header) && b.key == *key => {
                (Some(b.entity), Some(b.header))
            }
            _ => (None, None),
        }
    }

    /// Attach a key agent; requests for unknown policies go to it.
    pub fn connect_key_broker(&self) -> KeyAgent {
        self.broker.connect()
    }

    pub fn disconnect_key_broker(&self) {
        self.broker.disconnect();
    }

    /// Answer the in-flight key request identified by `cookie`.
    pub fn fire_key_response(&self, cookie: u32, key: &[u8]) -> CfsResult<()> {
        match EntityKey::from_slice(key) {
            Ok(key) => self.broker.respond(cookie, key),
            Err(e) => {
                self.broker.reject(cookie, &e.to_string())?;
                Err(CfsError::InvalidRequest(format!("key response: {e}")))
            }
        }
    }

    pub fn reject_key_request(&self, cookie: u32, reason: &str) -> CfsResult<()> {
        self.broker.reject(cookie, reason)
    }

    /// A logon session ended: drop it from every owner set and remove the
    /// entities it was the last owner of. Returns how many were removed.
    pub fn remove_session(&self, session: SessionId) -> usize {
        let removed = {
            let mut entities = self.entities_write();
            let removed = entities.remove_session(session);
            let mut headers = self.headers_write();
            for record in &removed {
                let open = self.tracker.revoke(record.id);
                if let Some(header) = entities.retire(record, open) {
                    headers.release(header);
                }
            }
            removed.len()
        };
        self.escapes.forget_session(session);
        tracing::info!(session = session.0, removed, "session removed");
        removed
    }

    /// A volume is going away: close its handles and drop its entities.
    pub fn teardown_volume(&self, volume: &str) -> usize {
        let handles: Vec<HandleId> = self
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|h| h.path.volume.eq_ignore_ascii_case(volume))
            .map(|h| h.id)
            .collect();
        for handle in handles {
            if let Err(e) = self.close(handle) {
                tracing::warn!(handle = handle.0, error = %e, "close during teardown failed");
            }
        }

        let removed = {
            let mut entities = self.entities_write();
            let removed = entities.teardown_volume(volume);
            let mut headers = self.headers_write();
            for record in &removed {
                let open = self.tracker.revoke(record.id);
                if let Some(header) = entities.retire(record, open) {
                    headers.release(header);
                }
            }
            removed.len()
        };
        self.negative
            .remove_subtree(&NormalizedPath::directory(volume, &[]));
        removed
    }
}

fn encrypted(state: &LinkState) -> CfsResult<LinkCrypto> {
    state
        .crypto
        .clone()
        .ok_or_else(|| CfsError::InvalidRequest("file is not encrypted".into()))
}

fn verify_key(key: &EntityKey, crypto: &LinkCrypto) -> CfsResult<()> {
    let unwrapped = unwrap_key(key, crypto.header.nonce, &crypto.header.encrypted_file_key)?;
    if unwrapped.as_bytes() != crypto.file_key.as_bytes() {
        return Err(CfsError::KeyRejected(
            "entity key does not unlock this file".into(),
        ));
    }
    Ok(())
}

fn bind_link(link: &OpenFileLink, entity: Option<EntityId>) {
    match entity {
        Some(entity) => link.attach(entity),
        None => link.detach(),
    }
}
