//! Header table: policy templates shared by entities.
//!
//! Each entry holds a header template and the entity key that unlocks the
//! file keys written under it. Entities hold strong references (counted
//! here); open-file links only remember the id.

use std::collections::HashMap;
use std::sync::Arc;

use veil_core::HeaderId;
use veil_crypto::EntityKey;

use crate::header::Header;

pub struct HeaderEntry {
    pub header: Arc<Header>,
    pub key: EntityKey,
    pub refs: usize,
}

#[derive(Default)]
pub struct HeaderTable {
    entries: HashMap<HeaderId, HeaderEntry>,
    next_id: u64,
}

fn same_template(a: &Header, b: &Header) -> bool {
    a.same_policy(b) && a.block_size == b.block_size
}

impl HeaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing entry for an identical (header, key) pair.
    pub fn find(&self, header: &Header, key: &EntityKey) -> Option<HeaderId> {
        self.entries
            .iter()
            .find(|(_, e)| same_template(&e.header, header) && e.key == *key)
            .map(|(id, _)| *id)
    }

    /// Entity key of any entry with the same template, whatever its key.
    pub fn find_template(&self, header: &Header) -> Option<(HeaderId, EntityKey)> {
        self.entries
            .iter()
            .filter(|(_, e)| same_template(&e.header, header))
            .min_by_key(|(id, _)| **id)
            .map(|(id, e)| (*id, e.key.clone()))
    }

    /// Take a reference on the entry for `(header, key)`, creating it if needed.
    pub fn acquire(&mut self, header: &Header, key: &EntityKey) -> HeaderId {
        if let Some(id) = self.find(header, key) {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.refs += 1;
            }
            return id;
        }
        self.next_id += 1;
        let id = HeaderId(self.next_id);
        self.entries.insert(
            id,
            HeaderEntry {
                header: Arc::new(header.clone()),
                key: key.clone(),
                refs: 1,
            },
        );
        tracing::debug!(header = %id, payload_len = header.payload.len(), "header registered");
        id
    }

    pub fn retain(&mut self, id: HeaderId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Drop one reference. Returns true when the entry was freed.
    pub fn release(&mut self, id: HeaderId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            tracing::warn!(header = %id, "release of unknown header");
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            self.entries.remove(&id);
            tracing::debug!(header = %id, "header released");
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: HeaderId) -> Option<&HeaderEntry> {
        self.entries.get(&id)
    }

    pub fn header(&self, id: HeaderId) -> Option<Arc<Header>> {
        self.entries.get(&id).map(|e| Arc::clone(&e.header))
    }

    pub fn key(&self, id: HeaderId) -> Option<EntityKey> {
        self.entries.get(&id).map(|e| e.key.clone())
    }

    pub fn refs(&self, id: HeaderId) -> usize {
        self.entries.get(&id).map_or(0, |e| e.refs)
    }

    pub fn contains(&self, id: HeaderId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
