//! Encryption entities and path matching.
//!
//! An entity binds a path (a single file, or a directory down to `deepness`
//! levels) to a header template in the [`HeaderTable`](crate::headers::HeaderTable).
//! Entities are grouped per volume; each volume also carries a negative list
//! of subtrees that are never encrypted.
//!
//! Matching rules, in order:
//! 1. the AutoConfig file itself never matches
//! 2. a path under a negative entry never matches
//! 3. an exact entity (same path) wins over any prefix entity
//! 4. among covering directory entities the deepest one wins
//!
//! Entities whose owner set is non-empty only apply to those sessions.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use veil_core::{CfsError, CfsResult, EntityId, FileKind, HeaderId, NormalizedPath, SessionId};

use crate::header::DEEPNESS_UNLIMITED;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Prefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOrigin {
    /// Added through the administrative surface.
    Explicit,
    /// Materialized from a directory's AutoConfig file.
    AutoConfig,
    /// Re-attached after a file left a tracked tree.
    Escape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub id: EntityId,
    pub path: NormalizedPath,
    pub kind: FileKind,
    pub deepness: u32,
    pub header: HeaderId,
    pub owners: BTreeSet<SessionId>,
    pub origin: EntityOrigin,
}

impl EntityRecord {
    pub fn applies_to(&self, session: SessionId) -> bool {
        self.owners.is_empty() || self.owners.contains(&session)
    }

    /// Deepest directory level (absolute) this entity reaches.
    fn reach(&self) -> u64 {
        if self.deepness == DEEPNESS_UNLIMITED {
            u64::MAX
        } else {
            self.path.depth() as u64 + self.deepness as u64
        }
    }

    /// Levels below this directory entity at which `target` lives, if covered.
    pub fn covers(&self, target: &NormalizedPath) -> Option<u32> {
        if self.kind != FileKind::Directory {
            return None;
        }
        let below = self.path.depth_below(target)?;
        (self.deepness == DEEPNESS_UNLIMITED || below <= self.deepness).then_some(below)
    }

    /// True when every path and session `other` applies to is already
    /// covered by `self`.
    fn subsumes(&self, other: &EntityRecord) -> bool {
        let owners_covered = self.owners.is_empty()
            || (!other.owners.is_empty() && other.owners.is_subset(&self.owners));
        self.path.contains(&other.path) && self.reach() >= other.reach() && owners_covered
    }

    fn is_exact_for(&self, target: &NormalizedPath) -> bool {
        match self.kind {
            FileKind::File => self.path.same_as(target),
            FileKind::Directory => target.is_directory() && self.path.same_as(target),
        }
    }
}

/// Budget an AutoConfig file written into a new subdirectory `below` levels
/// under a directory entity of `deepness` receives.
pub fn child_deepness(deepness: u32, below: u32) -> Option<u32> {
    if deepness == DEEPNESS_UNLIMITED {
        return Some(DEEPNESS_UNLIMITED);
    }
    deepness.checked_sub(below + 1)
}

/// Result of resolving a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMatch {
    pub id: EntityId,
    pub header: HeaderId,
    pub kind: MatchKind,
    pub entity_path: NormalizedPath,
    pub deepness: u32,
    /// Levels below the entity directory (0 for exact matches).
    pub below: u32,
}

/// Entity to insert.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub path: NormalizedPath,
    pub kind: FileKind,
    pub deepness: u32,
    pub header: HeaderId,
    pub owners: BTreeSet<SessionId>,
    pub origin: EntityOrigin,
}

/// One consolidation step: `removed` was folded into `into`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Merge {
    pub removed: EntityId,
    pub into: EntityId,
    pub header: HeaderId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    /// Entity that now carries the policy (the new one or a survivor).
    pub id: EntityId,
    pub merges: Vec<Merge>,
}

/// Removed entity whose header reference waits for its doomed links.
#[derive(Debug, Clone, Copy)]
struct Retired {
    header: HeaderId,
    open_links: usize,
}

struct Volume {
    name: String,
    next_seq: u64,
    entities: BTreeMap<EntityId, EntityRecord>,
    negative: Vec<NormalizedPath>,
}

pub struct EntityTable {
    autoconfig_name: String,
    volumes: Vec<Volume>,
    by_name: HashMap<String, u16>,
    retired: HashMap<EntityId, Retired>,
}

impl EntityTable {
    pub fn new(autoconfig_name: impl Into<String>) -> Self {
        EntityTable {
            autoconfig_name: autoconfig_name.into(),
            volumes: Vec::new(),
            by_name: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    pub fn autoconfig_name(&self) -> &str {
        &self.autoconfig_name
    }

    pub fn is_autoconfig_file(&self, path: &NormalizedPath) -> bool {
        path.file
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case(&self.autoconfig_name))
    }

    fn volume(&self, name: &str) -> Option<&Volume> {
        let idx = *self.by_name.get(&name.to_ascii_lowercase())?;
        self.volumes.get(idx as usize)
    }

    fn volume_mut(&mut self, name: &str) -> Option<&mut Volume> {
        let idx = *self.by_name.get(&name.to_ascii_lowercase())?;
        self.volumes.get_mut(idx as usize)
    }

    fn volume_of(&mut self, id: EntityId) -> Option<&mut Volume> {
        self.volumes.get_mut(id.volume_index() as usize)
    }

    fn volume_or_insert(&mut self, name: &str) -> CfsResult<u16> {
        let key = name.to_ascii_lowercase();
        if let Some(idx) = self.by_name.get(&key) {
            return Ok(*idx);
        }
        let idx = u16::try_from(self.volumes.len())
            .map_err(|_| CfsError::InvalidRequest("too many volumes with entities".into()))?;
        self.volumes.push(Volume {
            name: name.to_string(),
            next_seq: 1,
            entities: BTreeMap::new(),
            negative: Vec::new(),
        });
        self.by_name.insert(key, idx);
        Ok(idx)
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityRecord> {
        self.volumes
            .get(id.volume_index() as usize)?
            .entities
            .get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.volumes.iter().flat_map(|v| v.entities.values())
    }

    pub fn len(&self) -> usize {
        self.volumes.iter().map(|v| v.entities.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entity registered for exactly this path, if any.
    pub fn find_exact(&self, path: &NormalizedPath, kind: FileKind) -> Option<&EntityRecord> {
        self.volume(&path.volume)?
            .entities
            .values()
            .find(|e| e.kind == kind && e.path.same_as(path))
    }

    /// Insert an entity and fold directory entities that use the same header
    /// into whichever of them already covers the other.
    pub fn add(&mut self, new: NewEntity) -> CfsResult<AddOutcome> {
        if new.kind == FileKind::File && new.path.is_directory() {
            return Err(CfsError::InvalidRequest(format!(
                "file entity needs a file path, got {}",
                new.path
            )));
        }
        let path = match new.kind {
            FileKind::Directory => new.path.as_directory(),
            FileKind::File => new.path,
        };
        let idx = self.volume_or_insert(&path.volume)?;
        let volume = &mut self.volumes[idx as usize];
        let id = EntityId::new(idx, volume.next_seq);
        volume.next_seq += 1;
        volume.entities.insert(
            id,
            EntityRecord {
                id,
                path,
                kind: new.kind,
                deepness: new.deepness,
                header: new.header,
                owners: new.owners,
                origin: new.origin,
            },
        );
        tracing::info!(entity = %id, origin = ?new.origin, "entity added");

        let (survivor, merges) = self.consolidate(id);
        Ok(AddOutcome {
            id: survivor,
            merges,
        })
    }

    fn consolidate(&mut self, start: EntityId) -> (EntityId, Vec<Merge>) {
        let mut current = start;
        let mut merges = Vec::new();
        while let Some(merge) = self.merge_one(current) {
            current = merge.into;
            merges.push(merge);
        }
        (current, merges)
    }

    fn merge_one(&mut self, id: EntityId) -> Option<Merge> {
        let volume = self.volume_of(id)?;
        let this = volume.entities.get(&id)?.clone();
        if this.kind != FileKind::Directory {
            return None;
        }
        let other = volume
            .entities
            .values()
            .filter(|o| o.id != id && o.kind == FileKind::Directory && o.header == this.header)
            .find(|o| o.subsumes(&this) || this.subsumes(o))?
            .clone();

        let (mut survivor, mut removed) = if this.subsumes(&other) {
            (this, other)
        } else {
            (other, this)
        };
        // On equal paths the older id survives and takes the wider record
        if survivor.path.same_as(&removed.path) && removed.id < survivor.id {
            std::mem::swap(&mut survivor.id, &mut removed.id);
        }

        volume.entities.remove(&removed.id);
        if let Some(rec) = volume.entities.get_mut(&survivor.id) {
            rec.deepness = survivor.deepness;
            rec.owners = survivor.owners.clone();
        }
        tracing::info!(
            survivor = %survivor.id,
            removed = %removed.id,
            deepness = survivor.deepness,
            "entities consolidated"
        );
        Some(Merge {
            removed: removed.id,
            into: survivor.id,
            header: removed.header,
        })
    }

    pub fn remove(&mut self, id: EntityId) -> Option<EntityRecord> {
        let removed = self.volume_of(id)?.entities.remove(&id);
        if removed.is_some() {
            tracing::info!(entity = %id, "entity removed");
        }
        removed
    }

    /// Drop `session` from every owner set. Entities whose last owner left
    /// are removed and returned.
    pub fn remove_session(&mut self, session: SessionId) -> Vec<EntityRecord> {
        let mut removed = Vec::new();
        for volume in &mut self.volumes {
            let orphaned: Vec<EntityId> = volume
                .entities
                .values_mut()
                .filter_map(|e| {
                    (e.owners.remove(&session) && e.owners.is_empty()).then_some(e.id)
                })
                .collect();
            for id in orphaned {
                if let Some(rec) = volume.entities.remove(&id) {
                    removed.push(rec);
                }
            }
        }
        removed
    }

    /// Remove every entity and negative entry of `volume`.
    pub fn teardown_volume(&mut self, volume: &str) -> Vec<EntityRecord> {
        let Some(v) = self.volume_mut(volume) else {
            return Vec::new();
        };
        v.negative.clear();
        let removed: Vec<EntityRecord> = std::mem::take(&mut v.entities).into_values().collect();
        tracing::info!(volume = %v.name, entities = removed.len(), "volume torn down");
        removed
    }

    /// Re-home entities found at or below `from` after the directory moved
    /// to `to`. Explicit entities stay bound to their configured path.
    pub fn rebase(&mut self, from: &NormalizedPath, to: &NormalizedPath) -> usize {
        let from = from.as_directory();
        let to = to.as_directory();
        if !from.same_volume(&to) {
            return 0;
        }
        let Some(volume) = self.volume_mut(&from.volume) else {
            return 0;
        };
        let mut moved = 0;
        for entity in volume.entities.values_mut() {
            if entity.origin == EntityOrigin::Explicit || !from.contains(&entity.path) {
                continue;
            }
            let rest = entity.path.directory[from.depth()..].to_vec();
            entity.path.directory = to.directory.iter().cloned().chain(rest).collect();
            moved += 1;
        }
        if moved > 0 {
            tracing::info!(from = %from, to = %to, moved, "entities re-homed");
        }
        moved
    }

    /// Never encrypt anything at or below `dir`.
    pub fn add_negative(&mut self, dir: &NormalizedPath) -> CfsResult<()> {
        let dir = dir.as_directory();
        let idx = self.volume_or_insert(&dir.volume)?;
        let volume = &mut self.volumes[idx as usize];
        if !volume.negative.iter().any(|n| n.same_as(&dir)) {
            volume.negative.push(dir);
        }
        Ok(())
    }

    pub fn remove_negative(&mut self, dir: &NormalizedPath) -> bool {
        let dir = dir.as_directory();
        let Some(volume) = self.volume_mut(&dir.volume) else {
            return false;
        };
        let before = volume.negative.len();
        volume.negative.retain(|n| !n.same_as(&dir));
        volume.negative.len() != before
    }

    pub fn is_excluded(&self, path: &NormalizedPath) -> bool {
        self.volume(&path.volume)
            .is_some_and(|v| v.negative.iter().any(|n| n.contains(path)))
    }

    /// Find the entity that applies to `path` for `session`.
    pub fn resolve(&self, path: &NormalizedPath, session: SessionId) -> Option<EntityMatch> {
        if self.is_autoconfig_file(path) || self.is_excluded(path) {
            return None;
        }
        let volume = self.volume(&path.volume)?;
        let candidates = volume.entities.values().filter(|e| e.applies_to(session));

        let mut best: Option<(&EntityRecord, u32)> = None;
        for entity in candidates {
            if entity.is_exact_for(path) {
                return Some(to_match(entity, MatchKind::Exact, 0));
            }
            let Some(below) = entity.covers(path) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((current, _)) => entity.path.depth() > current.path.depth(),
            };
            if better {
                best = Some((entity, below));
            }
        }
        best.map(|(entity, below)| to_match(entity, MatchKind::Prefix, below))
    }

    /// Park the header reference of a removed entity until `open_links`
    /// doomed links have closed. Returns the header when nothing is open.
    pub fn retire(&mut self, record: &EntityRecord, open_links: usize) -> Option<HeaderId> {
        if open_links == 0 {
            return Some(record.header);
        }
        self.retired.insert(
            record.id,
            Retired {
                header: record.header,
                open_links,
            },
        );
        None
    }

    /// A doomed link of `id` closed. Returns the header to release once the
    /// last one is gone.
    pub fn retired_link_closed(&mut self, id: EntityId) -> Option<HeaderId> {
        let retired = self.retired.get_mut(&id)?;
        retired.open_links = retired.open_links.saturating_sub(1);
        if retired.open_links == 0 {
            let header = retired.header;
            self.retired.remove(&id);
            return Some(header);
        }
        None
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Drop all state; returns every header reference still held.
    pub fn clear(&mut self) -> Vec<HeaderId> {
        let mut headers: Vec<HeaderId> = self.iter().map(|e| e.header).collect();
        headers.extend(self.retired.values().map(|r| r.header));
        self.volumes.clear();
        self.by_name.clear();
        self.retired.clear();
        headers
    }
}

fn to_match(entity: &EntityRecord, kind: MatchKind, below: u32) -> EntityMatch {
    EntityMatch {
        id: entity.id,
        header: entity.header,
        kind,
        entity_path: entity.path.clone(),
        deepness: entity.deepness,
        below,
    }
}
