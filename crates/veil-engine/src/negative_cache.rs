//! Negative AutoConfig cache: directories recently scanned without finding a
//! policy file.
//!
//! An unmatched file open walks up to `discovery_depth` ancestors looking for
//! an AutoConfig file. Without a cache every open in an unencrypted tree pays
//! for those lookups again. Misses are remembered for a TTL (default 30s) and
//! dropped as soon as an AutoConfig file appears in the directory. Expired
//! entries are swept by `insert` at most once per TTL.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use veil_core::NormalizedPath;

/// Thread-safe miss cache with TTL-based expiry.
pub struct NegativeCache {
    entries: Mutex<Entries>,
    ttl: Duration,
}

struct Entries {
    map: HashMap<String, Instant>,
    last_sweep: Instant,
}

impl Entries {
    fn sweep(&mut self, ttl: Duration) {
        self.map.retain(|_, inserted_at| inserted_at.elapsed() < ttl);
        self.last_sweep = Instant::now();
    }
}

fn key(dir: &NormalizedPath) -> String {
    dir.as_directory().to_string().to_ascii_lowercase()
}

impl NegativeCache {
    pub fn new(ttl: Duration) -> Self {
        NegativeCache {
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            ttl,
        }
    }

    /// Record that `dir` holds no AutoConfig file.
    pub fn insert(&self, dir: &NormalizedPath) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.lock();
        if entries.last_sweep.elapsed() >= self.ttl {
            entries.sweep(self.ttl);
        }
        entries.map.insert(key(dir), Instant::now());
    }

    /// True if `dir` is known to lack an AutoConfig file and the TTL has not expired.
    pub fn is_negative(&self, dir: &NormalizedPath) -> bool {
        let mut entries = self.lock();
        let key = key(dir);
        match entries.map.get(&key) {
            Some(&inserted_at) if inserted_at.elapsed() < self.ttl => true,
            Some(_) => {
                entries.map.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Forget `dir` (an AutoConfig file was written there).
    pub fn remove(&self, dir: &NormalizedPath) {
        self.lock().map.remove(&key(dir));
    }

    /// Forget every directory at or below `dir`.
    pub fn remove_subtree(&self, dir: &NormalizedPath) {
        let prefix = key(dir);
        let nested = format!("{}/", prefix.trim_end_matches('/'));
        self.lock()
            .map
            .retain(|k, _| k != &prefix && !k.starts_with(&nested));
    }

    /// Evict all entries whose TTL has expired.
    pub fn evict_expired(&self) {
        self.lock().sweep(self.ttl);
    }

    pub fn clear(&self) {
        self.lock().map.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
