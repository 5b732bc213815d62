//! In-process window store.
//!
//! Each key's sorted set lives in a `DashMap` entry; the whole admission
//! transaction runs while holding that entry's shard lock, so other callers
//! observe it as one unit, just as with a MULTI/EXEC block on a real server.

use std::collections::BTreeSet;
use std::time::Instant;

use dashmap::DashMap;

use crate::clock::{SharedClock, SystemClock};
use crate::error::StoreResult;
use crate::storage::{WindowAdmission, WindowStore};

#[derive(Debug, Default)]
struct SortedSet {
    members: BTreeSet<(u64, String)>,
    expires_at: Option<Instant>,
}

impl SortedSet {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn remove_below(&mut self, min_score: u64) {
        self.members = self.members.split_off(&(min_score, String::new()));
    }
}

/// In-memory [`WindowStore`] for tests and single-node deployments.
///
/// Key expiry follows the store clock; expired keys read as empty and are
/// dropped lazily or by [`purge_expired`](Self::purge_expired).
pub struct MemoryWindowStore {
    sets: DashMap<String, SortedSet>,
    clock: SharedClock,
}

impl std::fmt::Debug for MemoryWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWindowStore")
            .field("keys", &self.sets.len())
            .finish()
    }
}

impl Default for MemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Create an empty store whose key expiry follows `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            sets: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.sets.len();
        self.sets.retain(|_, set| !set.is_expired(now));
        before.saturating_sub(self.sets.len())
    }

    /// Number of keys held, expired or not.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Check if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl WindowStore for MemoryWindowStore {
    async fn admit(&self, admission: WindowAdmission<'_>) -> StoreResult<u64> {
        let now = self.clock.now();
        let mut set = self.sets.entry(admission.key.to_owned()).or_default();

        if set.is_expired(now) {
            set.members.clear();
        }
        set.remove_below(admission.min_score);
        let before = set.members.len() as u64;
        for member in admission.members {
            set.members.insert((admission.score, member.clone()));
        }
        set.expires_at = now.checked_add(admission.ttl);

        Ok(before)
    }

    async fn remove(&self, key: &str, members: &[String]) -> StoreResult<()> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.members.retain(|(_, member)| !members.contains(member));
        }
        Ok(())
    }

    async fn cardinality(&self, key: &str) -> StoreResult<u64> {
        let now = self.clock.now();
        Ok(self
            .sets
            .get(key)
            .filter(|set| !set.is_expired(now))
            .map_or(0, |set| set.members.len() as u64))
    }
}
