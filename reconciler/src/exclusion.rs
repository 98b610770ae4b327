//! Exclusion ledger
//!
//! The only diff the operator produces: per handle, the set of service IDs
//! removed from the settlement. Membership is scoped strictly per handle, so
//! the same numeric ID under two handles is two independent entries.
//! Operations are synchronous and never touch the network.

use crate::types::{CacheHandle, ServiceId};
use std::collections::{BTreeSet, HashMap};

/// Per-handle excluded service IDs
#[derive(Debug, Default, Clone)]
pub struct ExclusionLedger {
    excluded: HashMap<CacheHandle, BTreeSet<ServiceId>>,
}

impl ExclusionLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Add IDs to a handle's excluded set. Returns how many were new.
    pub fn exclude(
        &mut self,
        handle: &CacheHandle,
        ids: impl IntoIterator<Item = ServiceId>,
    ) -> usize {
        let set = self.excluded.entry(handle.clone()).or_default();
        ids.into_iter().filter(|id| set.insert(*id)).count()
    }

    /// Remove one ID from a handle's excluded set. Returns whether it was present.
    pub fn reinclude(&mut self, handle: &CacheHandle, id: ServiceId) -> bool {
        let Some(set) = self.excluded.get_mut(handle) else {
            return false;
        };

        let removed = set.remove(&id);
        if set.is_empty() {
            self.excluded.remove(handle);
        }
        removed
    }

    /// Flip one ID. Returns `true` when the ID ends up excluded.
    pub fn toggle(&mut self, handle: &CacheHandle, id: ServiceId) -> bool {
        if self.is_excluded(handle, id) {
            self.reinclude(handle, id);
            false
        } else {
            self.exclude(handle, [id]);
            true
        }
    }

    /// Re-include everything under a handle. Returns how many were removed.
    pub fn clear(&mut self, handle: &CacheHandle) -> usize {
        self.excluded.remove(handle).map_or(0, |set| set.len())
    }

    /// Whether an ID is excluded under a handle
    pub fn is_excluded(&self, handle: &CacheHandle, id: ServiceId) -> bool {
        self.excluded
            .get(handle)
            .is_some_and(|set| set.contains(&id))
    }

    /// Excluded IDs under a handle, ascending
    pub fn excluded_ids(&self, handle: &CacheHandle) -> BTreeSet<ServiceId> {
        self.excluded.get(handle).cloned().unwrap_or_default()
    }

    /// Number of excluded IDs under a handle
    pub fn excluded_count(&self, handle: &CacheHandle) -> usize {
        self.excluded.get(handle).map_or(0, BTreeSet::len)
    }

    /// Union of excluded IDs across every handle, ascending and deduplicated
    pub fn union_all(&self) -> Vec<ServiceId> {
        self.excluded
            .values()
            .flat_map(|set| set.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
