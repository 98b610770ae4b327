//! Page cache
//!
//! Holds fetched pages of provided services keyed by (handle, page index).
//! A page, once fetched, is immutable truth for its handle: exclusion state
//! is never written into cached rows, so totals can always be re-derived
//! without double-applying an exclusion.
//!
//! One cache belongs to exactly one draft. Fetch results carry the draft they
//! were issued for and are dropped by [`PageCache::accept`] when they do not
//! match, which keeps late responses for a discarded draft out of the active
//! one.

use crate::types::{CacheHandle, ProvidedServiceRow, ServiceId};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

/// Cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    /// Cache handle
    pub handle: CacheHandle,
    /// Zero-based page index
    pub page_index: u32,
}

impl PageKey {
    /// Create new key
    pub fn new(handle: CacheHandle, page_index: u32) -> Self {
        Self { handle, page_index }
    }
}

impl std::fmt::Display for PageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.handle, self.page_index)
    }
}

/// A page as delivered by a fetch, tagged with the draft that issued it
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Draft the fetch was issued for
    pub draft_id: Uuid,
    /// Cache handle
    pub handle: CacheHandle,
    /// Zero-based page index
    pub page_index: u32,
    /// Rows in server order
    pub rows: Vec<ProvidedServiceRow>,
}

/// Cache counters
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that needed a fetch
    pub misses: u64,
    /// Pages written
    pub puts: u64,
    /// Fetch results dropped as stale
    pub stale_dropped: u64,
}

impl CacheMetrics {
    /// Hit rate in percent
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64) / (total as f64) * 100.0
        }
    }
}

/// Per-draft page cache
#[derive(Debug)]
pub struct PageCache {
    draft_id: Uuid,
    handles: HashSet<CacheHandle>,
    pages: HashMap<PageKey, Vec<ProvidedServiceRow>>,
    metrics: CacheMetrics,
}

impl PageCache {
    /// Create an empty cache for a draft and the handles it owns
    pub fn new(draft_id: Uuid, handles: impl IntoIterator<Item = CacheHandle>) -> Self {
        Self {
            draft_id,
            handles: handles.into_iter().collect(),
            pages: HashMap::new(),
            metrics: CacheMetrics::default(),
        }
    }

    /// Whether the handle belongs to this cache's draft
    pub fn tracks(&self, handle: &CacheHandle) -> bool {
        self.handles.contains(handle)
    }

    /// Read a page. Pure: no counters, no fetches.
    pub fn get(&self, handle: &CacheHandle, page_index: u32) -> Option<&[ProvidedServiceRow]> {
        self.pages
            .get(&PageKey::new(handle.clone(), page_index))
            .map(Vec::as_slice)
    }

    /// Read a page on behalf of a navigation, counting the hit or miss
    pub fn lookup(
        &mut self,
        handle: &CacheHandle,
        page_index: u32,
    ) -> Option<Vec<ProvidedServiceRow>> {
        match self.pages.get(&PageKey::new(handle.clone(), page_index)) {
            Some(rows) => {
                self.metrics.hits += 1;
                debug!("Cache hit for {}#{}", handle, page_index);
                Some(rows.clone())
            }
            None => {
                self.metrics.misses += 1;
                debug!("Cache miss for {}#{}", handle, page_index);
                None
            }
        }
    }

    /// Whether a page is cached
    pub fn contains(&self, handle: &CacheHandle, page_index: u32) -> bool {
        self.pages
            .contains_key(&PageKey::new(handle.clone(), page_index))
    }

    /// Store a page, replacing any previous copy
    pub fn put(&mut self, handle: CacheHandle, page_index: u32, mut rows: Vec<ProvidedServiceRow>) {
        for row in &mut rows {
            row.excluded = false;
        }
        self.pages.insert(PageKey::new(handle, page_index), rows);
        self.metrics.puts += 1;
    }

    /// Store a fetch result if it still belongs to this draft.
    ///
    /// Returns `false` (and stores nothing) for results issued by another
    /// draft or for handles this draft does not own.
    pub fn accept(&mut self, fetched: FetchedPage) -> bool {
        if fetched.draft_id != self.draft_id || !self.tracks(&fetched.handle) {
            self.metrics.stale_dropped += 1;
            warn!(
                "Dropping stale page {}#{} (issued for draft {}, active draft {})",
                fetched.handle, fetched.page_index, fetched.draft_id, self.draft_id
            );
            return false;
        }

        self.put(fetched.handle, fetched.page_index, fetched.rows);
        true
    }

    /// Number of cached pages for a handle
    pub fn fetched_pages(&self, handle: &CacheHandle) -> u32 {
        self.pages.keys().filter(|key| &key.handle == handle).count() as u32
    }

    /// Every cached row for a handle, page order not guaranteed
    pub fn rows_for<'a>(
        &'a self,
        handle: &'a CacheHandle,
    ) -> impl Iterator<Item = &'a ProvidedServiceRow> + 'a {
        self.pages
            .iter()
            .filter(move |(key, _)| &key.handle == handle)
            .flat_map(|(_, rows)| rows.iter())
    }

    /// Whether a row is present on any cached page of a handle
    pub fn contains_row(&self, handle: &CacheHandle, id: ServiceId) -> bool {
        self.rows_for(handle).any(|row| row.id == id)
    }

    /// Counters
    pub fn metrics(&self) -> CacheMetrics {
        self.metrics
    }
}
