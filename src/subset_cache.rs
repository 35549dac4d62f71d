//! Subset Cache (`spec.md` §4.5): tracks which record ids are currently
//! "active" — visible to at least one loaded subset — while the Sync
//! Engine runs in on-demand mode. The Sync Engine consults this before
//! forwarding a LIVE insert/update so the host never sees a row for a
//! subset it never asked to load.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::identifier::RecordId;

#[derive(Default)]
struct Inner {
    subsets: HashMap<String, HashSet<RecordId>>,
    active: HashSet<RecordId>,
}

impl Inner {
    fn recompute_active(&mut self) {
        self.active = self.subsets.values().flatten().cloned().collect();
    }
}

/// Keyed by [`crate::table::query::Subset::canonical_key`].
#[derive(Default)]
pub struct SubsetCache {
    inner: Mutex<Inner>,
}

impl SubsetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or replaces) the ids loaded by `subset_key`'s last
    /// hydration, then recomputes the union `active` set.
    pub fn load(&self, subset_key: String, ids: impl IntoIterator<Item = RecordId>) {
        let mut inner = self.inner.lock();
        inner.subsets.insert(subset_key, ids.into_iter().collect());
        inner.recompute_active();
    }

    /// Drops a subset entirely. Returns `true` if no subsets remain
    /// loaded afterward — the signal the Sync Engine uses to close LIVE
    /// handles (`spec.md` §4.5).
    pub fn unload(&self, subset_key: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.subsets.remove(subset_key);
        inner.recompute_active();
        inner.subsets.is_empty()
    }

    pub fn is_active(&self, id: &RecordId) -> bool {
        self.inner.lock().active.contains(id)
    }

    /// A DELETE event removes the id from every loaded subset, whether
    /// or not it was active (`spec.md` §4.5 — deletes are unconditional).
    pub fn remove_everywhere(&self, id: &RecordId) {
        let mut inner = self.inner.lock();
        for set in inner.subsets.values_mut() {
            set.remove(id);
        }
        inner.recompute_active();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().subsets.is_empty()
    }
}
