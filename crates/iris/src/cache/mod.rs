// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session runtime view of streamed replies.
//!
//! The cache is not persisted; it lives as long as the session is in
//! memory. Entries are kept in insertion order and never evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

pub mod entry;

pub use entry::{CacheEntry, EntryKind, EntryStatus};

/// Aggregate counters for one session's cache, as shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub spawn: usize,
    pub tell: usize,
    pub active: usize,
    pub completed: usize,
}

/// Map of entry id → entry for one session, in insertion order.
pub struct MessageCache {
    session_id: String,
    /// Identity of this runtime view, persisted as
    /// `current_cache_session_id` while the session is live.
    instance_id: String,
    next_id: AtomicU64,
    entries: Mutex<IndexMap<u64, Arc<CacheEntry>>>,
}

impl MessageCache {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            next_id: AtomicU64::new(1),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Create and register a new ACTIVE entry with the next monotonic id.
    pub fn start_entry(&self, kind: EntryKind, tell_string: impl Into<String>) -> Arc<CacheEntry> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(CacheEntry::new(id, kind, tell_string));
        self.entries.lock().insert(id, entry.clone());
        entry
    }

    pub fn by_id(&self, id: u64) -> Option<Arc<CacheEntry>> {
        self.entries.lock().get(&id).cloned()
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> Vec<Arc<CacheEntry>> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        let mut stats =
            CacheStats { total: entries.len(), spawn: 0, tell: 0, active: 0, completed: 0 };
        for entry in entries.values() {
            match entry.kind() {
                EntryKind::Spawn => stats.spawn += 1,
                EntryKind::Tell => stats.tell += 1,
            }
            match entry.status() {
                EntryStatus::Active => stats.active += 1,
                EntryStatus::Completed => stats.completed += 1,
                _ => {}
            }
        }
        stats
    }
}

/// Runtime registry of session id → live cache.
///
/// Shared by the orchestrator (lookup) and handed to transports entry by
/// entry; dropping a session's cache discards its runtime view only.
#[derive(Default)]
pub struct CacheRegistry {
    inner: Mutex<HashMap<String, Arc<MessageCache>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live cache for a session, creating one on first use.
    /// The boolean is `true` when the cache was created by this call.
    pub fn get_or_create(&self, session_id: &str) -> (Arc<MessageCache>, bool) {
        let mut inner = self.inner.lock();
        if let Some(cache) = inner.get(session_id) {
            return (cache.clone(), false);
        }
        let cache = Arc::new(MessageCache::new(session_id));
        inner.insert(session_id.to_owned(), cache.clone());
        (cache, true)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<MessageCache>> {
        self.inner.lock().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<MessageCache>> {
        self.inner.lock().remove(session_id)
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
