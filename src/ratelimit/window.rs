//! Per-identifier window state.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::identifier::Identifier;

/// Counting and timing state for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Requests admitted in the current window (or in total, when the
    /// window never resets on its own)
    pub count: u32,
    /// When the current window expires; `None` if the count never resets
    pub window_reset_at: Option<DateTime<Utc>>,
    /// When the most recent request was admitted
    pub last_request_at: DateTime<Utc>,
}

impl WindowEntry {
    /// State after the first admitted request of a new window.
    pub fn first(now: DateTime<Utc>, window_reset_at: Option<DateTime<Utc>>) -> Self {
        Self {
            count: 1,
            window_reset_at,
            last_request_at: now,
        }
    }

    /// Whether the window has run out at `now`.
    pub fn window_expired(&self, now: DateTime<Utc>) -> bool {
        self.window_reset_at.is_some_and(|reset_at| now >= reset_at)
    }

    /// Time since the last admitted request.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_request_at
    }
}

/// Window state for every tracked identifier.
///
/// Backed by a sharded concurrent map. [`WindowStore::update`] holds the
/// identifier's shard lock for the whole read-modify-write, so two
/// concurrent evaluations for one identifier never both act on a stale
/// count.
#[derive(Debug, Default)]
pub struct WindowStore {
    entries: DashMap<Identifier, WindowEntry>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Identifier) -> Option<WindowEntry> {
        self.entries.get(id).map(|entry| *entry)
    }

    pub fn insert(&self, id: Identifier, entry: WindowEntry) {
        self.entries.insert(id, entry);
    }

    /// Remove an entry, returning whether one existed.
    pub fn remove(&self, id: &Identifier) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Atomically inspect and replace the entry for `id`.
    ///
    /// `f` sees the current entry (if any) and returns the entry to store
    /// alongside its result. Returning `None` leaves the store untouched.
    pub fn update<R, F>(&self, id: &Identifier, f: F) -> R
    where
        F: FnOnce(Option<&WindowEntry>) -> (Option<WindowEntry>, R),
    {
        match self.entries.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let (next, result) = f(Some(occupied.get()));
                if let Some(next) = next {
                    occupied.insert(next);
                }
                result
            }
            Entry::Vacant(vacant) => {
                let (next, result) = f(None);
                if let Some(next) = next {
                    vacant.insert(next);
                }
                result
            }
        }
    }

    /// Keep only entries for which `keep` returns true. Returns how many
    /// entries were dropped.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&Identifier, &WindowEntry) -> bool,
    {
        let mut removed = 0;
        self.entries.retain(|id, entry| {
            let kept = keep(id, entry);
            if !kept {
                removed += 1;
            }
            kept
        });
        removed
    }

    /// Copy of every entry, in no particular order.
    pub fn snapshot(&self) -> Vec<(Identifier, WindowEntry)> {
        self.entries
            .iter()
            .map(|item| (item.key().clone(), *item.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
