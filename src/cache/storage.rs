//! In-memory count storage with TTL staleness and last-issued-wins writes.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::traits::{EntityId, TransitionSummary};

/// Identifies the fetch that produced a value.
///
/// Taken when the fetch is issued, before the tracker suspends on the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueStamp {
  pub seq: u64,
  pub at: Instant,
}

/// A single cached count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub value: u64,
  /// When the fetch that produced this value was issued
  pub fetched_at: Instant,
  /// Only populated when the tracker collects transitions
  pub transitions: Option<TransitionSummary>,
  issue_seq: u64,
}

impl CacheEntry {
  fn has_active_transitions(&self) -> bool {
    self.transitions.is_some_and(|t| t.is_active())
  }
}

/// Count storage for one tracker.
///
/// Staleness is evaluated on every read against the configured timeout,
/// never stored. Writes carry the stamp of the fetch that produced them and
/// are rejected when a later-issued fetch already wrote the same id, or when
/// the fetch was issued before the last `clear`.
#[derive(Debug)]
pub struct CountStore {
  entries: HashMap<EntityId, CacheEntry>,
  cache_timeout: Duration,
  /// Stamps with a lower sequence were issued before the last clear
  floor: u64,
}

impl CountStore {
  pub fn new(cache_timeout: Duration) -> Self {
    Self {
      entries: HashMap::new(),
      cache_timeout,
      floor: 0,
    }
  }

  /// Get an entry regardless of staleness.
  pub fn get(&self, id: &str) -> Option<&CacheEntry> {
    self.entries.get(id)
  }

  /// True if the entry is absent or older than the cache timeout.
  pub fn is_stale(&self, id: &str) -> bool {
    self.is_stale_at(id, Instant::now())
  }

  pub fn is_stale_at(&self, id: &str, now: Instant) -> bool {
    match self.entries.get(id) {
      Some(entry) => now.saturating_duration_since(entry.fetched_at) > self.cache_timeout,
      None => true,
    }
  }

  /// Like `is_stale_at`, but also treats entries with transitions still in
  /// progress as stale.
  pub fn needs_refresh_at(&self, id: &str, now: Instant) -> bool {
    self.is_stale_at(id, now) || self.entries.get(id).is_some_and(|e| e.has_active_transitions())
  }

  /// Get the value only if it is fresh.
  pub fn fresh_value(&self, id: &str) -> Option<u64> {
    if self.is_stale(id) {
      return None;
    }
    self.entries.get(id).map(|e| e.value)
  }

  /// Insert or overwrite an entry.
  ///
  /// Returns false when the write was dropped because a later-issued fetch
  /// already wrote this id or the store was cleared after `stamp` was taken.
  pub fn put(
    &mut self,
    id: &str,
    value: u64,
    transitions: Option<TransitionSummary>,
    stamp: IssueStamp,
  ) -> bool {
    if stamp.seq < self.floor {
      return false;
    }
    if let Some(existing) = self.entries.get(id) {
      if existing.issue_seq > stamp.seq {
        return false;
      }
    }

    self.entries.insert(
      id.to_string(),
      CacheEntry {
        value,
        fetched_at: stamp.at,
        transitions,
        issue_seq: stamp.seq,
      },
    );
    true
  }

  /// Remove every entry and reject writes from fetches issued before
  /// `next_seq`.
  pub fn clear(&mut self, next_seq: u64) {
    self.entries.clear();
    self.floor = self.floor.max(next_seq);
  }

  /// Whether any stored entry reports transitions in progress.
  pub fn has_active_transitions(&self) -> bool {
    self.entries.values().any(CacheEntry::has_active_transitions)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
