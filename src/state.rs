//! Published tracker state.
//!
//! The tracker is the only writer. Readers get clones through a
//! `tokio::sync::watch` channel and never see a half-applied update of a
//! single field, though two fields may lag each other between publishes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::watch;

use crate::cache::EntityId;

/// Externally observable snapshot of a tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
  /// Count for every entity ever passed to `load`
  pub counts: BTreeMap<EntityId, u64>,
  pub is_loading: bool,
  pub has_active_transitions: bool,
  /// Wall-clock time of the last successful fetch
  pub last_refresh: Option<DateTime<Utc>>,
  /// Message of the most recent failed fetch, cleared on success
  pub last_error: Option<String>,
}

impl Snapshot {
  pub fn count(&self, id: &str) -> Option<u64> {
    self.counts.get(id).copied()
  }
}

/// Owns the snapshot and hands out read-only subscriptions.
#[derive(Debug)]
pub struct StatePublisher {
  tx: watch::Sender<Snapshot>,
  /// Number of fetches currently in flight
  in_flight: usize,
}

impl StatePublisher {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(Snapshot::default());
    Self { tx, in_flight: 0 }
  }

  /// Clone of the current snapshot.
  pub fn snapshot(&self) -> Snapshot {
    self.tx.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
    self.tx.subscribe()
  }

  /// Merge counts into the snapshot. Returns whether anything changed.
  pub fn publish_counts(&self, counts: impl IntoIterator<Item = (EntityId, u64)>) -> bool {
    self.tx.send_if_modified(|snapshot| {
      let mut changed = false;
      for (id, count) in counts {
        if snapshot.counts.insert(id, count) != Some(count) {
          changed = true;
        }
      }
      changed
    })
  }

  /// Mark a fetch as started.
  pub fn fetch_started(&mut self) {
    self.in_flight += 1;
    self.tx.send_if_modified(|snapshot| {
      let was_loading = snapshot.is_loading;
      snapshot.is_loading = true;
      !was_loading
    });
  }

  /// Publish the merged result of a successful fetch.
  pub fn fetch_succeeded(
    &mut self,
    counts: impl IntoIterator<Item = (EntityId, u64)>,
    has_active_transitions: bool,
  ) {
    self.in_flight = self.in_flight.saturating_sub(1);
    let loading = self.in_flight > 0;
    self.tx.send_modify(|snapshot| {
      snapshot.counts.extend(counts);
      snapshot.is_loading = loading;
      snapshot.has_active_transitions = has_active_transitions;
      snapshot.last_refresh = Some(Utc::now());
      snapshot.last_error = None;
    });
  }

  /// Publish the zero-filled result of a failed fetch.
  pub fn fetch_failed(
    &mut self,
    counts: impl IntoIterator<Item = (EntityId, u64)>,
    error: String,
  ) {
    self.in_flight = self.in_flight.saturating_sub(1);
    let loading = self.in_flight > 0;
    self.tx.send_modify(|snapshot| {
      snapshot.counts.extend(counts);
      snapshot.is_loading = loading;
      snapshot.has_active_transitions = false;
      snapshot.last_error = Some(error);
    });
  }

  /// Settle a fetch whose load was dropped before it completed.
  pub fn fetch_abandoned(&mut self) {
    self.in_flight = self.in_flight.saturating_sub(1);
    let loading = self.in_flight > 0;
    self.tx.send_if_modified(|snapshot| {
      let changed = snapshot.is_loading != loading;
      snapshot.is_loading = loading;
      changed
    });
  }

  /// Set the transition flag without touching anything else.
  pub fn set_active_transitions(&self, active: bool) {
    self.tx.send_if_modified(|snapshot| {
      let changed = snapshot.has_active_transitions != active;
      snapshot.has_active_transitions = active;
      changed
    });
  }
}

impl Default for StatePublisher {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn counts(pairs: &[(&str, u64)]) -> Vec<(EntityId, u64)> {
    pairs.iter().map(|(id, c)| (id.to_string(), *c)).collect()
  }

  #[test]
  fn test_loading_flag_tracks_overlapping_fetches() {
    let mut publisher = StatePublisher::new();
    publisher.fetch_started();
    publisher.fetch_started();
    assert!(publisher.snapshot().is_loading);

    publisher.fetch_succeeded(counts(&[("a", 1)]), false);
    assert!(publisher.snapshot().is_loading);

    publisher.fetch_failed(counts(&[("b", 0)]), "boom".to_string());
    let snapshot = publisher.snapshot();
    assert!(!snapshot.is_loading);
    assert_eq!(snapshot.count("a"), Some(1));
    assert_eq!(snapshot.count("b"), Some(0));
    assert_eq!(snapshot.last_error.as_deref(), Some("boom"));
  }

  #[test]
  fn test_abandoned_fetch_clears_loading() {
    let mut publisher = StatePublisher::new();
    publisher.fetch_started();
    publisher.fetch_started();

    publisher.fetch_abandoned();
    assert!(publisher.snapshot().is_loading);

    publisher.fetch_abandoned();
    let snapshot = publisher.snapshot();
    assert!(!snapshot.is_loading);
    assert!(snapshot.last_error.is_none());
    assert!(snapshot.counts.is_empty());
  }

  #[test]
  fn test_success_clears_error_and_stamps_refresh() {
    let mut publisher = StatePublisher::new();
    publisher.fetch_started();
    publisher.fetch_failed(counts(&[("a", 0)]), "down".to_string());
    assert!(publisher.snapshot().last_refresh.is_none());

    publisher.fetch_started();
    publisher.fetch_succeeded(counts(&[("a", 4)]), true);
    let snapshot = publisher.snapshot();
    assert!(snapshot.last_error.is_none());
    assert!(snapshot.last_refresh.is_some());
    assert!(snapshot.has_active_transitions);
  }

  #[tokio::test]
  async fn test_subscribers_see_published_counts() {
    let publisher = StatePublisher::new();
    let mut rx = publisher.subscribe();

    assert!(publisher.publish_counts(counts(&[("a", 2)])));
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow().count("a"), Some(2));

    // Republishing identical values does not notify
    assert!(!publisher.publish_counts(counts(&[("a", 2)])));
  }
}
