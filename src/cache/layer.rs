//! Tracker that orchestrates count caching with batched fetching.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::storage::{CountStore, IssueStamp};
use super::traits::{AuthContext, CountSource, EntityId, LoadSource};
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::state::{Snapshot, StatePublisher};

/// Which entries a load treats as needing a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshRule {
  /// Absent or older than the cache timeout
  Expired,
  /// Expired, or still reporting transitions in progress
  ExpiredOrTransitioning,
}

/// Everything the tracker mutates. Only touched with the lock held, and the
/// lock is never held across an await.
struct Inner {
  store: CountStore,
  state: StatePublisher,
  next_seq: u64,
}

/// Settles the loading counter when a load is dropped mid-fetch, e.g. under
/// `tokio::time::timeout` or a losing `select!` branch.
struct InFlight<'a> {
  inner: &'a Mutex<Inner>,
  settled: bool,
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    if !self.settled {
      let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
      inner.state.fetch_abandoned();
    }
  }
}

/// Count tracker for one namespace.
///
/// Sits between consumers and a `CountSource`: fresh counts are served from
/// memory, stale ones are resolved in a single batched call, and every
/// outcome is published as a `Snapshot`. Construct one per namespace and
/// share it behind an `Arc`.
pub struct MetricTracker<S: CountSource> {
  config: TrackerConfig,
  source: S,
  inner: Mutex<Inner>,
  snapshot: watch::Receiver<Snapshot>,
}

impl<S: CountSource> MetricTracker<S> {
  pub fn new(config: TrackerConfig, source: S) -> Self {
    let state = StatePublisher::new();
    let snapshot = state.subscribe();

    Self {
      inner: Mutex::new(Inner {
        store: CountStore::new(config.cache_timeout()),
        state,
        next_seq: 0,
      }),
      config,
      source,
      snapshot,
    }
  }

  pub fn config(&self) -> &TrackerConfig {
    &self.config
  }

  // The guarded state is consistent after every statement, so a panic in
  // another holder leaves nothing half-written.
  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Load counts for `ids`, serving fresh ones from cache and fetching the
  /// rest in one batch.
  ///
  /// With `delay` set, waits the configured settle delay before reading the
  /// source so a just-finished upstream write is visible.
  ///
  /// A failed fetch never leaves the snapshot without an entry: the stale ids
  /// are published as zero and `FetchFailed` is returned for callers that
  /// need to tell "none" from "unknown".
  pub async fn load<I, T>(
    &self,
    ids: I,
    auth: &AuthContext,
    delay: bool,
  ) -> Result<LoadSource, TrackerError>
  where
    I: IntoIterator<Item = T>,
    T: Into<EntityId>,
  {
    let ids: BTreeSet<EntityId> = ids.into_iter().map(Into::into).collect();
    self.load_set(ids, auth, delay, RefreshRule::Expired).await
  }

  /// Reload `ids`, also refetching entries whose transitions are still in
  /// progress even if their TTL has not expired. Used by the refresh
  /// scheduler.
  pub async fn refresh_transitioning<I, T>(
    &self,
    ids: I,
    auth: &AuthContext,
  ) -> Result<LoadSource, TrackerError>
  where
    I: IntoIterator<Item = T>,
    T: Into<EntityId>,
  {
    let ids: BTreeSet<EntityId> = ids.into_iter().map(Into::into).collect();
    self
      .load_set(ids, auth, false, RefreshRule::ExpiredOrTransitioning)
      .await
  }

  /// Drop every cached count, then load `ids`.
  ///
  /// The cache is cleared when this is called, not when the returned future
  /// is first polled.
  pub fn force_refresh<'a, I, T>(
    &'a self,
    ids: I,
    auth: &'a AuthContext,
  ) -> impl std::future::Future<Output = Result<LoadSource, TrackerError>> + Send + 'a
  where
    I: IntoIterator<Item = T>,
    T: Into<EntityId>,
  {
    let ids: BTreeSet<EntityId> = ids.into_iter().map(Into::into).collect();
    self.clear();
    self.load_set(ids, auth, false, RefreshRule::Expired)
  }

  /// Remove every cached count.
  ///
  /// Published counts are kept. Results of fetches issued before this call
  /// are discarded when they arrive.
  pub fn clear(&self) {
    let mut inner = self.lock();
    let next_seq = inner.next_seq;
    inner.store.clear(next_seq);
    inner.state.set_active_transitions(false);
    debug!(namespace = self.config.namespace(), "Cleared count cache");
  }

  /// Cached count for `id`, only if it is still fresh.
  pub fn get_cached(&self, id: &str) -> Option<u64> {
    self.lock().store.fresh_value(id)
  }

  /// Clone of the current published state.
  pub fn snapshot(&self) -> Snapshot {
    self.snapshot.borrow().clone()
  }

  /// Receiver that is notified on every publish.
  pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
    self.snapshot.clone()
  }

  pub fn has_active_transitions(&self) -> bool {
    self.snapshot.borrow().has_active_transitions
  }

  /// Every id ever passed to a load.
  pub fn tracked_ids(&self) -> Vec<EntityId> {
    self.snapshot.borrow().counts.keys().cloned().collect()
  }

  async fn load_set(
    &self,
    ids: BTreeSet<EntityId>,
    auth: &AuthContext,
    delay: bool,
    rule: RefreshRule,
  ) -> Result<LoadSource, TrackerError> {
    if ids.is_empty() {
      return Ok(LoadSource::Cache);
    }

    let namespace = self.config.namespace();

    // Partition and publish cache hits without waiting for the network
    let stale = {
      let inner = self.lock();
      let now = Instant::now();
      let (stale, hits): (BTreeSet<_>, BTreeSet<_>) =
        ids.iter().cloned().partition(|id| match rule {
          RefreshRule::Expired => inner.store.is_stale_at(id, now),
          RefreshRule::ExpiredOrTransitioning => inner.store.needs_refresh_at(id, now),
        });

      inner.state.publish_counts(
        hits
          .iter()
          .filter_map(|id| inner.store.get(id).map(|e| (id.clone(), e.value))),
      );

      if self.config.verbose() {
        debug!(
          namespace,
          requested = ids.len(),
          hits = hits.len(),
          stale = stale.len(),
          "Partitioned count load"
        );
      }
      stale
    };

    if stale.is_empty() {
      return Ok(LoadSource::Cache);
    }

    if delay {
      tokio::time::sleep(self.config.settle_delay()).await;
    }

    let stamp = {
      let mut inner = self.lock();
      let seq = inner.next_seq;
      inner.next_seq += 1;
      inner.state.fetch_started();
      IssueStamp {
        seq,
        at: Instant::now(),
      }
    };
    let mut in_flight = InFlight {
      inner: &self.inner,
      settled: false,
    };

    let result = self.source.fetch_counts(&stale, namespace, auth).await;

    let mut inner = self.lock();
    // Both arms below settle the fetch without suspending
    in_flight.settled = true;
    match result {
      Ok(records) => {
        let received = records.len();
        let mut returned = HashSet::with_capacity(received);
        let mut fetched = Vec::with_capacity(stale.len());

        for record in records {
          if !stale.contains(&record.entity_id) {
            debug!(
              namespace,
              entity_id = %record.entity_id,
              "Ignoring count for entity that was not requested"
            );
            continue;
          }
          let transitions = if self.config.track_transitions() {
            record.transitions
          } else {
            None
          };
          inner
            .store
            .put(&record.entity_id, record.count, transitions, stamp);
          fetched.push((record.entity_id.clone(), record.count));
          returned.insert(record.entity_id);
        }

        // No row means no data, which is a real zero
        for id in stale.iter().filter(|id| !returned.contains(*id)) {
          inner.store.put(id, 0, None, stamp);
          fetched.push((id.clone(), 0));
        }

        let counts = resolve_published(&inner.store, fetched);
        let transitioning =
          self.config.track_transitions() && inner.store.has_active_transitions();
        inner.state.fetch_succeeded(counts, transitioning);

        if self.config.verbose() {
          debug!(
            namespace,
            seq = stamp.seq,
            received,
            zero_filled = stale.len() - returned.len(),
            transitioning,
            "Merged fetched counts"
          );
        }
        info!(namespace, fetched = stale.len(), "Refreshed counts");
        Ok(LoadSource::Network)
      }
      Err(e) => {
        let reason = format!("{:#}", e);
        let mut zeroed = Vec::with_capacity(stale.len());
        for id in &stale {
          inner.store.put(id, 0, None, stamp);
          zeroed.push((id.clone(), 0));
        }

        let counts = resolve_published(&inner.store, zeroed);
        inner.state.fetch_failed(counts, reason.clone());

        warn!(
          namespace,
          requested = stale.len(),
          error = %reason,
          "Count fetch failed, publishing zeros"
        );
        Err(TrackerError::FetchFailed {
          namespace: namespace.to_string(),
          requested: stale.len(),
          reason,
        })
      }
    }
  }
}

/// Values to publish for a fetch result.
///
/// The store wins whenever it holds the id, since it only keeps the result of
/// the most recently issued fetch. The fetch's own value is used only when
/// the store has nothing, i.e. the cache was cleared while it was in flight.
fn resolve_published(
  store: &CountStore,
  fetched: Vec<(EntityId, u64)>,
) -> Vec<(EntityId, u64)> {
  fetched
    .into_iter()
    .map(|(id, value)| {
      let value = store.get(&id).map_or(value, |e| e.value);
      (id, value)
    })
    .collect()
}
