//! Scripted `CountSource` for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{AuthContext, CountRecord, CountSource, EntityId};

#[derive(Default)]
struct StubState {
  records: HashMap<EntityId, CountRecord>,
  extra: Vec<CountRecord>,
  delays: VecDeque<Duration>,
  calls: Vec<BTreeSet<EntityId>>,
  last_auth: Option<AuthContext>,
  last_namespace: Option<String>,
}

/// Answers from an in-memory table and records every call.
///
/// Rows are captured when the fetch is issued; queued delays are applied
/// afterwards, one per call.
#[derive(Clone, Default)]
pub(crate) struct StubSource {
  state: Arc<Mutex<StubState>>,
  failing: Arc<AtomicBool>,
}

impl StubSource {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_count(&self, id: &str, count: u64) {
    self.set_record(CountRecord::new(id, count));
  }

  pub fn set_record(&self, record: CountRecord) {
    let mut state = self.state.lock().unwrap();
    state.records.insert(record.entity_id.clone(), record);
  }

  /// Return this row on every call, requested or not.
  pub fn always_return(&self, record: CountRecord) {
    self.state.lock().unwrap().extra.push(record);
  }

  pub fn push_delay(&self, delay: Duration) {
    self.state.lock().unwrap().delays.push_back(delay);
  }

  pub fn set_failing(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.state.lock().unwrap().calls.len()
  }

  /// Ids requested by the `n`th call.
  pub fn requested(&self, n: usize) -> BTreeSet<EntityId> {
    self.state.lock().unwrap().calls[n].clone()
  }

  pub fn last_auth(&self) -> Option<AuthContext> {
    self.state.lock().unwrap().last_auth.clone()
  }

  pub fn last_namespace(&self) -> Option<String> {
    self.state.lock().unwrap().last_namespace.clone()
  }
}

impl CountSource for StubSource {
  async fn fetch_counts(
    &self,
    ids: &BTreeSet<EntityId>,
    namespace: &str,
    auth: &AuthContext,
  ) -> Result<Vec<CountRecord>> {
    let (rows, delay) = {
      let mut state = self.state.lock().unwrap();
      state.calls.push(ids.clone());
      state.last_auth = Some(auth.clone());
      state.last_namespace = Some(namespace.to_string());

      let mut rows: Vec<CountRecord> = ids
        .iter()
        .filter_map(|id| state.records.get(id).cloned())
        .collect();
      rows.extend(state.extra.iter().cloned());
      (rows, state.delays.pop_front())
    };
    let failing = self.failing.load(Ordering::SeqCst);

    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if failing {
      return Err(eyre!("source unavailable"));
    }
    Ok(rows)
  }
}
