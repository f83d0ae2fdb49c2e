//! Core traits and types for the count cache.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;

/// Opaque identifier of a domain entity, unique within a namespace.
pub type EntityId = String;

/// Credentials forwarded unmodified to the count source.
///
/// The tracker never looks inside; only transports serialize it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthContext(serde_json::Value);

impl AuthContext {
  pub fn new(value: serde_json::Value) -> Self {
    Self(value)
  }

  pub fn as_value(&self) -> &serde_json::Value {
    &self.0
  }
}

/// Breakdown of background state changes for the items behind one count
/// (e.g. documents waiting for or undergoing compression).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionSummary {
  #[serde(default)]
  pub pending: u64,
  #[serde(default)]
  pub in_progress: u64,
  #[serde(default)]
  pub completed: u64,
  #[serde(default)]
  pub failed: u64,
  #[serde(default)]
  pub skipped: u64,
}

impl TransitionSummary {
  /// Whether anything is still waiting or in progress.
  pub fn is_active(&self) -> bool {
    self.pending + self.in_progress > 0
  }
}

/// One row returned by a count source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountRecord {
  pub entity_id: EntityId,
  pub count: u64,
  pub transitions: Option<TransitionSummary>,
}

impl CountRecord {
  pub fn new(entity_id: impl Into<EntityId>, count: u64) -> Self {
    Self {
      entity_id: entity_id.into(),
      count,
      transitions: None,
    }
  }

  pub fn with_transitions(mut self, transitions: TransitionSummary) -> Self {
    self.transitions = Some(transitions);
    self
  }
}

/// Batched lookup of counts for many entities at once.
///
/// This is the tracker's only I/O dependency. Any transport works as long as
/// it resolves a whole batch in one call; ids with no data may be omitted
/// from the result.
pub trait CountSource: Send + Sync + 'static {
  fn fetch_counts(
    &self,
    ids: &BTreeSet<EntityId>,
    namespace: &str,
    auth: &AuthContext,
  ) -> impl Future<Output = Result<Vec<CountRecord>>> + Send;
}

/// Where the values of a successful load came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
  /// Every requested id was fresh in the cache
  Cache,
  /// At least one id was fetched from the source
  Network,
}
