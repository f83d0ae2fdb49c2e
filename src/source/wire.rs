//! Serde types matching the count endpoint's JSON.
//!
//! These are kept apart from the cache types so the endpoint's field names
//! and signed counts don't leak into the tracker.

use serde::{Deserialize, Serialize};

use crate::cache::{AuthContext, CountRecord, EntityId, TransitionSummary};

#[derive(Debug, Serialize)]
pub struct CountRequest<'a> {
  pub related_entity_ids: Vec<&'a str>,
  pub related_table: &'a str,
  pub auth: &'a AuthContext,
}

#[derive(Debug, Deserialize)]
pub struct CountResponseRow {
  pub entity_id: EntityId,
  pub document_count: i64,
  #[serde(default)]
  pub transitions: Option<TransitionSummary>,
}

impl CountResponseRow {
  /// Convert to a cache record. Negative counts become zero.
  pub fn into_record(self) -> CountRecord {
    CountRecord {
      entity_id: self.entity_id,
      count: u64::try_from(self.document_count).unwrap_or(0),
      transitions: self.transitions,
    }
  }
}

pub fn decode_rows(body: &[u8]) -> serde_json::Result<Vec<CountRecord>> {
  let rows: Vec<CountResponseRow> = serde_json::from_slice(body)?;
  Ok(rows.into_iter().map(CountResponseRow::into_record).collect())
}
