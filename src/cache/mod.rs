//! Per-entity count caching backed by a batched source.
//!
//! This module provides the tracker that:
//! - Serves counts from memory while they are younger than the cache timeout
//! - Resolves everything stale in one batched call to a `CountSource`
//! - Zero-fills entities the source has no data for, and everything on failure
//! - Applies results in issue order, so a slow older fetch never overwrites a newer one

mod layer;
mod storage;
mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use layer::MetricTracker;
pub use storage::{CacheEntry, CountStore, IssueStamp};
pub use traits::{AuthContext, CountRecord, CountSource, EntityId, LoadSource, TransitionSummary};
