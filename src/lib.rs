//! Per-entity count tracking backed by an expensive batched lookup.
//!
//! A [`MetricTracker`] caches one count per entity with a TTL, fetches
//! everything stale in a single call to a [`CountSource`], and publishes the
//! result as a [`Snapshot`]. A [`RefreshScheduler`] keeps polling only while
//! some tracked entity reports transitions in progress.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod source;
pub mod state;

pub use cache::{
  AuthContext, CountRecord, CountSource, EntityId, LoadSource, MetricTracker, TransitionSummary,
};
pub use config::TrackerConfig;
pub use error::TrackerError;
pub use scheduler::RefreshScheduler;
pub use state::Snapshot;
