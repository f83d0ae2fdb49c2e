use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
  /// The batched lookup did not complete. Timeouts, transport errors and
  /// malformed responses all end up here.
  #[error("Failed to fetch {requested} counts for {namespace}: {reason}")]
  FetchFailed {
    namespace: String,
    requested: usize,
    reason: String,
  },
}
