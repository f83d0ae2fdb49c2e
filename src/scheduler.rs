//! Background refresh while tracked counts are in flux.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{AuthContext, CountSource, EntityId, MetricTracker};

/// Periodically reloads a fixed set of ids, but only while the tracker's
/// published snapshot reports transitions in progress. Ticks are no-ops
/// otherwise, so an idle tracker makes no network calls.
pub struct RefreshScheduler<S: CountSource> {
  tracker: Arc<MetricTracker<S>>,
  running: Option<Running>,
}

struct Running {
  token: CancellationToken,
  _handle: JoinHandle<()>,
}

impl<S: CountSource> RefreshScheduler<S> {
  pub fn new(tracker: Arc<MetricTracker<S>>) -> Self {
    Self {
      tracker,
      running: None,
    }
  }

  pub fn is_running(&self) -> bool {
    self.running.is_some()
  }

  /// Start ticking every `refresh_interval`. Returns false if already running.
  pub fn start(&mut self, ids: Vec<EntityId>, auth: AuthContext) -> bool {
    if self.running.is_some() {
      return false;
    }

    let token = CancellationToken::new();
    let cancelled = token.clone();
    let tracker = Arc::clone(&self.tracker);
    let period = tracker.config().refresh_interval();

    let handle = tokio::spawn(async move {
      let mut ticks = time::interval_at(Instant::now() + period, period);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = cancelled.cancelled() => break,
          _ = ticks.tick() => {
            // Re-read every tick; nothing is captured from earlier loads
            if !tracker.has_active_transitions() {
              continue;
            }
            debug!(
              namespace = tracker.config().namespace(),
              ids = ids.len(),
              "Polling counts with transitions in progress"
            );
            // Failures are already published as zeros; the next tick retries
            // if the condition still holds.
            let _ = tracker.refresh_transitioning(ids.iter().cloned(), &auth).await;
          }
        }
      }
    });

    self.running = Some(Running {
      token,
      _handle: handle,
    });
    true
  }

  /// Stop future ticks. A fetch already in flight runs to completion.
  pub fn stop(&mut self) {
    if let Some(running) = self.running.take() {
      running.token.cancel();
    }
  }
}

impl<S: CountSource> Drop for RefreshScheduler<S> {
  fn drop(&mut self) {
    self.stop();
  }
}
