//! Bookkeeping for detached background refreshes.

use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::watch;

/// Tracks which keys have a refresh in flight and counts finished ones.
pub(super) struct RefreshTracker {
  in_flight: Mutex<HashSet<String>>,
  completed: watch::Sender<u64>,
}

impl RefreshTracker {
  pub(super) fn new() -> Self {
    let (completed, _) = watch::channel(0);
    Self {
      in_flight: Mutex::new(HashSet::new()),
      completed,
    }
  }

  /// Claim `digest` for a refresh. Returns `false` when one is already running.
  pub(super) fn try_claim(&self, digest: &str) -> bool {
    match self.in_flight.lock() {
      Ok(mut set) => set.insert(digest.to_string()),
      // A poisoned set only costs us deduplication
      Err(poisoned) => poisoned.into_inner().insert(digest.to_string()),
    }
  }

  /// Mark a refresh finished, releasing its claim if it had one.
  pub(super) fn finish(&self, digest: Option<&str>) {
    if let Some(digest) = digest {
      match self.in_flight.lock() {
        Ok(mut set) => set.remove(digest),
        Err(poisoned) => poisoned.into_inner().remove(digest),
      };
    }
    self.completed.send_modify(|count| *count += 1);
  }

  pub(super) fn completions(&self) -> watch::Receiver<u64> {
    self.completed.subscribe()
  }
}
