//! The connectivity context: current state, derived hints and subscribers.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::probe::FormatProbe;
use super::quality::{
  classify, image_size_tier, ConnectionInfo, ConnectivitySignals, ImageSizeTier,
  NetworkQualityTier,
};

/// Connectivity as the rest of the system sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
  pub is_online: bool,
  pub save_data_requested: bool,
  pub tier: NetworkQualityTier,
}

/// Payload broadcast to subscribers whenever a signal changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityChange {
  pub tier: NetworkQualityTier,
  pub save_data: bool,
  pub is_online: bool,
  pub effective_type: String,
  pub downlink: Option<f64>,
  pub rtt: Option<u32>,
  pub image_size: ImageSizeTier,
  pub should_preload: bool,
  pub should_auto_load: bool,
}

/// Handle returned by [`NetworkMonitor::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn Fn(&QualityChange) -> bool + Send + Sync>;

/// Owns the single connectivity state of a client.
///
/// Construct one per client and pass it explicitly to whatever needs the
/// hints. Signal updates notify subscribers synchronously; subscribers that
/// need to do async work should hand the change off (e.g. into a channel).
/// A listener returning `false` is dropped, so a subscriber whose receiving
/// end is gone does not linger.
pub struct NetworkMonitor {
  signals: ConnectivitySignals,
  state: ConnectivityState,
  listeners: Vec<(SubscriptionId, Listener)>,
  next_subscription: u64,
  probe: Arc<dyn FormatProbe>,
  next_gen_supported: OnceCell<bool>,
}

impl NetworkMonitor {
  pub fn new(signals: ConnectivitySignals, probe: Arc<dyn FormatProbe>) -> Self {
    let state = ConnectivityState {
      is_online: signals.online,
      save_data_requested: signals
        .connection
        .as_ref()
        .map(|c| c.save_data)
        .unwrap_or(false),
      tier: classify(&signals),
    };

    Self {
      signals,
      state,
      listeners: Vec::new(),
      next_subscription: 0,
      probe,
      next_gen_supported: OnceCell::new(),
    }
  }

  pub fn state(&self) -> ConnectivityState {
    self.state
  }

  pub fn tier(&self) -> NetworkQualityTier {
    self.state.tier
  }

  pub fn image_size_tier(&self) -> ImageSizeTier {
    image_size_tier(self.state.tier, self.state.save_data_requested)
  }

  pub fn should_preload(&self) -> bool {
    self.state.tier == NetworkQualityTier::FourG
      && !self.state.save_data_requested
      && self.state.is_online
  }

  pub fn should_auto_load(&self) -> bool {
    !matches!(
      self.state.tier,
      NetworkQualityTier::Slow2g | NetworkQualityTier::Offline
    )
  }

  /// Whether the next-generation image format decodes on this client.
  ///
  /// The probe runs on first call only; concurrent first calls share it.
  pub async fn supports_next_gen_format(&self) -> bool {
    *self
      .next_gen_supported
      .get_or_init(|| async {
        match self.probe.probe().await {
          Ok(supported) => supported,
          Err(e) => {
            debug!("Format probe failed, treating as unsupported: {}", e);
            false
          }
        }
      })
      .await
  }

  /// Full snapshot in the shape subscribers receive.
  pub fn snapshot(&self) -> QualityChange {
    let conn = self.signals.connection.as_ref();

    QualityChange {
      tier: self.state.tier,
      save_data: self.state.save_data_requested,
      is_online: self.state.is_online,
      effective_type: conn
        .and_then(|c| c.effective_type.clone())
        .unwrap_or_else(|| "unknown".to_string()),
      downlink: conn.and_then(|c| c.downlink),
      rtt: conn.and_then(|c| c.rtt),
      image_size: self.image_size_tier(),
      should_preload: self.should_preload(),
      should_auto_load: self.should_auto_load(),
    }
  }

  /// Register `listener`. It stays registered until it returns `false` or
  /// is passed to [`unsubscribe`](Self::unsubscribe).
  pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
  where
    F: Fn(&QualityChange) -> bool + Send + Sync + 'static,
  {
    let id = SubscriptionId(self.next_subscription);
    self.next_subscription += 1;
    self.listeners.push((id, Box::new(listener)));
    id
  }

  /// Returns whether the subscription was still registered.
  pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
    let before = self.listeners.len();
    self.listeners.retain(|(sid, _)| *sid != id);
    self.listeners.len() != before
  }

  /// The device went online or offline.
  pub fn set_online(&mut self, online: bool) {
    self.signals.online = online;
    self.state.is_online = online;
    self.state.tier = if online {
      classify(&self.signals)
    } else {
      NetworkQualityTier::Offline
    };
    self.publish();
  }

  /// Connection characteristics changed.
  pub fn update_connection(&mut self, info: ConnectionInfo) {
    self.state.save_data_requested = info.save_data;
    self.signals.connection = Some(info);
    self.state.tier = classify(&self.signals);
    self.publish();
  }

  pub fn subscriber_count(&self) -> usize {
    self.listeners.len()
  }

  fn publish(&mut self) {
    let change = self.snapshot();
    info!(
      tier = %change.tier,
      online = change.is_online,
      save_data = change.save_data,
      "Network quality changed"
    );
    self.listeners.retain(|(id, listener)| {
      let keep = listener(&change);
      if !keep {
        debug!(subscription = id.0, "Dropped closed subscriber");
      }
      keep
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::StaticProbe;
  use color_eyre::eyre::eyre;
  use futures::future::BoxFuture;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Mutex;

  fn conn(effective_type: &str, downlink: f64, rtt: u32, save_data: bool) -> ConnectionInfo {
    ConnectionInfo {
      effective_type: Some(effective_type.to_string()),
      downlink: Some(downlink),
      rtt: Some(rtt),
      save_data,
    }
  }

  fn monitor(info: Option<ConnectionInfo>) -> NetworkMonitor {
    NetworkMonitor::new(
      ConnectivitySignals {
        online: true,
        connection: info,
      },
      Arc::new(StaticProbe(false)),
    )
  }

  struct CountingProbe {
    calls: AtomicU32,
    answer: bool,
  }

  impl FormatProbe for CountingProbe {
    fn probe(&self) -> BoxFuture<'_, color_eyre::Result<bool>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let answer = self.answer;
      Box::pin(async move { Ok(answer) })
    }
  }

  struct FailingProbe;

  impl FormatProbe for FailingProbe {
    fn probe(&self) -> BoxFuture<'_, color_eyre::Result<bool>> {
      Box::pin(async { Err(eyre!("decode failed")) })
    }
  }

  #[test]
  fn test_hints_on_fast_link() {
    let m = monitor(Some(conn("4g", 10.0, 50, false)));
    assert_eq!(m.tier(), NetworkQualityTier::FourG);
    assert_eq!(m.image_size_tier(), ImageSizeTier::Medium);
    assert!(m.should_preload());
    assert!(m.should_auto_load());
  }

  #[test]
  fn test_save_data_disables_preload_and_forces_thumbnail() {
    let m = monitor(Some(conn("4g", 10.0, 50, true)));
    assert_eq!(m.tier(), NetworkQualityTier::FourG);
    assert!(!m.should_preload());
    assert_eq!(m.image_size_tier(), ImageSizeTier::Thumbnail);
  }

  #[test]
  fn test_slow_links_do_not_auto_load() {
    let m = monitor(Some(conn("slow-2g", 0.05, 2000, false)));
    assert!(!m.should_auto_load());
    assert_eq!(m.image_size_tier(), ImageSizeTier::Tiny);

    let mut m = monitor(Some(conn("3g", 1.0, 300, false)));
    assert!(m.should_auto_load());
    m.set_online(false);
    assert!(!m.should_auto_load());
    assert!(!m.should_preload());
  }

  #[test]
  fn test_subscribers_receive_snapshots_until_unsubscribed() {
    let mut m = monitor(Some(conn("3g", 1.0, 300, false)));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let id = m.subscribe(move |change| {
      sink.lock().unwrap().push(change.clone());
      true
    });

    m.update_connection(conn("4g", 8.0, 60, false));
    m.set_online(false);

    {
      let seen = seen.lock().unwrap();
      assert_eq!(seen.len(), 2);
      assert_eq!(seen[0].tier, NetworkQualityTier::FourG);
      assert_eq!(seen[0].effective_type, "4g");
      assert_eq!(seen[0].image_size, ImageSizeTier::Medium);
      assert!(seen[0].should_preload);
      assert_eq!(seen[1].tier, NetworkQualityTier::Offline);
      assert!(!seen[1].is_online);
    }

    assert!(m.unsubscribe(id));
    assert!(!m.unsubscribe(id));
    m.set_online(true);
    assert_eq!(seen.lock().unwrap().len(), 2);
  }

  #[test]
  fn test_listener_returning_false_is_dropped() {
    let mut m = monitor(Some(conn("3g", 1.0, 300, false)));
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    m.subscribe(move |_| {
      *counter.lock().unwrap() += 1;
      false
    });
    m.subscribe(|_| true);
    assert_eq!(m.subscriber_count(), 2);

    m.update_connection(conn("4g", 8.0, 60, false));
    m.set_online(false);
    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(m.subscriber_count(), 1);
  }

  #[test]
  fn test_back_online_reclassifies() {
    let mut m = monitor(Some(conn("3g", 0.3, 300, false)));
    m.set_online(false);
    assert_eq!(m.tier(), NetworkQualityTier::Offline);
    m.set_online(true);
    assert_eq!(m.tier(), NetworkQualityTier::TwoG);
  }

  #[test]
  fn test_snapshot_without_connection_api() {
    let m = monitor(None);
    let snap = m.snapshot();
    assert_eq!(snap.tier, NetworkQualityTier::Unknown);
    assert_eq!(snap.effective_type, "unknown");
    assert_eq!(snap.downlink, None);
    assert_eq!(snap.image_size, ImageSizeTier::Small);
  }

  #[tokio::test]
  async fn test_format_probe_runs_once() {
    let probe = Arc::new(CountingProbe {
      calls: AtomicU32::new(0),
      answer: true,
    });
    let m = NetworkMonitor::new(
      ConnectivitySignals {
        online: true,
        connection: None,
      },
      probe.clone(),
    );

    assert!(m.supports_next_gen_format().await);
    assert!(m.supports_next_gen_format().await);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_failing_probe_means_unsupported() {
    let m = NetworkMonitor::new(
      ConnectivitySignals {
        online: true,
        connection: None,
      },
      Arc::new(FailingProbe),
    );
    assert!(!m.supports_next_gen_format().await);
  }
}
