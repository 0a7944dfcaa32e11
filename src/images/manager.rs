//! Registry of progressive images on a page.

use color_eyre::Result;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::controller::{LoadPlan, LoadState, ProgressiveImage};
use super::element::{ElementId, Page};
use super::loader::ImageLoader;
use crate::network::{NetworkMonitor, NetworkQualityTier, QualityChange, SubscriptionId};

/// Look-ahead margin when the connection is good enough to preload.
pub const PRELOAD_MARGIN: f64 = 400.0;
pub const DEFAULT_MARGIN: f64 = 100.0;

type Preload = BoxFuture<'static, (ElementId, String, Option<String>, Result<()>)>;

fn margin_for(should_preload: bool) -> f64 {
  if should_preload {
    PRELOAD_MARGIN
  } else {
    DEFAULT_MARGIN
  }
}

/// Discovers progressive images, defers them until they near the viewport,
/// and upgrades loaded ones when the connection improves.
///
/// Tasks are keyed by element id. The page and the monitor are passed into
/// each call; the manager only keeps per-element load state. Preloads run
/// concurrently and are applied to the page by [`settle`](Self::settle).
pub struct ProgressiveImageManager<L: ImageLoader> {
  loader: L,
  tasks: BTreeMap<ElementId, ProgressiveImage>,
  root_margin: f64,
  watching: bool,
  in_flight: FuturesUnordered<Preload>,
  changes_tx: mpsc::UnboundedSender<QualityChange>,
  changes_rx: mpsc::UnboundedReceiver<QualityChange>,
  subscription: Option<SubscriptionId>,
}

impl<L: ImageLoader> ProgressiveImageManager<L> {
  /// Scan `page` and register its progressive images.
  ///
  /// Without a visibility watcher every candidate starts loading right away.
  pub async fn new(page: &mut Page, monitor: &NetworkMonitor, loader: L) -> Self {
    let (changes_tx, changes_rx) = mpsc::unbounded_channel();
    let mut manager = Self {
      loader,
      tasks: BTreeMap::new(),
      root_margin: margin_for(monitor.should_preload()),
      watching: page.visibility_watcher,
      in_flight: FuturesUnordered::new(),
      changes_tx,
      changes_rx,
      subscription: None,
    };
    manager.refresh(page, monitor).await;
    manager
  }

  pub fn root_margin(&self) -> f64 {
    self.root_margin
  }

  pub fn task(&self, id: &ElementId) -> Option<&ProgressiveImage> {
    self.tasks.get(id)
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }

  pub fn pending_loads(&self) -> usize {
    self.in_flight.len()
  }

  /// Start receiving quality changes from `monitor`.
  ///
  /// Once the manager is dropped the listener fails to send and the monitor
  /// drops it on the next change, so `detach` is only needed to stop early.
  pub fn attach(&mut self, monitor: &mut NetworkMonitor) {
    if self.subscription.is_some() {
      return;
    }
    let tx = self.changes_tx.clone();
    self.subscription = Some(monitor.subscribe(move |change| tx.send(change.clone()).is_ok()));
  }

  pub fn detach(&mut self, monitor: &mut NetworkMonitor) {
    if let Some(id) = self.subscription.take() {
      monitor.unsubscribe(id);
    }
  }

  /// Register elements inserted since the last scan.
  pub async fn refresh(&mut self, page: &mut Page, monitor: &NetworkMonitor) {
    let watching = self.watching;
    let found: Vec<ElementId> = page
      .images
      .iter()
      .filter(|img| {
        if watching {
          img.is_progressive()
        } else {
          img.is_eager_candidate()
        }
      })
      .filter(|img| !self.tasks.contains_key(&img.id))
      .map(|img| img.id.clone())
      .collect();

    if !found.is_empty() {
      debug!(count = found.len(), "Registered progressive images");
    }

    for id in found {
      self.tasks.insert(id.clone(), ProgressiveImage::new(id.clone()));
      if !watching {
        self.start(&id, page, monitor).await;
      }
    }
  }

  /// Visibility triggers for `ids`. Each element triggers once; the load
  /// only starts when the connection allows automatic loads.
  pub async fn on_visible(&mut self, ids: &[ElementId], page: &mut Page, monitor: &NetworkMonitor) {
    for id in ids {
      let Some(task) = self.tasks.get_mut(id) else {
        continue;
      };
      if task.state() != LoadState::Pending {
        continue;
      }
      task.trigger();

      if monitor.should_auto_load() {
        self.start(id, page, monitor).await;
      }
    }
  }

  /// Trigger every watched element inside the look-ahead margin.
  pub async fn check_visibility(&mut self, page: &mut Page, monitor: &NetworkMonitor) {
    if !self.watching {
      return;
    }
    let visible: Vec<ElementId> = self
      .tasks
      .values()
      .filter(|task| task.state() == LoadState::Pending)
      .filter_map(|task| page.get(task.element()))
      .filter(|img| page.within_margin(img, self.root_margin))
      .map(|img| img.id.clone())
      .collect();

    self.on_visible(&visible, page, monitor).await;
  }

  /// Load `id` now, regardless of visibility or connection hints.
  pub async fn force_load(&mut self, id: &ElementId, page: &mut Page, monitor: &NetworkMonitor) {
    if !page.contains(id) {
      return;
    }
    self
      .tasks
      .entry(id.clone())
      .or_insert_with(|| ProgressiveImage::new(id.clone()))
      .trigger();
    self.start(id, page, monitor).await;
  }

  /// Apply queued quality changes. Returns the number of upgrades started.
  pub async fn process_events(&mut self, page: &mut Page, monitor: &NetworkMonitor) -> usize {
    let mut upgraded = 0;

    while let Ok(change) = self.changes_rx.try_recv() {
      self.root_margin = margin_for(change.should_preload);

      if change.tier == NetworkQualityTier::FourG && !change.save_data {
        upgraded += self.upgrade_visible(page, monitor).await;
      }
    }

    upgraded
  }

  /// Wait for every running preload and apply the results to `page`.
  pub async fn settle(&mut self, page: &mut Page) {
    while let Some((id, url, srcset, outcome)) = self.in_flight.next().await {
      match (self.tasks.get_mut(&id), page.get_mut(&id)) {
        (Some(task), Some(image)) => task.finish(image, url, srcset, outcome),
        _ => debug!(element = %id, "Dropping load result for removed element"),
      }
    }
  }

  /// Forget the task for an element removed from the page.
  pub fn remove(&mut self, id: &ElementId) -> bool {
    self.tasks.remove(id).is_some()
  }

  /// Forget every task whose element is no longer on `page`.
  pub fn prune(&mut self, page: &Page) -> usize {
    let before = self.tasks.len();
    self.tasks.retain(|id, _| page.contains(id));
    before - self.tasks.len()
  }

  async fn upgrade_visible(&mut self, page: &mut Page, monitor: &NetworkMonitor) -> usize {
    let candidates: Vec<ElementId> = self
      .tasks
      .values()
      .filter(|task| task.is_loaded())
      .filter_map(|task| page.get(task.element()))
      .filter(|img| page.in_viewport(img) && img.is_upgradeable())
      .map(|img| img.id.clone())
      .collect();

    if !candidates.is_empty() {
      info!(count = candidates.len(), "Upgrading visible images");
    }

    for id in &candidates {
      if let Some(task) = self.tasks.get_mut(id) {
        task.reset_for_upgrade();
      }
      self.start(id, page, monitor).await;
    }
    candidates.len()
  }

  async fn start(&mut self, id: &ElementId, page: &mut Page, monitor: &NetworkMonitor) {
    let next_gen = monitor.supports_next_gen_format().await;
    let size = monitor.image_size_tier();

    let (Some(task), Some(image)) = (self.tasks.get_mut(id), page.get_mut(id)) else {
      return;
    };

    if let Some(LoadPlan::Fetch { url, srcset }) = task.begin(image, size, next_gen) {
      debug!(element = %id, url = %url, size = %size, "Loading progressive image");
      let preload = self.loader.preload(&url);
      let id = id.clone();
      self
        .in_flight
        .push(Box::pin(async move { (id, url, srcset, preload.await) }));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::images::element::{ImageElement, BLUR_UP, ERROR, LOADED};
  use crate::network::{ConnectionInfo, ConnectivitySignals, StaticProbe};
  use color_eyre::eyre::eyre;
  use std::sync::{Arc, Mutex};

  #[derive(Clone, Default)]
  struct CountingLoader {
    urls: Arc<Mutex<Vec<String>>>,
  }

  impl CountingLoader {
    fn urls(&self) -> Vec<String> {
      self.urls.lock().unwrap().clone()
    }
  }

  impl ImageLoader for CountingLoader {
    fn preload(&self, url: &str) -> BoxFuture<'static, Result<()>> {
      self.urls.lock().unwrap().push(url.to_string());
      let broken = url.contains("broken");
      Box::pin(async move {
        if broken {
          Err(eyre!("404"))
        } else {
          Ok(())
        }
      })
    }
  }

  fn conn(effective_type: &str, downlink: f64, rtt: u32) -> ConnectionInfo {
    ConnectionInfo {
      effective_type: Some(effective_type.to_string()),
      downlink: Some(downlink),
      rtt: Some(rtt),
      save_data: false,
    }
  }

  fn monitor(effective_type: &str) -> NetworkMonitor {
    NetworkMonitor::new(
      ConnectivitySignals {
        online: true,
        connection: Some(conn(effective_type, 10.0, 50)),
      },
      Arc::new(StaticProbe(false)),
    )
  }

  fn dish(id: &str, top: f64) -> ImageElement {
    ImageElement::new(id, &format!("/img/{}-tiny.webp", id))
      .with_class(BLUR_UP)
      .with_data("small", &format!("/img/{}-small.webp", id))
      .with_data("medium", &format!("/img/{}-medium.webp", id))
      .at(top, top + 300.0)
  }

  fn id(s: &str) -> ElementId {
    ElementId::new(s)
  }

  #[tokio::test]
  async fn test_upgrade_on_switch_to_4g() {
    let mut m = monitor("3g");
    let mut page = Page::new(800.0).with_image(dish("dish", 0.0));
    let loader = CountingLoader::default();
    let mut manager = ProgressiveImageManager::new(&mut page, &m, loader.clone()).await;
    manager.attach(&mut m);

    manager.check_visibility(&mut page, &m).await;
    manager.settle(&mut page).await;
    assert_eq!(loader.urls(), vec!["/img/dish-small.webp"]);
    assert!(manager.task(&id("dish")).unwrap().is_loaded());

    m.update_connection(conn("4g", 10.0, 50));
    assert_eq!(manager.process_events(&mut page, &m).await, 1);
    manager.settle(&mut page).await;

    assert_eq!(
      loader.urls(),
      vec!["/img/dish-small.webp", "/img/dish-medium.webp"]
    );
    assert_eq!(page.get(&id("dish")).unwrap().src, "/img/dish-medium.webp");
    assert_eq!(manager.root_margin(), PRELOAD_MARGIN);

    // Nothing queued, nothing to do
    assert_eq!(manager.process_events(&mut page, &m).await, 0);
  }

  #[tokio::test]
  async fn test_upgrade_skips_offscreen_and_save_data() {
    let mut m = monitor("3g");
    let mut page = Page::new(800.0).with_image(dish("near", 850.0));
    let loader = CountingLoader::default();
    let mut manager = ProgressiveImageManager::new(&mut page, &m, loader.clone()).await;
    manager.attach(&mut m);

    // Inside the 100px margin but outside the viewport
    manager.check_visibility(&mut page, &m).await;
    manager.settle(&mut page).await;
    assert_eq!(loader.urls().len(), 1);

    m.update_connection(conn("4g", 10.0, 50));
    assert_eq!(manager.process_events(&mut page, &m).await, 0);

    page.scroll_by(500.0);
    m.update_connection(ConnectionInfo {
      save_data: true,
      ..conn("4g", 10.0, 50)
    });
    assert_eq!(manager.process_events(&mut page, &m).await, 0);
    assert_eq!(loader.urls().len(), 1);
  }

  #[tokio::test]
  async fn test_margin_follows_preload_hint() {
    let m = monitor("4g");
    let mut page = Page::new(800.0).with_image(dish("below", 1100.0));
    let loader = CountingLoader::default();
    let mut manager = ProgressiveImageManager::new(&mut page, &m, loader.clone()).await;
    assert_eq!(manager.root_margin(), PRELOAD_MARGIN);

    manager.check_visibility(&mut page, &m).await;
    manager.settle(&mut page).await;
    assert_eq!(loader.urls(), vec!["/img/below-medium.webp"]);

    let m = monitor("3g");
    let mut page = Page::new(800.0).with_image(dish("below", 1100.0));
    let mut manager = ProgressiveImageManager::new(&mut page, &m, CountingLoader::default()).await;
    assert_eq!(manager.root_margin(), DEFAULT_MARGIN);
    manager.check_visibility(&mut page, &m).await;
    assert_eq!(manager.task(&id("below")).unwrap().state(), LoadState::Pending);
  }

  #[tokio::test]
  async fn test_no_auto_load_on_slow_connection_and_one_shot_trigger() {
    let mut m = monitor("slow-2g");
    let mut page = Page::new(800.0).with_image(dish("dish", 0.0));
    let loader = CountingLoader::default();
    let mut manager = ProgressiveImageManager::new(&mut page, &m, loader.clone()).await;

    manager.check_visibility(&mut page, &m).await;
    assert_eq!(manager.task(&id("dish")).unwrap().state(), LoadState::Triggered);
    assert!(loader.urls().is_empty());

    // The element is no longer watched once triggered
    m.update_connection(conn("3g", 10.0, 50));
    manager.check_visibility(&mut page, &m).await;
    assert!(loader.urls().is_empty());

    manager.force_load(&id("dish"), &mut page, &m).await;
    manager.settle(&mut page).await;
    assert_eq!(loader.urls(), vec!["/img/dish-small.webp"]);
  }

  #[tokio::test]
  async fn test_force_load_twice_fetches_once() {
    let m = monitor("3g");
    let mut page = Page::new(800.0).with_image(dish("dish", 5000.0));
    let loader = CountingLoader::default();
    let mut manager = ProgressiveImageManager::new(&mut page, &m, loader.clone()).await;

    manager.force_load(&id("dish"), &mut page, &m).await;
    manager.force_load(&id("dish"), &mut page, &m).await;
    assert_eq!(manager.pending_loads(), 1);
    manager.settle(&mut page).await;

    assert_eq!(loader.urls().len(), 1);
    assert!(page.get(&id("dish")).unwrap().has_class(LOADED));
  }

  #[tokio::test]
  async fn test_loads_everything_without_visibility_watcher() {
    let m = monitor("3g");
    let mut page = Page::new(800.0)
      .with_image(dish("a", 0.0))
      .with_image(dish("b", 9000.0))
      .with_image(ImageElement::new("plain", "/img/plain.webp").with_class(BLUR_UP))
      .with_image(ImageElement::new("ignored", "/img/ignored.webp"));
    page.visibility_watcher = false;
    let loader = CountingLoader::default();
    let mut manager = ProgressiveImageManager::new(&mut page, &m, loader.clone()).await;
    manager.settle(&mut page).await;

    assert_eq!(manager.len(), 3);
    assert_eq!(loader.urls().len(), 2);
    for name in ["a", "b", "plain"] {
      assert!(manager.task(&id(name)).unwrap().is_loaded(), "{} not loaded", name);
    }
    assert!(manager.task(&id("ignored")).is_none());
  }

  #[tokio::test]
  async fn test_failed_load_is_marked_and_not_retried() {
    let m = monitor("3g");
    let mut page = Page::new(800.0).with_image(
      ImageElement::new("bad", "/img/bad-tiny.webp")
        .with_class(BLUR_UP)
        .with_data("small", "/img/broken.webp")
        .at(0.0, 100.0),
    );
    let loader = CountingLoader::default();
    let mut manager = ProgressiveImageManager::new(&mut page, &m, loader.clone()).await;

    manager.check_visibility(&mut page, &m).await;
    manager.settle(&mut page).await;
    manager.check_visibility(&mut page, &m).await;
    manager.settle(&mut page).await;

    assert_eq!(loader.urls().len(), 1);
    assert_eq!(manager.task(&id("bad")).unwrap().state(), LoadState::Errored);
    assert!(page.get(&id("bad")).unwrap().has_class(ERROR));
  }

  #[tokio::test]
  async fn test_refresh_picks_up_inserted_and_prune_drops_removed() {
    let m = monitor("3g");
    let mut page = Page::new(800.0).with_image(dish("a", 0.0));
    let mut manager = ProgressiveImageManager::new(&mut page, &m, CountingLoader::default()).await;
    assert_eq!(manager.len(), 1);

    page.insert(dish("b", 100.0));
    manager.refresh(&mut page, &m).await;
    assert_eq!(manager.len(), 2);
    assert_eq!(manager.task(&id("b")).unwrap().state(), LoadState::Pending);

    page.remove(&id("a"));
    assert_eq!(manager.prune(&page), 1);
    assert!(manager.task(&id("a")).is_none());
    assert!(manager.remove(&id("b")));
    assert!(manager.is_empty());
  }

  #[tokio::test]
  async fn test_detach_stops_upgrades() {
    let mut m = monitor("3g");
    let mut page = Page::new(800.0).with_image(dish("dish", 0.0));
    let loader = CountingLoader::default();
    let mut manager = ProgressiveImageManager::new(&mut page, &m, loader.clone()).await;
    manager.attach(&mut m);
    manager.check_visibility(&mut page, &m).await;
    manager.settle(&mut page).await;

    manager.detach(&mut m);
    m.update_connection(conn("4g", 10.0, 50));
    assert_eq!(manager.process_events(&mut page, &m).await, 0);
    assert_eq!(loader.urls().len(), 1);
  }

  #[tokio::test]
  async fn test_dropped_manager_listener_is_pruned() {
    let mut m = monitor("3g");
    let mut page = Page::new(800.0).with_image(dish("dish", 0.0));
    let mut manager = ProgressiveImageManager::new(&mut page, &m, CountingLoader::default()).await;
    manager.attach(&mut m);
    assert_eq!(m.subscriber_count(), 1);

    drop(manager);
    m.update_connection(conn("4g", 10.0, 50));
    assert_eq!(m.subscriber_count(), 0);
  }
}
