//! Load lifecycle of a single progressive image.

use color_eyre::Result;
use serde::Serialize;
use tracing::debug;

use super::element::{ElementId, ImageElement, BLUR_UP, ERROR, LOADED};
use super::loader::ImageLoader;
use crate::network::{ImageSizeTier, NetworkMonitor};

/// Where an element is in its lifecycle.
///
/// `Pending` elements are watched for visibility. A visibility trigger moves
/// them to `Triggered` whether or not a load starts. `Loaded` can go back to
/// `Triggered` when the manager upgrades the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
  Pending,
  Triggered,
  Loading,
  Loaded,
  Errored,
}

/// Decision taken when a load starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadPlan {
  /// The element already shows the best URL; it was marked loaded.
  Current,
  /// Preload `url`, then swap it in.
  Fetch { url: String, srcset: Option<String> },
}

/// Controller for one image element.
#[derive(Debug, Clone)]
pub struct ProgressiveImage {
  element: ElementId,
  state: LoadState,
}

impl ProgressiveImage {
  pub fn new(element: ElementId) -> Self {
    Self {
      element,
      state: LoadState::Pending,
    }
  }

  pub fn element(&self) -> &ElementId {
    &self.element
  }

  pub fn state(&self) -> LoadState {
    self.state
  }

  pub fn is_loaded(&self) -> bool {
    self.state == LoadState::Loaded
  }

  pub fn is_loading(&self) -> bool {
    self.state == LoadState::Loading
  }

  /// One-shot visibility trigger.
  pub fn trigger(&mut self) {
    if self.state == LoadState::Pending {
      self.state = LoadState::Triggered;
    }
  }

  /// Forget that the image is loaded so the next load can pick a better URL.
  pub fn reset_for_upgrade(&mut self) {
    if self.state == LoadState::Loaded {
      self.state = LoadState::Triggered;
    }
  }

  /// Start a load: resolve the target URL and claim the element.
  ///
  /// Returns `None` when a load is already running or done, which makes
  /// repeated calls no-ops.
  pub fn begin(
    &mut self,
    image: &mut ImageElement,
    size: ImageSizeTier,
    next_gen: bool,
  ) -> Option<LoadPlan> {
    if matches!(self.state, LoadState::Loading | LoadState::Loaded) {
      return None;
    }

    let url = best_url(image, size, next_gen);
    if url.is_empty() || url == image.src {
      self.mark_loaded(image);
      return Some(LoadPlan::Current);
    }

    self.state = LoadState::Loading;
    Some(LoadPlan::Fetch {
      url,
      srcset: best_srcset(image, next_gen),
    })
  }

  /// Apply the result of the preload started by `begin`.
  pub fn finish(
    &mut self,
    image: &mut ImageElement,
    url: String,
    srcset: Option<String>,
    outcome: Result<()>,
  ) {
    match outcome {
      Ok(()) => {
        image.src = url;
        if let Some(srcset) = srcset {
          image.srcset = Some(srcset);
        }
        self.mark_loaded(image);
      }
      Err(e) => {
        debug!(element = %self.element, "Progressive image load failed: {}", e);
        image.classes.insert(ERROR.to_string());
        self.state = LoadState::Errored;
      }
    }
  }

  /// Run a whole load against `image`: resolve, preload, swap.
  pub async fn load<L: ImageLoader>(
    &mut self,
    image: &mut ImageElement,
    monitor: &NetworkMonitor,
    loader: &L,
  ) {
    let next_gen = monitor.supports_next_gen_format().await;

    if let Some(LoadPlan::Fetch { url, srcset }) =
      self.begin(image, monitor.image_size_tier(), next_gen)
    {
      let outcome = loader.preload(&url).await;
      self.finish(image, url, srcset, outcome);
    }
  }

  fn mark_loaded(&mut self, image: &mut ImageElement) {
    self.state = LoadState::Loaded;
    image.classes.remove(BLUR_UP);
    image.classes.remove(ERROR);
    image.classes.insert(LOADED.to_string());
    image.data.remove("src");
    image.data.remove("srcset");
  }
}

/// Best URL for `size`: a next-gen variant when supported, else the
/// fallback-format variant, the deferred source, or the current source.
fn best_url(image: &ImageElement, size: ImageSizeTier, next_gen: bool) -> String {
  let non_empty = |name: &str| image.data(name).filter(|v| !v.is_empty());
  let tier = size.as_str();

  if next_gen {
    let avif = non_empty(&format!("avif-{}", tier)).or_else(|| non_empty(&format!("{}-avif", tier)));
    if let Some(url) = avif {
      return url.to_string();
    }
  }

  non_empty(tier)
    .or_else(|| non_empty("src"))
    .unwrap_or(image.src.as_str())
    .to_string()
}

fn best_srcset(image: &ImageElement, next_gen: bool) -> Option<String> {
  if next_gen {
    if let Some(srcset) = image.data("avif-srcset") {
      return Some(srcset.to_string());
    }
  }
  image.data("srcset").map(String::from)
}
