//! Page model: image elements, their data attributes and the viewport.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Stable identity of an element within a page.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub String);

impl ElementId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }
}

impl fmt::Display for ElementId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Class marking an image still showing its blurred placeholder.
pub const BLUR_UP: &str = "blur-up";
pub const LOADED: &str = "loaded";
pub const ERROR: &str = "error";

/// An `<img>` taking part in progressive loading.
///
/// `data` holds the element's `data-*` attributes without the prefix:
/// `src`, `srcset`, one entry per size tier (`small`, `medium`, ...), and
/// next-gen variants (`avif-small` or `small-avif`, `avif-srcset`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageElement {
  pub id: ElementId,
  #[serde(default)]
  pub src: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub srcset: Option<String>,
  #[serde(default)]
  pub data: BTreeMap<String, String>,
  #[serde(default)]
  pub classes: BTreeSet<String>,
  /// Layout box relative to the top of the viewport, in px
  #[serde(default)]
  pub top: f64,
  #[serde(default)]
  pub bottom: f64,
}

impl ImageElement {
  pub fn new(id: &str, src: &str) -> Self {
    Self {
      id: ElementId::new(id),
      src: src.to_string(),
      srcset: None,
      data: BTreeMap::new(),
      classes: BTreeSet::new(),
      top: 0.0,
      bottom: 0.0,
    }
  }

  pub fn with_data(mut self, name: &str, value: &str) -> Self {
    self.data.insert(name.to_string(), value.to_string());
    self
  }

  pub fn with_class(mut self, class: &str) -> Self {
    self.classes.insert(class.to_string());
    self
  }

  pub fn at(mut self, top: f64, bottom: f64) -> Self {
    self.top = top;
    self.bottom = bottom;
    self
  }

  pub fn data(&self, name: &str) -> Option<&str> {
    self.data.get(name).map(String::as_str)
  }

  pub fn has_data(&self, name: &str) -> bool {
    self.data.contains_key(name)
  }

  pub fn has_class(&self, class: &str) -> bool {
    self.classes.contains(class)
  }

  /// Candidate for progressive treatment: `img[data-src]`,
  /// `img.blur-up[data-small]`, `img.blur-up[data-medium]`.
  pub fn is_progressive(&self) -> bool {
    self.has_data("src")
      || (self.has_class(BLUR_UP) && (self.has_data("small") || self.has_data("medium")))
  }

  /// Candidate for the no-watcher path: `img[data-src]`, `img.blur-up`.
  pub fn is_eager_candidate(&self) -> bool {
    self.has_data("src") || self.has_class(BLUR_UP)
  }

  /// Loaded and carrying a variant worth upgrading to.
  pub fn is_upgradeable(&self) -> bool {
    self.has_class(LOADED) && (self.has_data("medium") || self.has_data("large"))
  }
}

/// A page: its image elements and the viewport they are laid out against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
  pub viewport_height: f64,
  /// Whether the host can watch element visibility
  #[serde(default = "default_true")]
  pub visibility_watcher: bool,
  #[serde(default)]
  pub images: Vec<ImageElement>,
}

fn default_true() -> bool {
  true
}

impl Page {
  pub fn new(viewport_height: f64) -> Self {
    Self {
      viewport_height,
      visibility_watcher: true,
      images: Vec::new(),
    }
  }

  pub fn with_image(mut self, image: ImageElement) -> Self {
    self.images.push(image);
    self
  }

  pub fn get(&self, id: &ElementId) -> Option<&ImageElement> {
    self.images.iter().find(|img| &img.id == id)
  }

  pub fn get_mut(&mut self, id: &ElementId) -> Option<&mut ImageElement> {
    self.images.iter_mut().find(|img| &img.id == id)
  }

  pub fn insert(&mut self, image: ImageElement) {
    self.images.push(image);
  }

  pub fn remove(&mut self, id: &ElementId) -> Option<ImageElement> {
    let pos = self.images.iter().position(|img| &img.id == id)?;
    Some(self.images.remove(pos))
  }

  pub fn contains(&self, id: &ElementId) -> bool {
    self.get(id).is_some()
  }

  /// Scroll the page by `dy` px (positive moves content up).
  pub fn scroll_by(&mut self, dy: f64) {
    for img in &mut self.images {
      img.top -= dy;
      img.bottom -= dy;
    }
  }

  /// Strictly inside the visible viewport.
  pub fn in_viewport(&self, image: &ImageElement) -> bool {
    image.top < self.viewport_height && image.bottom > 0.0
  }

  /// Inside the viewport grown by `margin` px on both edges.
  pub fn within_margin(&self, image: &ImageElement, margin: f64) -> bool {
    image.top < self.viewport_height + margin && image.bottom > -margin
  }
}
