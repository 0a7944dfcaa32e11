//! Progressive image loading for pages driven by this proxy's clients.

pub mod controller;
pub mod element;
pub mod loader;
pub mod manager;

pub use controller::{LoadPlan, LoadState, ProgressiveImage};
pub use element::{ElementId, ImageElement, Page};
pub use loader::{ImageLoader, RouterLoader};
pub use manager::ProgressiveImageManager;
