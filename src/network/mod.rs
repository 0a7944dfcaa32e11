//! Network quality classification and connectivity state.

mod monitor;
mod probe;
mod quality;

pub use monitor::{ConnectivityState, NetworkMonitor, QualityChange, SubscriptionId};
pub use probe::{FormatProbe, StaticProbe};
pub use quality::{
  classify, image_size_tier, ConnectionInfo, ConnectivitySignals, ImageSizeTier,
  NetworkQualityTier,
};
