//! Connection quality tiers and the policy derived from them.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Discrete network quality, as reported to the rest of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkQualityTier {
  #[serde(rename = "offline")]
  Offline,
  #[serde(rename = "slow-2g")]
  Slow2g,
  #[serde(rename = "2g")]
  TwoG,
  #[serde(rename = "3g")]
  ThreeG,
  #[serde(rename = "4g")]
  FourG,
  #[serde(rename = "unknown")]
  Unknown,
}

impl NetworkQualityTier {
  /// Position on the throughput scale. `Unknown` sits between 2g and 3g so
  /// it behaves like a cautious middle default.
  fn rank(self) -> u8 {
    match self {
      Self::Offline => 0,
      Self::Slow2g => 1,
      Self::TwoG => 2,
      Self::Unknown => 3,
      Self::ThreeG => 4,
      Self::FourG => 5,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Offline => "offline",
      Self::Slow2g => "slow-2g",
      Self::TwoG => "2g",
      Self::ThreeG => "3g",
      Self::FourG => "4g",
      Self::Unknown => "unknown",
    }
  }
}

impl PartialOrd for NetworkQualityTier {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for NetworkQualityTier {
  fn cmp(&self, other: &Self) -> Ordering {
    self.rank().cmp(&other.rank())
  }
}

impl fmt::Display for NetworkQualityTier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Image representation size, smallest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSizeTier {
  Tiny,
  Thumbnail,
  Small,
  Medium,
  Large,
}

impl ImageSizeTier {
  /// Name used in `data-*` attributes.
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Tiny => "tiny",
      Self::Thumbnail => "thumbnail",
      Self::Small => "small",
      Self::Medium => "medium",
      Self::Large => "large",
    }
  }
}

impl fmt::Display for ImageSizeTier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Connection characteristics, when the platform exposes them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
  /// Effective connection type label (`slow-2g`, `2g`, `3g`, `4g`)
  pub effective_type: Option<String>,
  /// Measured downlink in Mbps
  pub downlink: Option<f64>,
  /// Measured round-trip time in ms
  pub rtt: Option<u32>,
  /// User asked for reduced data usage
  #[serde(default)]
  pub save_data: bool,
}

/// Raw inputs to classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivitySignals {
  pub online: bool,
  /// `None` when no connection-characteristics API is available
  pub connection: Option<ConnectionInfo>,
}

/// Classify raw signals into a tier.
///
/// The effective type label is trusted for 2g-class links; 3g and 4g labels
/// are checked against measured rtt and downlink and downgraded one step when
/// the measurements disagree. Missing measurements never cause a downgrade.
pub fn classify(signals: &ConnectivitySignals) -> NetworkQualityTier {
  if !signals.online {
    return NetworkQualityTier::Offline;
  }

  let Some(conn) = &signals.connection else {
    return NetworkQualityTier::Unknown;
  };

  let rtt_above = |limit: u32| conn.rtt.map(|rtt| rtt > limit).unwrap_or(false);
  let downlink_below = |limit: f64| conn.downlink.map(|d| d < limit).unwrap_or(false);

  match conn.effective_type.as_deref() {
    Some("slow-2g") => NetworkQualityTier::Slow2g,
    Some("2g") => NetworkQualityTier::TwoG,
    Some("3g") => {
      if rtt_above(800) || downlink_below(0.5) {
        NetworkQualityTier::TwoG
      } else {
        NetworkQualityTier::ThreeG
      }
    }
    Some("4g") => {
      if rtt_above(400) || downlink_below(1.5) {
        NetworkQualityTier::ThreeG
      } else {
        NetworkQualityTier::FourG
      }
    }
    _ => NetworkQualityTier::Unknown,
  }
}

/// Image size to request for a tier.
pub fn image_size_tier(tier: NetworkQualityTier, save_data: bool) -> ImageSizeTier {
  if save_data {
    return ImageSizeTier::Thumbnail;
  }

  match tier {
    NetworkQualityTier::Offline => ImageSizeTier::Thumbnail,
    NetworkQualityTier::Slow2g => ImageSizeTier::Tiny,
    NetworkQualityTier::TwoG => ImageSizeTier::Thumbnail,
    NetworkQualityTier::ThreeG => ImageSizeTier::Small,
    NetworkQualityTier::FourG => ImageSizeTier::Medium,
    NetworkQualityTier::Unknown => ImageSizeTier::Small,
  }
}
