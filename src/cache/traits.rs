//! Provenance of responses handed back by the router.

use chrono::{DateTime, Utc};

/// Result from a cache strategy, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data straight from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// A stored entry matching the request itself.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// A stored stand-in (placeholder image, offline page) served because
  /// the network failed.
  pub fn fallback(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: Some(cached_at),
    }
  }

  /// Built locally with neither network nor cache available.
  pub fn synthesized(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthesized,
      cached_at: None,
    }
  }
}

/// Indicates where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Entry cached for this exact request
  Cache,
  /// Designated fallback resource from cache
  Fallback,
  /// Generated error response
  Synthesized,
}

impl CacheSource {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Fallback => "fallback",
      Self::Synthesized => "synthesized",
    }
  }
}
