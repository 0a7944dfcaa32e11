//! Request interception: classify each outbound GET and answer it with the
//! caching strategy fixed for its resource class.
//!
//! | class  | strategy                              | partition |
//! |--------|---------------------------------------|-----------|
//! | static | cache first                           | static-*  |
//! | image  | cache first, refresh in background    | images-*  |
//! | api    | stale while revalidate                | api-*     |
//! | page   | network first, offline fallbacks      | pages-*   |

mod activation;
mod refresh;
mod strategy;
#[cfg(test)]
pub(crate) mod testing;

pub use activation::ActivationReport;

use color_eyre::Result;
use reqwest::Method;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::cache::{CacheResult, CacheStorage, CacheVersion, Partition};
use crate::config::{Config, RoutesConfig};
use crate::http::{Fetcher, Request, RequestMode, Response};
use refresh::RefreshTracker;

/// Resource class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
  StaticAsset,
  Image,
  Api,
  Page,
}

impl ResourceClass {
  pub fn partition(self) -> Partition {
    match self {
      Self::StaticAsset => Partition::Static,
      Self::Image => Partition::Images,
      Self::Api => Partition::Api,
      Self::Page => Partition::Pages,
    }
  }

  pub fn strategy(self) -> Strategy {
    match self {
      Self::StaticAsset => Strategy::CacheFirst,
      Self::Image => Strategy::CacheFirstWithRefresh,
      Self::Api => Strategy::StaleWhileRevalidate,
      Self::Page => Strategy::NetworkFirst,
    }
  }
}

impl fmt::Display for ResourceClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::StaticAsset => "static-asset",
      Self::Image => "image",
      Self::Api => "api",
      Self::Page => "page",
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  CacheFirstWithRefresh,
  StaleWhileRevalidate,
  NetworkFirst,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::CacheFirst => "cache-first",
      Self::CacheFirstWithRefresh => "cache-first-with-refresh",
      Self::StaleWhileRevalidate => "stale-while-revalidate",
      Self::NetworkFirst => "network-first",
    })
  }
}

/// Path patterns deciding interception and resource class.
#[derive(Debug, Clone)]
pub struct RouteRules {
  routes: RoutesConfig,
}

impl RouteRules {
  pub fn new(routes: RoutesConfig) -> Self {
    Self { routes }
  }

  /// `None` means the request is not intercepted at all.
  pub fn classify(&self, request: &Request) -> Option<ResourceClass> {
    if request.method != Method::GET {
      return None;
    }

    let path = request.url.path();
    if path.starts_with(&self.routes.admin_prefix) {
      return None;
    }

    let ext = extension(path);
    let has_ext = |list: &[String]| ext.as_deref().is_some_and(|e| list.iter().any(|x| x == e));
    let under = |prefixes: &[String]| prefixes.iter().any(|p| path.starts_with(p.as_str()));

    if has_ext(&self.routes.static_extensions) || under(&self.routes.static_prefixes) {
      Some(ResourceClass::StaticAsset)
    } else if has_ext(&self.routes.image_extensions) || under(&self.routes.image_prefixes) {
      Some(ResourceClass::Image)
    } else if path.starts_with(&self.routes.api_prefix) {
      Some(ResourceClass::Api)
    } else if request.mode == RequestMode::Navigate || request.accepts_html() {
      Some(ResourceClass::Page)
    } else {
      None
    }
  }
}

impl Default for RouteRules {
  fn default() -> Self {
    Self::new(RoutesConfig::default())
  }
}

/// Lowercased extension of the last path segment.
fn extension(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() && ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}

/// Fallback resources looked up in the cache when the network fails.
#[derive(Debug, Clone)]
pub struct Fallbacks {
  pub offline_page: Url,
  pub placeholder_image: Url,
}

/// Outcome of handing a request to the router.
#[derive(Debug)]
pub enum Interception {
  /// Not ours: the caller should send the request on untouched
  Bypass,
  /// Answered by a caching strategy
  Served(CacheResult<Response>),
}

/// The caching router.
///
/// Cheap to clone; clones share storage and background refresh bookkeeping.
pub struct Router<F: Fetcher, S: CacheStorage> {
  fetcher: F,
  storage: Arc<S>,
  version: CacheVersion,
  rules: Arc<RouteRules>,
  fallbacks: Arc<Fallbacks>,
  manifest: Arc<Vec<Url>>,
  refresh: Arc<RefreshTracker>,
}

impl<F: Fetcher, S: CacheStorage> Router<F, S> {
  pub fn new(
    fetcher: F,
    storage: S,
    version: CacheVersion,
    rules: RouteRules,
    fallbacks: Fallbacks,
    manifest: Vec<Url>,
  ) -> Self {
    Self {
      fetcher,
      storage: Arc::new(storage),
      version,
      rules: Arc::new(rules),
      fallbacks: Arc::new(fallbacks),
      manifest: Arc::new(manifest),
      refresh: Arc::new(RefreshTracker::new()),
    }
  }

  /// Build a router from configuration, resolving manifest and fallback
  /// paths against the origin.
  pub fn from_config(config: &Config, fetcher: F, storage: S) -> Result<Self> {
    let manifest = config
      .precache
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    let fallbacks = Fallbacks {
      offline_page: config.resolve(&config.fallbacks.offline_page)?,
      placeholder_image: config.resolve(&config.fallbacks.placeholder_image)?,
    };

    Ok(Self::new(
      fetcher,
      storage,
      CacheVersion::new(config.cache.version.clone()),
      RouteRules::new(config.routes.clone()),
      fallbacks,
      manifest,
    ))
  }

  pub fn version(&self) -> &CacheVersion {
    &self.version
  }

  /// Same router answering under another cache version.
  pub fn with_version(&self, version: CacheVersion) -> Self {
    Self {
      version,
      ..self.clone()
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn fetcher(&self) -> &F {
    &self.fetcher
  }

  pub fn rules(&self) -> &RouteRules {
    &self.rules
  }

  /// Counter of finished background refreshes.
  ///
  /// Background refreshes finish in no particular order relative to the
  /// responses that spawned them; wait on this instead of sleeping.
  pub fn refresh_completions(&self) -> watch::Receiver<u64> {
    self.refresh.completions()
  }

  /// Intercept a request.
  ///
  /// Returns `Err` only when a strategy has nothing to answer with: a static
  /// asset or image that is neither cached nor reachable.
  pub async fn handle(&self, request: &Request) -> Result<Interception> {
    let Some(class) = self.rules.classify(request) else {
      debug!(url = %request.url, method = %request.method, "Bypassing request");
      return Ok(Interception::Bypass);
    };

    debug!(url = %request.url, %class, strategy = %class.strategy(), "Intercepting request");

    let served = match class.strategy() {
      Strategy::CacheFirst => self.cache_first(request).await?,
      Strategy::CacheFirstWithRefresh => self.cache_first_with_refresh(request).await?,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await?,
      Strategy::NetworkFirst => self.network_first(request).await?,
    };

    Ok(Interception::Served(served))
  }
}

impl<F: Fetcher, S: CacheStorage> Clone for Router<F, S> {
  fn clone(&self) -> Self {
    Self {
      fetcher: self.fetcher.clone(),
      storage: Arc::clone(&self.storage),
      version: self.version.clone(),
      rules: Arc::clone(&self.rules),
      fallbacks: Arc::clone(&self.fallbacks),
      manifest: Arc::clone(&self.manifest),
      refresh: Arc::clone(&self.refresh),
    }
  }
}
