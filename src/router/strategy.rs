//! The four caching strategies.
//!
//! Lookups go through `match_any` (every partition of every version still
//! present), except stale-while-revalidate which only consults the api
//! partition. Writes always target the current version's partition for the
//! request's class.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Router;
use crate::cache::{CacheResult, CacheStorage, CachedResponse, Partition, RequestKey};
use crate::http::{Fetcher, Request, Response};

impl<F: Fetcher, S: CacheStorage> Router<F, S> {
  /// Cache first.
  ///
  /// 1. Cached entry → return it, no network
  /// 2. Otherwise fetch; store OK responses before returning
  /// 3. Transport failure propagates
  pub(super) async fn cache_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    let key = RequestKey::get(&request.url);

    if let Some(cached) = self.lookup_any(&key) {
      debug!(%key, "Cache hit");
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    let response = self.fetcher.fetch(request).await.map_err(|e| {
      warn!(%key, "Cache first failed: {}", e);
      e
    })?;

    if response.is_ok() {
      self.store(Partition::Static, &key, &response);
    }

    Ok(CacheResult::from_network(response))
  }

  /// Cache first with a background refresh.
  ///
  /// A hit is returned immediately while a detached task refetches and
  /// rewrites the entry; the caller never sees those bytes. At most one
  /// refresh per key is in flight at a time. A miss waits for the network
  /// and, on transport failure, falls back to the cached placeholder image.
  pub(super) async fn cache_first_with_refresh(
    &self,
    request: &Request,
  ) -> Result<CacheResult<Response>> {
    let key = RequestKey::get(&request.url);

    if let Some(cached) = self.lookup_any(&key) {
      debug!(%key, "Cache hit, refreshing in background");
      self.spawn_refresh(request, key, Partition::Images, true);
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    match join(self.spawn_fetch(request, key.clone(), Partition::Images)).await {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(e) => {
        let placeholder = RequestKey::get(&self.fallbacks.placeholder_image);
        match self.lookup_any(&placeholder) {
          Some(cached) => {
            debug!(%key, "Network failed, serving placeholder image");
            Ok(CacheResult::fallback(cached.response, cached.cached_at))
          }
          None => {
            warn!(%key, "Image unavailable and no placeholder cached: {}", e);
            Err(e)
          }
        }
      }
    }
  }

  /// Stale while revalidate.
  ///
  /// The network fetch always runs and always updates the api partition on
  /// success. A cached entry is returned without waiting for it; otherwise
  /// the network answer is awaited. With neither, a 503 JSON body is
  /// synthesized.
  pub(super) async fn stale_while_revalidate(
    &self,
    request: &Request,
  ) -> Result<CacheResult<Response>> {
    let key = RequestKey::get(&request.url);
    let partition = self.version.partition_name(Partition::Api);

    let cached = self.storage.get(&partition, &key).unwrap_or_else(|e| {
      warn!(%key, "Cache lookup failed: {}", e);
      None
    });

    if let Some(cached) = cached {
      debug!(%key, "Serving stale entry, revalidating");
      self.spawn_refresh(request, key, Partition::Api, false);
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    match join(self.spawn_fetch(request, key.clone(), Partition::Api)).await {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(e) => {
        warn!(%key, "API unavailable and not cached: {}", e);
        Ok(CacheResult::synthesized(Response::offline_api()))
      }
    }
  }

  /// Network first with fallbacks.
  ///
  /// Any network response is returned (OK ones are stored). On transport
  /// failure: cached entry, then cached offline page, then a synthesized 503.
  pub(super) async fn network_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    let key = RequestKey::get(&request.url);

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.store(Partition::Pages, &key, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(%key, "Network failed: {}", e);

        if let Some(cached) = self.lookup_any(&key) {
          return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
        }

        let offline = RequestKey::get(&self.fallbacks.offline_page);
        if let Some(cached) = self.lookup_any(&offline) {
          debug!(%key, "Serving offline page");
          return Ok(CacheResult::fallback(cached.response, cached.cached_at));
        }

        warn!(%key, "No cached page or offline page, synthesizing 503");
        Ok(CacheResult::synthesized(Response::offline_page()))
      }
    }
  }

  /// Read failures count as misses.
  fn lookup_any(&self, key: &RequestKey) -> Option<CachedResponse> {
    self.storage.match_any(key).unwrap_or_else(|e| {
      warn!(%key, "Cache lookup failed: {}", e);
      None
    })
  }

  /// Write failures are logged and otherwise ignored.
  fn store(&self, partition: Partition, key: &RequestKey, response: &Response) {
    let name = self.version.partition_name(partition);
    if let Err(e) = self.storage.put(&name, key, response) {
      warn!(%key, partition = %name, "Cache write failed: {}", e);
    }
  }

  /// Fetch on a separate task so the cache still gets updated if the caller
  /// stops waiting.
  fn spawn_fetch(
    &self,
    request: &Request,
    key: RequestKey,
    partition: Partition,
  ) -> JoinHandle<Result<Response>> {
    let fetcher = self.fetcher.clone();
    let storage = Arc::clone(&self.storage);
    let request = request.clone();
    let partition = self.version.partition_name(partition);

    tokio::spawn(async move { fetch_and_store(fetcher, storage, request, key, partition).await })
  }

  /// Detached refresh. Its completion is unordered relative to the response
  /// already returned; observers synchronize on `refresh_completions`.
  fn spawn_refresh(&self, request: &Request, key: RequestKey, partition: Partition, dedupe: bool) {
    let digest = key.digest();
    if dedupe && !self.refresh.try_claim(&digest) {
      debug!(%key, "Refresh already in flight");
      return;
    }

    let handle = self.spawn_fetch(request, key, partition);
    let tracker = Arc::clone(&self.refresh);

    tokio::spawn(async move {
      if let Err(e) = join(handle).await {
        debug!("Background refresh failed: {}", e);
      }
      tracker.finish(dedupe.then_some(digest.as_str()));
    });
  }
}

async fn fetch_and_store<F: Fetcher, S: CacheStorage>(
  fetcher: F,
  storage: Arc<S>,
  request: Request,
  key: RequestKey,
  partition: String,
) -> Result<Response> {
  let response = fetcher.fetch(&request).await?;

  if response.is_ok() {
    if let Err(e) = storage.put(&partition, &key, &response) {
      warn!(%key, %partition, "Cache write failed: {}", e);
    }
  }

  Ok(response)
}

async fn join(handle: JoinHandle<Result<Response>>) -> Result<Response> {
  handle
    .await
    .map_err(|e| eyre!("Fetch task failed: {}", e))?
}
