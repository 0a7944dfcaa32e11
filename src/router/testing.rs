//! Scripted fetcher and router builders shared by tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use url::Url;

use super::{Fallbacks, RouteRules, Router};
use crate::cache::{CacheStorage, CacheVersion, CachedResponse, RequestKey, SqliteStorage};
use crate::http::{Fetcher, Request, Response};

pub(crate) const ORIGIN: &str = "https://menu.test";

pub(crate) fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

#[derive(Default)]
struct Script {
  replies: HashMap<String, Option<Response>>,
  calls: HashMap<String, usize>,
  gates: HashMap<String, Arc<Semaphore>>,
}

/// Fetcher answering from a script. Unscripted URLs fail like a dead network.
#[derive(Clone, Default)]
pub(crate) struct ScriptedFetcher {
  script: Arc<Mutex<Script>>,
}

impl ScriptedFetcher {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn respond(&self, path: &str, status: u16, body: &str) {
    let mut script = self.script.lock().unwrap();
    script
      .replies
      .insert(url(path).to_string(), Some(Response::new(status, body.to_string())));
  }

  pub(crate) fn fail(&self, path: &str) {
    let mut script = self.script.lock().unwrap();
    script.replies.insert(url(path).to_string(), None);
  }

  /// Make fetches of `path` wait until released.
  pub(crate) fn hold(&self, path: &str) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    let mut script = self.script.lock().unwrap();
    script.gates.insert(url(path).to_string(), gate.clone());
    gate
  }

  pub(crate) fn calls(&self, path: &str) -> usize {
    let script = self.script.lock().unwrap();
    script
      .calls
      .get(url(path).as_str())
      .copied()
      .unwrap_or(0)
  }

  pub(crate) fn total_calls(&self) -> usize {
    self.script.lock().unwrap().calls.values().sum()
  }
}

impl Fetcher for ScriptedFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let key = request.url.to_string();
    let gate = {
      let mut script = self.script.lock().unwrap();
      *script.calls.entry(key.clone()).or_default() += 1;
      script.gates.get(&key).cloned()
    };

    if let Some(gate) = gate {
      gate
        .acquire()
        .await
        .map_err(|e| eyre!("gate closed: {}", e))?
        .forget();
    }

    let reply = self.script.lock().unwrap().replies.get(&key).cloned();
    match reply {
      Some(Some(response)) => Ok(response),
      _ => Err(eyre!("connection refused: {}", key)),
    }
  }
}

pub(crate) fn router_with_version<S: CacheStorage>(
  fetcher: &ScriptedFetcher,
  storage: S,
  version: &str,
) -> Router<ScriptedFetcher, S> {
  Router::new(
    fetcher.clone(),
    storage,
    CacheVersion::new(version),
    RouteRules::default(),
    Fallbacks {
      offline_page: url("/offline"),
      placeholder_image: url("/static/images/placeholder.webp"),
    },
    vec![url("/"), url("/static/css/main/main.css"), url("/offline")],
  )
}

pub(crate) fn router(fetcher: &ScriptedFetcher) -> Router<ScriptedFetcher, SqliteStorage> {
  router_with_version(fetcher, SqliteStorage::open_in_memory().unwrap(), "v1")
}

/// Storage whose reads work and whose writes always fail.
pub(crate) struct ReadOnlyStorage {
  inner: SqliteStorage,
}

impl ReadOnlyStorage {
  pub(crate) fn new() -> Self {
    Self {
      inner: SqliteStorage::open_in_memory().unwrap(),
    }
  }
}

impl CacheStorage for ReadOnlyStorage {
  fn open_partition(&self, name: &str) -> Result<()> {
    self.inner.open_partition(name)
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    self.inner.partition_names()
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    self.inner.delete_partition(name)
  }

  fn put(&self, partition: &str, _key: &RequestKey, _response: &Response) -> Result<()> {
    Err(eyre!("disk full writing {}", partition))
  }

  fn put_all(&self, partition: &str, _entries: &[(RequestKey, Response)]) -> Result<()> {
    Err(eyre!("disk full writing {}", partition))
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.inner.get(partition, key)
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.inner.match_any(key)
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    self.inner.entry_count(partition)
  }
}
