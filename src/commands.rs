//! Subcommand handlers. Each returns the text to print.

use color_eyre::{eyre::eyre, Result};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::cache::{CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::http::{Fetcher, HttpFetcher, Request};
use crate::images::{ImageLoader, Page, ProgressiveImageManager};
use crate::network::{ConnectionInfo, ConnectivitySignals, NetworkMonitor, StaticProbe};
use crate::router::{Interception, Router};
use crate::server;

pub fn open_storage(config: &Config) -> Result<SqliteStorage> {
  let path = match &config.cache.path {
    Some(path) => path.clone(),
    None => SqliteStorage::default_path()?,
  };
  SqliteStorage::open(&path)
}

pub fn build_router(config: &Config) -> Result<Router<HttpFetcher, SqliteStorage>> {
  Router::from_config(config, HttpFetcher::new()?, open_storage(config)?)
}

/// Activate the configured cache version, then serve the proxy.
///
/// If the install fails the proxy answers under the previously activated
/// version; activation is retried on the next start.
pub async fn serve(config: &Config) -> Result<()> {
  let router = build_router(config)?.activate_or_keep_previous().await?;
  info!(version = %router.version(), "Serving cache version");

  server::serve(router, config.origin.clone(), config.server.listen).await
}

pub async fn activate<F: Fetcher, S: CacheStorage>(router: &Router<F, S>) -> Result<String> {
  let report = router
    .install_and_activate()
    .await
    .map_err(|e| eyre!("Failed to activate cache version {}: {}", router.version(), e))?;

  let mut out = format!(
    "activated {}: {} precached, {} purged\n",
    router.version(),
    report.precached,
    report.purged.len()
  );
  for name in &report.purged {
    let _ = writeln!(out, "  - {}", name);
  }
  Ok(out)
}

/// Send one GET through the router and describe the answer.
pub async fn fetch<F: Fetcher, S: CacheStorage>(
  router: &Router<F, S>,
  url: Url,
  navigate: bool,
) -> Result<String> {
  let request = if navigate {
    Request::navigate(url).with_header("accept", "text/html")
  } else {
    Request::get(url)
  };
  let class = router
    .rules()
    .classify(&request)
    .map(|c| format!("{} ({})", c, c.strategy()))
    .unwrap_or_else(|| "not intercepted".to_string());

  let (response, source, cached_at) = match router.handle(&request).await? {
    Interception::Served(served) => (served.data, served.source.as_str(), served.cached_at),
    Interception::Bypass => (router.fetcher().fetch(&request).await?, "bypass", None),
  };

  let mut out = format!("{} {}\n", request.url, class);
  let _ = writeln!(
    out,
    "status {} from {}, {} bytes",
    response.status,
    source,
    response.body.len()
  );
  if let Some(at) = cached_at {
    let _ = writeln!(out, "cached at {}", at.to_rfc3339());
  }
  Ok(out)
}

/// List partitions with their entry counts; `*` marks the current version.
pub fn partitions<F: Fetcher, S: CacheStorage>(router: &Router<F, S>) -> Result<String> {
  let storage = router.storage();
  let mut out = String::new();

  for name in storage.partition_names()? {
    let marker = if router.version().owns(&name) { "*" } else { " " };
    let _ = writeln!(out, "{} {:<16} {}", marker, name, storage.entry_count(&name)?);
  }
  if out.is_empty() {
    out.push_str("no partitions\n");
  }
  Ok(out)
}

/// Classify connectivity signals and print the resulting quality change.
pub fn classify(signals: ConnectivitySignals) -> Result<String> {
  let monitor = NetworkMonitor::new(signals, Arc::new(StaticProbe(false)));
  serde_json::to_string_pretty(&monitor.snapshot())
    .map_err(|e| eyre!("Failed to serialize quality: {}", e))
}

pub fn load_page(path: &Path) -> Result<Page> {
  let contents = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read page file {}: {}", path.display(), e))?;
  serde_yaml::from_str(&contents)
    .map_err(|e| eyre!("Failed to parse page file {}: {}", path.display(), e))
}

/// Run the progressive image manager over `page` once, optionally followed
/// by a connection change, and return the resulting page as YAML.
pub async fn images<L: ImageLoader>(
  mut page: Page,
  signals: ConnectivitySignals,
  next_gen: bool,
  loader: L,
  change: Option<ConnectionInfo>,
) -> Result<String> {
  let mut monitor = NetworkMonitor::new(signals, Arc::new(StaticProbe(next_gen)));
  let mut manager = ProgressiveImageManager::new(&mut page, &monitor, loader).await;
  manager.attach(&mut monitor);

  manager.check_visibility(&mut page, &monitor).await;
  manager.settle(&mut page).await;

  if let Some(info) = change {
    monitor.update_connection(info);
    let upgraded = manager.process_events(&mut page, &monitor).await;
    manager.settle(&mut page).await;
    info!(upgraded, "Applied connection change");
  }
  manager.detach(&mut monitor);

  serde_yaml::to_string(&page).map_err(|e| eyre!("Failed to serialize page: {}", e))
}
