//! Version install (precache) and activation (purge of stale partitions).

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use tracing::{info, warn};

use super::Router;
use crate::cache::{CacheStorage, CacheVersion, Partition, RequestKey};
use crate::http::{Fetcher, Request};

/// What a successful install + activate did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
  /// Manifest entries stored
  pub precached: usize,
  /// Partitions deleted because they belong to another version
  pub purged: Vec<String>,
}

impl<F: Fetcher, S: CacheStorage> Router<F, S> {
  /// Fetch the whole precache manifest and store it in the static partition.
  ///
  /// All or nothing: if any entry fails to fetch or answers with a non-OK
  /// status, nothing is written and the error is returned.
  pub async fn install(&self) -> Result<usize> {
    let fetches = self.manifest.iter().map(|url| async move {
      let response = self.fetcher.fetch(&Request::get(url.clone())).await?;
      if !response.is_ok() {
        return Err(eyre!("Precache of {} failed with status {}", url, response.status));
      }
      Ok((RequestKey::get(url), response))
    });

    let entries = try_join_all(fetches).await?;

    let partition = self.version.partition_name(Partition::Static);
    self.storage.put_all(&partition, &entries)?;

    info!(count = entries.len(), %partition, "Precached manifest");
    Ok(entries.len())
  }

  /// Make the current version the only one present: create its four
  /// partitions and delete every other partition.
  pub fn activate(&self) -> Result<Vec<String>> {
    for name in self.version.partition_names() {
      self.storage.open_partition(&name)?;
    }

    let mut purged = Vec::new();
    for name in self.storage.partition_names()? {
      if self.version.owns(&name) {
        continue;
      }
      if self.storage.delete_partition(&name)? {
        info!(partition = %name, "Deleted old cache");
        purged.push(name);
      }
    }

    Ok(purged)
  }

  /// Install, then activate. A failed install leaves activation undone.
  pub async fn install_and_activate(&self) -> Result<ActivationReport> {
    let precached = self.install().await?;
    let purged = self.activate()?;

    info!(version = %self.version, precached, purged = purged.len(), "Cache version activated");
    Ok(ActivationReport { precached, purged })
  }

  /// Most recently created other version whose four partitions all exist.
  pub fn previous_version(&self) -> Result<Option<CacheVersion>> {
    let names = self.storage.partition_names()?;

    let previous = names
      .iter()
      .rev()
      .filter_map(|name| CacheVersion::from_partition_name(name))
      .filter(|version| version != &self.version)
      .find(|version| {
        version
          .partition_names()
          .iter()
          .all(|required| names.contains(required))
      });

    Ok(previous)
  }

  /// Install and activate this version. If the install fails, answer under
  /// the previously activated version instead, so new entries do not land
  /// in partitions of a version that never activated.
  pub async fn activate_or_keep_previous(&self) -> Result<Self> {
    let err = match self.install_and_activate().await {
      Ok(_) => return Ok(self.clone()),
      Err(e) => e,
    };

    match self.previous_version()? {
      Some(previous) => {
        warn!(version = %self.version, %previous, "Install failed, keeping previous cache version: {}", err);
        Ok(self.with_version(previous))
      }
      None => {
        warn!(version = %self.version, "Install failed and no previous cache version: {}", err);
        Ok(self.clone())
      }
    }
  }
}
