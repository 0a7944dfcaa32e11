//! Partition naming and request key normalization.

use reqwest::Method;
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// The four persistent partitions, one per resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
  Static,
  Images,
  Pages,
  Api,
}

impl Partition {
  pub const ALL: [Partition; 4] = [
    Partition::Static,
    Partition::Images,
    Partition::Pages,
    Partition::Api,
  ];

  fn prefix(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Images => "images",
      Self::Pages => "pages",
      Self::Api => "api",
    }
  }
}

/// Version tag shared by all partitions of one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVersion(String);

impl CacheVersion {
  pub fn new(tag: impl Into<String>) -> Self {
    Self(tag.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Storage name of `partition` under this version, e.g. `images-v1`.
  pub fn partition_name(&self, partition: Partition) -> String {
    format!("{}-{}", partition.prefix(), self.0)
  }

  /// The only partition names allowed to survive activation.
  pub fn partition_names(&self) -> [String; 4] {
    Partition::ALL.map(|p| self.partition_name(p))
  }

  pub fn owns(&self, name: &str) -> bool {
    self.partition_names().iter().any(|n| n == name)
  }

  /// Version a partition name belongs to, if it is one of ours.
  pub fn from_partition_name(name: &str) -> Option<Self> {
    Partition::ALL.iter().find_map(|p| {
      name
        .strip_prefix(p.prefix())
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|tag| !tag.is_empty())
        .map(Self::new)
    })
  }
}

impl Default for CacheVersion {
  fn default() -> Self {
    Self::new("v1")
  }
}

impl fmt::Display for CacheVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Normalized request identity: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  identity: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    let url = url.to_string();

    Self {
      identity: format!("{} {}", method.as_str(), url),
      url,
    }
  }

  /// Key for a GET of `url`. Everything the router stores is a GET.
  pub fn get(url: &Url) -> Self {
    Self::new(&Method::GET, url)
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 of the identity, used as the storage primary key.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.identity.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.identity)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partition_names_follow_version() {
    let v2 = CacheVersion::new("v2");
    assert_eq!(
      v2.partition_names(),
      ["static-v2", "images-v2", "pages-v2", "api-v2"].map(String::from)
    );
    assert!(v2.owns("api-v2"));
    assert!(!v2.owns("api-v1"));
    assert!(!v2.owns("scratch"));
  }

  #[test]
  fn test_version_from_partition_name() {
    assert_eq!(
      CacheVersion::from_partition_name("images-v1"),
      Some(CacheVersion::new("v1"))
    );
    assert_eq!(
      CacheVersion::from_partition_name("static-2024-06"),
      Some(CacheVersion::new("2024-06"))
    );
    assert_eq!(CacheVersion::from_partition_name("api-"), None);
    assert_eq!(CacheVersion::from_partition_name("scratch"), None);
  }

  #[test]
  fn test_request_key_ignores_fragment() {
    let a = RequestKey::get(&Url::parse("https://x.test/menu?lang=en#dish-4").unwrap());
    let b = RequestKey::get(&Url::parse("https://x.test/menu?lang=en").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.digest(), b.digest());
    assert_eq!(a.to_string(), "GET https://x.test/menu?lang=en");
  }

  #[test]
  fn test_request_key_depends_on_query_and_method() {
    let url = Url::parse("https://x.test/api/dishes").unwrap();
    let with_query = Url::parse("https://x.test/api/dishes?page=2").unwrap();
    assert_ne!(RequestKey::get(&url).digest(), RequestKey::get(&with_query).digest());
    assert_ne!(
      RequestKey::get(&url).digest(),
      RequestKey::new(&Method::HEAD, &url).digest()
    );
  }
}
