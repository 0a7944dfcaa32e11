use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin every intercepted request is resolved against
  pub origin: Url,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub routes: RoutesConfig,
  /// URLs fetched and stored when a cache version is installed
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  #[serde(default)]
  pub fallbacks: FallbacksConfig,
  #[serde(default)]
  pub images: ImagesConfig,
  #[serde(default)]
  pub server: ServerConfig,
  /// Write logs to this file instead of stderr
  pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Version tag; bumping it purges every partition of older versions
  #[serde(default = "default_version")]
  pub version: String,
  /// SQLite database path (defaults to $XDG_DATA_HOME/larder/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_version(),
      path: None,
    }
  }
}

/// Path patterns used to classify requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Requests under this prefix are never intercepted
  pub admin_prefix: String,
  #[serde(deserialize_with = "deserialize_lowercase_vec")]
  pub static_extensions: Vec<String>,
  pub static_prefixes: Vec<String>,
  #[serde(deserialize_with = "deserialize_lowercase_vec")]
  pub image_extensions: Vec<String>,
  pub image_prefixes: Vec<String>,
  pub api_prefix: String,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      admin_prefix: "/admin".to_string(),
      static_extensions: strings(&["css", "js", "woff", "woff2", "ttf", "eot"]),
      static_prefixes: strings(&["/static/css/", "/static/js/"]),
      image_extensions: strings(&["webp", "avif", "jpg", "jpeg", "png", "gif", "svg", "ico"]),
      image_prefixes: strings(&["/static/uploads/", "/static/images/"]),
      api_prefix: "/api/".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbacksConfig {
  /// Served to navigations when both network and cache fail
  pub offline_page: String,
  /// Served to image requests when both network and cache fail
  pub placeholder_image: String,
}

impl Default for FallbacksConfig {
  fn default() -> Self {
    Self {
      offline_page: "/offline".to_string(),
      placeholder_image: "/static/images/placeholder.webp".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImagesConfig {
  /// Whether clients decode AVIF
  #[serde(default)]
  pub next_gen_format: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      listen: default_listen(),
    }
  }
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_precache() -> Vec<String> {
  strings(&[
    "/",
    "/static/css/base/base.css",
    "/static/css/main/main.css",
    "/static/js/network-adapter.js",
    "/static/js/progressive-image.js",
    "/static/js/lazy-load.js",
    "/offline",
  ])
}

fn strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

fn deserialize_lowercase_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./larder.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/larder/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    Self::load_found(path)
  }

  fn load_found(path: Option<PathBuf>) -> Result<Self> {
    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/larder/config.yaml \
         with at least an `origin:` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("larder.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("larder").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Resolve a manifest or fallback path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid URL '{}' relative to {}: {}", path, self.origin, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_gets_defaults() {
    let config = Config::parse("origin: https://menu.example.com\n").unwrap();
    assert_eq!(config.cache.version, "v1");
    assert_eq!(config.routes.admin_prefix, "/admin");
    assert_eq!(config.routes.api_prefix, "/api/");
    assert_eq!(config.precache.len(), 7);
    assert!(config.precache.contains(&"/offline".to_string()));
    assert_eq!(config.fallbacks.offline_page, "/offline");
    assert!(!config.images.next_gen_format);
    assert_eq!(config.server.listen.port(), 8080);
  }

  #[test]
  fn test_extensions_are_normalized() {
    let config = Config::parse(
      "origin: https://menu.example.com\n\
       routes:\n  static_extensions: [\".CSS\", js]\n",
    )
    .unwrap();
    assert_eq!(config.routes.static_extensions, vec!["css", "js"]);
    // Fields left out keep their defaults
    assert_eq!(config.routes.image_prefixes.len(), 2);
  }

  #[test]
  fn test_missing_origin_is_an_error() {
    assert!(Config::parse("cache:\n  version: v2\n").is_err());
  }

  #[test]
  fn test_resolve_joins_against_origin() {
    let config = Config::parse("origin: https://menu.example.com/\n").unwrap();
    assert_eq!(
      config.resolve("/static/css/main/main.css").unwrap().as_str(),
      "https://menu.example.com/static/css/main/main.css"
    );
  }

  #[test]
  fn test_load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("larder.yaml");
    std::fs::write(&path, "origin: https://menu.example.com\ncache:\n  version: v3\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.cache.version, "v3");

    assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());
  }

  #[test]
  fn test_no_config_found_message_is_one_line() {
    let err = Config::load_found(None).unwrap_err().to_string();
    assert_eq!(
      err,
      "No configuration file found. Create one at ~/.config/larder/config.yaml \
       with at least an `origin:` entry."
    );
    assert!(!err.contains("  "));
  }
}
