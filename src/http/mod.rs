//! Request/response snapshots and the network fetcher abstraction.
//!
//! The router never talks to reqwest directly. It sees a [`Request`], asks a
//! [`Fetcher`] for a [`Response`], and stores that snapshot in a cache
//! partition. A fetch that returns `Err` is a transport failure; any HTTP
//! status, including 404 or 500, is a successful fetch.

mod fetcher;

pub use fetcher::{Fetcher, HttpFetcher};
pub(crate) use fetcher::is_hop_header;

use bytes::Bytes;
use reqwest::Method;
use url::Url;

/// How the client issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level document navigation
  Navigate,
  /// Anything else (subresources, fetch/XHR)
  #[default]
  Other,
}

/// An outbound request as seen at the interception boundary.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  pub mode: RequestMode,
}

impl Request {
  /// A plain GET for `url`.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: Vec::new(),
      body: Bytes::new(),
      mode: RequestMode::Other,
    }
  }

  /// A GET issued as a document navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// First value of header `name` (case-insensitive).
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map(|accept| accept.contains("text/html"))
      .unwrap_or(false)
  }
}

/// A full response snapshot: status, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Whether the status is in the 2xx range. Only these get cached.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Minimal HTML answer for a navigation that has neither network nor cache.
  pub fn offline_page() -> Self {
    Self::new(503, OFFLINE_HTML).with_header("content-type", "text/html; charset=utf-8")
  }

  /// JSON answer for an API request that has neither network nor cache.
  pub fn offline_api() -> Self {
    Self::new(503, OFFLINE_JSON).with_header("content-type", "application/json")
  }
}

const OFFLINE_HTML: &str =
  "<html><body><h1>No connection</h1><p>Check your internet connection</p></body></html>";

const OFFLINE_JSON: &str = r#"{"detail":"offline"}"#;

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(n, _)| n.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_accepts_html_is_case_insensitive_on_header_name() {
    let req = Request::get(url("https://x.test/menu"))
      .with_header("Accept", "text/html,application/xhtml+xml");
    assert!(req.accepts_html());
    assert!(!Request::get(url("https://x.test/menu")).accepts_html());
  }

  #[test]
  fn test_is_ok_range() {
    assert!(Response::new(200, "").is_ok());
    assert!(Response::new(204, "").is_ok());
    assert!(!Response::new(304, "").is_ok());
    assert!(!Response::new(404, "").is_ok());
  }

  #[test]
  fn test_offline_page_is_503_html() {
    let resp = Response::offline_page();
    assert_eq!(resp.status, 503);
    assert_eq!(resp.header("Content-Type"), Some("text/html; charset=utf-8"));
    assert!(std::str::from_utf8(&resp.body)
      .unwrap()
      .contains("No connection"));
  }
}
