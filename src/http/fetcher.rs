use color_eyre::{eyre::eyre, Result};
use std::future::Future;

use super::{Request, Response};

/// Something that can put a request on the wire.
///
/// Implementors are cheap to clone; the router clones the fetcher into every
/// detached background refresh.
pub trait Fetcher: Clone + Send + Sync + 'static {
  /// Perform the request. `Err` means the transport failed; HTTP error
  /// statuses come back as `Ok`.
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// reqwest-backed fetcher used by the binary.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

/// Headers that describe the hop, not the resource.
const HOP_HEADERS: &[&str] = &[
  "connection",
  "host",
  "keep-alive",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "content-length",
];

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("larder/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      if is_hop_header(name) {
        continue;
      }
      builder = builder.header(name.as_str(), value.as_str());
    }

    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let resp = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = resp.status().as_u16();
    let headers = resp
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_header(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = resp
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

pub(crate) fn is_hop_header(name: &str) -> bool {
  HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}
