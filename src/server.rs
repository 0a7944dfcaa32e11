//! Local HTTP proxy in front of the origin.
//!
//! Every inbound request is rewritten onto the configured origin and handed
//! to the caching router. Requests the router does not intercept are
//! forwarded as they are.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response as AxumResponse};
use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use url::Url;

use crate::cache::{CacheSource, CacheStorage};
use crate::http::{is_hop_header, Fetcher, Request, RequestMode, Response};
use crate::router::{Interception, Router};

/// Provenance of a served response.
pub const SOURCE_HEADER: HeaderName = HeaderName::from_static("x-larder-source");

pub struct ProxyState<F: Fetcher, S: CacheStorage> {
  router: Router<F, S>,
  origin: Url,
}

impl<F: Fetcher, S: CacheStorage> Clone for ProxyState<F, S> {
  fn clone(&self) -> Self {
    Self {
      router: self.router.clone(),
      origin: self.origin.clone(),
    }
  }
}

/// Build the proxy service.
pub fn app<F: Fetcher, S: CacheStorage>(router: Router<F, S>, origin: Url) -> axum::Router {
  axum::Router::new()
    .fallback(proxy::<F, S>)
    .layer(TraceLayer::new_for_http())
    .with_state(ProxyState { router, origin })
}

/// Bind `listen` and serve until the process is stopped.
pub async fn serve<F: Fetcher, S: CacheStorage>(
  router: Router<F, S>,
  origin: Url,
  listen: SocketAddr,
) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;

  info!(%origin, version = %router.version(), "larder listening on http://{}", listen);

  axum::serve(listener, app(router, origin))
    .await
    .map_err(|e| eyre!("Proxy server failed: {}", e))
}

async fn proxy<F: Fetcher, S: CacheStorage>(
  State(state): State<ProxyState<F, S>>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: Bytes,
) -> AxumResponse {
  let request = to_request(&state.origin, method, &uri, &headers, body);

  match state.router.handle(&request).await {
    Ok(Interception::Served(served)) => into_axum(served.data, Some(served.source)),
    Ok(Interception::Bypass) => match state.router.fetcher().fetch(&request).await {
      Ok(response) => into_axum(response, None),
      Err(e) => {
        error!("Forwarding {} failed: {}", request.url, e);
        (StatusCode::BAD_GATEWAY, "origin unavailable").into_response()
      }
    },
    Err(e) => {
      error!("No response for {}: {}", request.url, e);
      (StatusCode::BAD_GATEWAY, "origin unavailable").into_response()
    }
  }
}

fn to_request(
  origin: &Url,
  method: Method,
  uri: &Uri,
  headers: &HeaderMap,
  body: Bytes,
) -> Request {
  // The target only ever supplies path and query; scheme and host stay the
  // origin's, so `//other.host/...` cannot redirect the fetch.
  let mut url = origin.clone();
  url.set_path(uri.path());
  url.set_query(uri.query());

  let headers: Vec<(String, String)> = headers
    .iter()
    .filter(|(name, _)| !is_hop_header(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let navigate = headers
    .iter()
    .any(|(name, value)| name == "sec-fetch-mode" && value.eq_ignore_ascii_case("navigate"));

  Request {
    method,
    url,
    headers,
    body,
    mode: if navigate {
      RequestMode::Navigate
    } else {
      RequestMode::Other
    },
  }
}

fn into_axum(response: Response, source: Option<CacheSource>) -> AxumResponse {
  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);

  let mut headers = HeaderMap::new();
  for (name, value) in &response.headers {
    if is_hop_header(name) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  if let Some(source) = source {
    headers.insert(SOURCE_HEADER, HeaderValue::from_static(source.as_str()));
  }

  (status, headers, Body::from(response.body)).into_response()
}
