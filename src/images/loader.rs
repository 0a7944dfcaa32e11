use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use url::Url;

use crate::cache::CacheStorage;
use crate::http::{Fetcher, Request};
use crate::router::{Interception, Router};

/// Fetches an image completely before it is swapped into an element.
pub trait ImageLoader: Send + Sync + 'static {
  fn preload(&self, url: &str) -> BoxFuture<'static, Result<()>>;
}

/// Loads image bytes through the caching router, so progressive loads share
/// the images partition with every other image request.
pub struct RouterLoader<F: Fetcher, S: CacheStorage> {
  router: Router<F, S>,
  base: Url,
}

impl<F: Fetcher, S: CacheStorage> RouterLoader<F, S> {
  /// `base` resolves the relative URLs found in element attributes.
  pub fn new(router: Router<F, S>, base: Url) -> Self {
    Self { router, base }
  }
}

impl<F: Fetcher, S: CacheStorage> ImageLoader for RouterLoader<F, S> {
  fn preload(&self, url: &str) -> BoxFuture<'static, Result<()>> {
    let router = self.router.clone();
    let target = self.base.join(url);

    Box::pin(async move {
      let url = target.map_err(|e| eyre!("Invalid image URL: {}", e))?;
      let request = Request::get(url.clone()).with_header("accept", "image/avif,image/webp,image/*");

      let response = match router.handle(&request).await? {
        Interception::Served(served) => served.data,
        Interception::Bypass => router.fetcher().fetch(&request).await?,
      };

      if !response.is_ok() {
        return Err(eyre!("Image {} answered {}", url, response.status));
      }
      if response.body.is_empty() {
        return Err(eyre!("Image {} has an empty body", url));
      }

      Ok(())
    })
  }
}
