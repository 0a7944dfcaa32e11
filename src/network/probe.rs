//! Next-generation image format support probes.

use color_eyre::Result;
use futures::future::BoxFuture;

/// Answers whether the client can decode the next-generation image format.
///
/// The monitor runs a probe at most once and memoizes the answer. An `Err`
/// is read as "unsupported".
pub trait FormatProbe: Send + Sync {
  fn probe(&self) -> BoxFuture<'_, Result<bool>>;
}

/// Probe with a fixed answer.
///
/// larder never decodes an image itself. The value comes from the
/// `images.next_gen_format` config entry and stands in for the client's
/// decode capability; nothing is tested at runtime.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

impl FormatProbe for StaticProbe {
  fn probe(&self) -> BoxFuture<'_, Result<bool>> {
    let supported = self.0;
    Box::pin(async move { Ok(supported) })
  }
}
