//! Errors surfaced by the offline transport.

use thiserror::Error;

use crate::cache::StorageError;

/// Boxed error produced by an underlying [`Transport`](crate::transport::Transport).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned from a round trip through [`OfflineTransport`](crate::transport::OfflineTransport).
///
/// Cache misses and undecodable records never show up here: they only decide
/// whether the network or the fallback path is taken.
#[derive(Debug, Error)]
pub enum Error {
  /// The request body could not be drained while deriving the cache key.
  #[error("failed to read request body for cache key: {0}")]
  KeyDerivation(#[source] reqwest::Error),

  /// The underlying transport failed and no cached response was available.
  #[error("network request failed: {0}")]
  Network(#[source] BoxError),

  /// The response arrived but could not be written to the cache.
  #[error("failed to store response in cache: {0}")]
  StoreWrite(#[from] StorageError),
}

impl Error {
  /// Returns the original transport error if this is a network failure.
  pub fn network_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
    match self {
      Self::Network(error) => Some(error.as_ref()),
      _ => None,
    }
  }
}
