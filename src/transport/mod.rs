//! Transport abstraction and the process-wide default transport.

mod offline;

pub use offline::{OfflineTransport, Options};

use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use reqwest::{Request, Response};
use thiserror::Error;

use crate::error::BoxError;

/// Turns a request into a response.
///
/// Implemented for [`reqwest::Client`], which performs the request over the
/// network, and by [`OfflineTransport`], which wraps another transport.
pub trait Transport: Send + Sync {
  fn execute(&self, request: Request) -> BoxFuture<'_, Result<Response, BoxError>>;
}

impl Transport for reqwest::Client {
  fn execute(&self, request: Request) -> BoxFuture<'_, Result<Response, BoxError>> {
    Box::pin(async move {
      reqwest::Client::execute(self, request)
        .await
        .map_err(Into::into)
    })
  }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
  fn execute(&self, request: Request) -> BoxFuture<'_, Result<Response, BoxError>> {
    (**self).execute(request)
  }
}

static DEFAULT_TRANSPORT: OnceLock<Arc<dyn Transport>> = OnceLock::new();

/// Returned when a default transport has already been installed.
#[derive(Debug, Error)]
#[error("a default transport is already installed")]
pub struct AlreadyInstalled;

/// Install `transport` as the process-wide default.
///
/// Only the first call succeeds; the default cannot be replaced afterwards.
pub fn install_default<T: Transport + 'static>(transport: T) -> Result<(), AlreadyInstalled> {
  DEFAULT_TRANSPORT
    .set(Arc::new(transport))
    .map_err(|_| AlreadyInstalled)
}

/// The transport installed with [`install_default`], if any.
pub fn default_transport() -> Option<Arc<dyn Transport>> {
  DEFAULT_TRANSPORT.get().cloned()
}
