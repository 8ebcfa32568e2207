//! Cache key derivation for outgoing requests.

use std::fmt;

use bytes::Bytes;
use http_body_util::BodyExt;
use reqwest::{Body, Method, Request, Url};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Identifies the cached response for a request.
///
/// The identity is a SHA-256 over the method, full URL and body. Every
/// component is length-prefixed before hashing, so separators inside a URL or
/// body can never make two different requests share a key. A request without a
/// body and one with an empty body are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  hash: String,
  /// `METHOD URL`, for logs and listings only
  description: String,
}

impl CacheKey {
  /// Build a key from already buffered request parts.
  pub fn new(method: &Method, url: &Url, body: Option<&[u8]>) -> Self {
    let mut hasher = Sha256::new();
    update_component(&mut hasher, method.as_str().as_bytes());
    update_component(&mut hasher, url.as_str().as_bytes());
    match body {
      Some(body) => {
        hasher.update([1u8]);
        update_component(&mut hasher, body);
      }
      None => hasher.update([0u8]),
    }

    Self {
      hash: hex::encode(hasher.finalize()),
      description: format!("{} {}", method, url),
    }
  }

  /// Derive the key for a request.
  ///
  /// A streaming body is drained into memory and replaced with a buffered body
  /// holding the same bytes, so the request can still be sent afterwards.
  pub async fn from_request(request: &mut Request) -> Result<Self, Error> {
    let body = buffer_body(request)
      .await
      .map_err(Error::KeyDerivation)?;
    Ok(Self::new(request.method(), request.url(), body.as_deref()))
  }

  /// Hex digest used as the storage key.
  pub fn as_str(&self) -> &str {
    &self.hash
  }

  pub fn description(&self) -> &str {
    &self.description
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.hash)
  }
}

fn update_component(hasher: &mut Sha256, bytes: &[u8]) {
  hasher.update((bytes.len() as u64).to_be_bytes());
  hasher.update(bytes);
}

/// Read the request body into memory, leaving an equivalent body in its place.
async fn buffer_body(request: &mut Request) -> Result<Option<Bytes>, reqwest::Error> {
  let Some(body) = request.body_mut().take() else {
    return Ok(None);
  };

  let buffered = body.as_bytes().map(Bytes::copy_from_slice);
  let bytes = match buffered {
    Some(bytes) => {
      *request.body_mut() = Some(body);
      bytes
    }
    None => {
      let bytes = body.collect().await?.to_bytes();
      *request.body_mut() = Some(Body::from(bytes.clone()));
      bytes
    }
  };

  Ok(Some(bytes))
}
