//! Transport decorator that records responses and replays them offline.

use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Method, Request, Response, Url};

use super::Transport;
use crate::cache::{CacheKey, CachedResponse, Eligibility, RecordStore, SqliteStorage, StorageError};
use crate::error::{BoxError, Error};

/// Behaviour of an [`OfflineTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
  /// Serve cached responses without contacting the network when available
  pub prefer_cache: bool,
  /// Which network responses are written to the cache
  pub eligibility: Eligibility,
}

/// Transport that caches every round trip in a persistent store.
///
/// This sits between the caller and the network transport, providing
/// transparent caching with offline support:
///
/// 1. With `prefer_cache`, a cached response is returned without touching the network
/// 2. Otherwise the request goes to the wrapped transport
/// 3. If the network fails, a cached response is returned if one exists
/// 4. Eligible network responses are stored before being returned
pub struct OfflineTransport<T, S = SqliteStorage> {
  inner: T,
  store: Arc<S>,
  options: Options,
}

impl<T: Transport> OfflineTransport<T> {
  /// Wrap `inner`, storing records in a SQLite database under `dir`.
  pub fn open(inner: T, dir: &Path, options: Options) -> Result<Self, StorageError> {
    let storage = SqliteStorage::open(dir)?;
    tracing::debug!(dir = %dir.display(), "opened offline cache");
    Ok(Self::new(inner, storage, options))
  }
}

impl<T: Transport, S: RecordStore> OfflineTransport<T, S> {
  pub fn new(inner: T, store: S, options: Options) -> Self {
    Self {
      inner,
      store: Arc::new(store),
      options,
    }
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  pub fn options(&self) -> Options {
    self.options
  }

  /// Perform a request, consulting and updating the cache.
  pub async fn round_trip(&self, mut request: Request) -> Result<Response, Error> {
    let key = CacheKey::from_request(&mut request).await?;
    let method = request.method().clone();
    let url = request.url().clone();

    if self.options.prefer_cache {
      if let Some(cached) = self.fetch(&key, &method) {
        tracing::debug!(key = %key, url = key.description(), "cache hit");
        return Ok(cached.into_response(url));
      }
    }

    let response = match self.inner.execute(request).await {
      Ok(response) => response,
      Err(error) => return self.fallback(&key, &method, url, error),
    };

    let status = response.status();
    if !self.options.eligibility.allows(status) {
      tracing::debug!(url = key.description(), %status, "response not eligible for caching");
      return Ok(response);
    }

    // Redirects may have moved the final URL away from the request URL
    let final_url = response.url().clone();

    // A body that fails mid-read never fully arrived, same as a failed dispatch
    let cached = match CachedResponse::from_response(response).await {
      Ok(cached) => cached,
      Err(error) => return self.fallback(&key, &method, url, error.into()),
    };

    self.store.put(&key, &cached.encode())?;
    tracing::info!(key = %key, url = key.description(), %status, "cached endpoint");

    Ok(cached.into_response(final_url))
  }

  /// Look up the cached response for a request without using the network.
  pub async fn lookup(&self, request: &mut Request) -> Result<Option<CachedResponse>, Error> {
    let key = CacheKey::from_request(request).await?;
    Ok(self.fetch(&key, request.method()))
  }

  /// Read and decode a record. Misses, read failures and undecodable
  /// records all come back as `None`.
  fn fetch(&self, key: &CacheKey, method: &Method) -> Option<CachedResponse> {
    let record = match self.store.get(key) {
      Ok(Some(record)) => record,
      Ok(None) => {
        tracing::debug!(key = %key, url = key.description(), "cache miss");
        return None;
      }
      Err(error) => {
        tracing::warn!(key = %key, %error, "cache lookup failed");
        return None;
      }
    };

    match CachedResponse::decode(&record, method) {
      Ok(cached) => Some(cached),
      Err(error) => {
        tracing::warn!(key = %key, url = key.description(), %error, "ignoring undecodable cache record");
        None
      }
    }
  }

  fn fallback(
    &self,
    key: &CacheKey,
    method: &Method,
    url: Url,
    error: BoxError,
  ) -> Result<Response, Error> {
    match self.fetch(key, method) {
      Some(cached) => {
        tracing::info!(url = key.description(), %error, "network unavailable, serving cached response");
        Ok(cached.into_response(url))
      }
      None => Err(Error::Network(error)),
    }
  }
}

impl<T: Transport, S: RecordStore> Transport for OfflineTransport<T, S> {
  fn execute(&self, request: Request) -> BoxFuture<'_, Result<Response, BoxError>> {
    Box::pin(async move {
      // Network errors pass through as the inner transport produced them
      self.round_trip(request).await.map_err(|error| match error {
        Error::Network(error) => error,
        other => other.into(),
      })
    })
  }
}

impl<T: Clone, S> Clone for OfflineTransport<T, S> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
      store: Arc::clone(&self.store),
      options: self.options,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use reqwest::{Body, ResponseBuilderExt, StatusCode};
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Network stand-in that counts calls.
  enum Reply {
    /// Respond with this status and body
    Status(u16, &'static str),
    /// Echo the request path as a 200 body
    EchoPath,
    /// Fail at the transport level
    Fail(&'static str),
    /// Send a 200 whose body breaks off partway through
    BrokenBody,
  }

  struct StubTransport {
    reply: Reply,
    calls: AtomicUsize,
  }

  impl StubTransport {
    fn new(reply: Reply) -> Arc<Self> {
      Arc::new(Self {
        reply,
        calls: AtomicUsize::new(0),
      })
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  impl Transport for StubTransport {
    fn execute(&self, request: Request) -> BoxFuture<'_, Result<Response, BoxError>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let url = request.url().clone();
      let result = match &self.reply {
        Reply::Status(status, body) => Ok(response(url, *status, body.to_string())),
        Reply::EchoPath => {
          let path = url.path().to_string();
          Ok(response(url, 200, path))
        }
        Reply::Fail(message) => Err(BoxError::from(*message)),
        Reply::BrokenBody => Ok(broken_response(url)),
      };
      Box::pin(async move { result })
    }
  }

  /// Store whose writes always fail.
  struct ReadOnlyStore;

  impl RecordStore for ReadOnlyStore {
    fn get(&self, _key: &CacheKey) -> Result<Option<Vec<u8>>, StorageError> {
      Ok(None)
    }

    fn put(&self, _key: &CacheKey, _record: &[u8]) -> Result<(), StorageError> {
      Err(StorageError::Poisoned)
    }
  }

  /// Store whose reads always fail.
  struct UnreadableStore;

  impl RecordStore for UnreadableStore {
    fn get(&self, _key: &CacheKey) -> Result<Option<Vec<u8>>, StorageError> {
      Err(StorageError::Poisoned)
    }

    fn put(&self, _key: &CacheKey, _record: &[u8]) -> Result<(), StorageError> {
      Ok(())
    }
  }

  fn response(url: Url, status: u16, body: String) -> Response {
    Response::from(
      http::Response::builder()
        .status(status)
        .url(url)
        .header("content-type", "text/plain")
        .body(body)
        .unwrap(),
    )
  }

  fn broken_response(url: Url) -> Response {
    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
      Ok(Bytes::from_static(b"partial")),
      Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
    ];
    Response::from(
      http::Response::builder()
        .status(200)
        .url(url)
        .body(Body::wrap_stream(futures::stream::iter(chunks)))
        .unwrap(),
    )
  }

  fn get(url: &str) -> Request {
    Request::new(Method::GET, Url::parse(url).unwrap())
  }

  fn transport(
    stub: &Arc<StubTransport>,
    options: Options,
  ) -> OfflineTransport<Arc<StubTransport>> {
    OfflineTransport::new(
      Arc::clone(stub),
      SqliteStorage::open_in_memory().unwrap(),
      options,
    )
  }

  fn seed(transport: &OfflineTransport<Arc<StubTransport>>, url: &str, body: &'static str) {
    let key = CacheKey::new(&Method::GET, &Url::parse(url).unwrap(), None);
    let record = CachedResponse::new(StatusCode::OK, Default::default(), body);
    transport.store().put(&key, &record.encode()).unwrap();
  }

  #[tokio::test]
  async fn test_network_response_is_cached() {
    let stub = StubTransport::new(Reply::Status(200, "fresh"));
    let transport = transport(&stub, Options::default());

    let response = transport.round_trip(get("http://example.com/a")).await.unwrap();
    assert_eq!(response.url().as_str(), "http://example.com/a");
    assert_eq!(response.text().await.unwrap(), "fresh");

    let cached = transport
      .lookup(&mut get("http://example.com/a"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(cached.status(), StatusCode::OK);
    assert_eq!(cached.headers()["content-type"], "text/plain");
    assert_eq!(cached.body().as_ref(), b"fresh");
  }

  #[tokio::test]
  async fn test_prefer_cache_skips_network() {
    let stub = StubTransport::new(Reply::Status(200, "from network"));
    let transport = transport(
      &stub,
      Options {
        prefer_cache: true,
        ..Options::default()
      },
    );
    seed(&transport, "http://example.com/a", "from cache");

    let response = transport.round_trip(get("http://example.com/a")).await.unwrap();

    assert_eq!(response.url().as_str(), "http://example.com/a");
    assert_eq!(response.text().await.unwrap(), "from cache");
    assert_eq!(stub.calls(), 0);
  }

  #[tokio::test]
  async fn test_prefer_cache_miss_goes_to_network() {
    let stub = StubTransport::new(Reply::Status(200, "from network"));
    let transport = transport(
      &stub,
      Options {
        prefer_cache: true,
        ..Options::default()
      },
    );

    let response = transport.round_trip(get("http://example.com/a")).await.unwrap();

    assert_eq!(response.text().await.unwrap(), "from network");
    assert_eq!(stub.calls(), 1);
  }

  #[tokio::test]
  async fn test_network_first_without_prefer_cache() {
    let stub = StubTransport::new(Reply::Status(200, "from network"));
    let transport = transport(&stub, Options::default());
    seed(&transport, "http://example.com/a", "from cache");

    let response = transport.round_trip(get("http://example.com/a")).await.unwrap();

    assert_eq!(response.text().await.unwrap(), "from network");
    assert_eq!(stub.calls(), 1);
  }

  #[tokio::test]
  async fn test_fallback_on_network_failure() {
    let stub = StubTransport::new(Reply::Fail("connection refused"));
    let transport = transport(&stub, Options::default());
    seed(&transport, "http://example.com/a", "from cache");

    let response = transport.round_trip(get("http://example.com/a")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.url().as_str(), "http://example.com/a");
    assert_eq!(response.text().await.unwrap(), "from cache");
    assert_eq!(stub.calls(), 1);
  }

  #[tokio::test]
  async fn test_execute_returns_inner_error() {
    let stub = StubTransport::new(Reply::Fail("connection refused"));
    let transport = transport(&stub, Options::default());

    let err = transport
      .execute(get("http://example.com/a"))
      .await
      .unwrap_err();

    assert_eq!(err.to_string(), "connection refused");
    assert!(err.downcast_ref::<Error>().is_none());
  }

  #[tokio::test]
  async fn test_broken_body_falls_back_to_cache() {
    let stub = StubTransport::new(Reply::BrokenBody);
    let transport = transport(&stub, Options::default());
    seed(&transport, "http://example.com/a", "from cache");

    let response = transport.round_trip(get("http://example.com/a")).await.unwrap();

    assert_eq!(response.url().as_str(), "http://example.com/a");
    assert_eq!(response.text().await.unwrap(), "from cache");
    assert_eq!(stub.calls(), 1);
  }

  #[tokio::test]
  async fn test_broken_body_without_record_is_network_error() {
    let stub = StubTransport::new(Reply::BrokenBody);
    let transport = transport(&stub, Options::default());

    let err = transport
      .round_trip(get("http://example.com/a"))
      .await
      .unwrap_err();

    assert!(matches!(err, Error::Network(_)));
    assert!(transport.store().is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_store_read_failure_is_a_miss() {
    let stub = StubTransport::new(Reply::Status(200, "from network"));
    let transport = OfflineTransport::new(
      Arc::clone(&stub),
      UnreadableStore,
      Options {
        prefer_cache: true,
        ..Options::default()
      },
    );

    let response = transport.round_trip(get("http://example.com/a")).await.unwrap();

    assert_eq!(response.text().await.unwrap(), "from network");
    assert_eq!(stub.calls(), 1);
  }

  #[tokio::test]
  async fn test_network_error_returned_unchanged() {
    let stub = StubTransport::new(Reply::Fail("connection refused"));
    let transport = transport(&stub, Options::default());

    let err = transport
      .round_trip(get("http://example.com/a"))
      .await
      .unwrap_err();

    assert!(matches!(err, Error::Network(_)));
    assert_eq!(
      err.network_error().map(ToString::to_string).as_deref(),
      Some("connection refused")
    );
  }

  #[tokio::test]
  async fn test_undecodable_record_is_a_miss() {
    let stub = StubTransport::new(Reply::Status(200, "from network"));
    let transport = transport(
      &stub,
      Options {
        prefer_cache: true,
        ..Options::default()
      },
    );
    let key = CacheKey::new(
      &Method::GET,
      &Url::parse("http://example.com/a").unwrap(),
      None,
    );
    transport.store().put(&key, b"garbage").unwrap();

    let response = transport.round_trip(get("http://example.com/a")).await.unwrap();

    assert_eq!(response.text().await.unwrap(), "from network");
    assert_eq!(stub.calls(), 1);
  }

  #[tokio::test]
  async fn test_error_status_cached_by_default() {
    let stub = StubTransport::new(Reply::Status(500, "boom"));
    let transport = transport(&stub, Options::default());

    let response = transport.round_trip(get("http://example.com/a")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let cached = transport
      .lookup(&mut get("http://example.com/a"))
      .await
      .unwrap();
    assert_eq!(cached.map(|c| c.status()), Some(StatusCode::INTERNAL_SERVER_ERROR));
  }

  #[tokio::test]
  async fn test_only_status_filter() {
    let options = Options {
      eligibility: Eligibility::only_status(200).unwrap(),
      ..Options::default()
    };

    let not_found = StubTransport::new(Reply::Status(404, "missing"));
    let transport_404 = transport(&not_found, options);
    let response = transport_404
      .round_trip(get("http://example.com/gone"))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.text().await.unwrap(), "missing");
    assert!(transport_404
      .lookup(&mut get("http://example.com/gone"))
      .await
      .unwrap()
      .is_none());

    let ok = StubTransport::new(Reply::Status(200, "here"));
    let transport_200 = transport(&ok, options);
    transport_200
      .round_trip(get("http://example.com/here"))
      .await
      .unwrap();
    assert!(transport_200
      .lookup(&mut get("http://example.com/here"))
      .await
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_store_failure_is_surfaced() {
    let stub = StubTransport::new(Reply::Status(200, "fresh"));
    let transport = OfflineTransport::new(Arc::clone(&stub), ReadOnlyStore, Options::default());

    let err = transport
      .round_trip(get("http://example.com/a"))
      .await
      .unwrap_err();

    assert!(matches!(err, Error::StoreWrite(StorageError::Poisoned)));
    assert_eq!(stub.calls(), 1);
  }

  #[tokio::test]
  async fn test_request_body_reaches_network_and_key() {
    let stub = StubTransport::new(Reply::Status(200, "ok"));
    let transport = transport(&stub, Options::default());

    let mut post = Request::new(Method::POST, Url::parse("http://example.com/q").unwrap());
    *post.body_mut() = Some("query=1".into());
    transport.round_trip(post).await.unwrap();

    let mut same = Request::new(Method::POST, Url::parse("http://example.com/q").unwrap());
    *same.body_mut() = Some("query=1".into());
    let mut different = Request::new(Method::POST, Url::parse("http://example.com/q").unwrap());
    *different.body_mut() = Some("query=2".into());

    assert!(transport.lookup(&mut same).await.unwrap().is_some());
    assert!(transport.lookup(&mut different).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cached_response_replayed_after_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let online = StubTransport::new(Reply::Status(200, "recorded"));
    OfflineTransport::open(Arc::clone(&online), dir.path(), Options::default())
      .unwrap()
      .round_trip(get("http://example.com/a"))
      .await
      .unwrap();

    let offline = StubTransport::new(Reply::Fail("offline"));
    let response = OfflineTransport::open(Arc::clone(&offline), dir.path(), Options::default())
      .unwrap()
      .round_trip(get("http://example.com/a"))
      .await
      .unwrap();

    assert_eq!(offline.calls(), 1);
    assert_eq!(response.url().as_str(), "http://example.com/a");
    assert_eq!(response.text().await.unwrap(), "recorded");
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_distinct_urls() {
    let stub = StubTransport::new(Reply::EchoPath);
    let transport = Arc::new(transport(&stub, Options::default()));

    let tasks: Vec<_> = (0..16)
      .map(|i| {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
          let url = format!("http://example.com/item/{}", i);
          transport.round_trip(get(&url)).await.unwrap().text().await.unwrap()
        })
      })
      .collect();

    for (i, task) in tasks.into_iter().enumerate() {
      assert_eq!(task.await.unwrap(), format!("/item/{}", i));
    }

    assert_eq!(stub.calls(), 16);
    assert_eq!(transport.store().len().unwrap(), 16);
    for i in 0..16 {
      let url = format!("http://example.com/item/{}", i);
      let cached = transport.lookup(&mut get(&url)).await.unwrap().unwrap();
      assert_eq!(cached.body().as_ref(), format!("/item/{}", i).as_bytes());
    }
  }

  #[tokio::test]
  async fn test_decorators_stack() {
    let stub = StubTransport::new(Reply::Status(200, "inner"));
    let inner = Arc::new(transport(&stub, Options::default()));
    let outer = OfflineTransport::new(
      Arc::clone(&inner),
      SqliteStorage::open_in_memory().unwrap(),
      Options::default(),
    );

    let response = outer.execute(get("http://example.com/a")).await.unwrap();

    assert_eq!(response.text().await.unwrap(), "inner");
    assert_eq!(inner.store().len().unwrap(), 1);
    assert_eq!(outer.store().len().unwrap(), 1);
  }
}
