//! Wire-format records for cached responses.
//!
//! A record is the response exactly as it would appear on an HTTP/1.x
//! connection: status line, header lines, blank line, body. Decoding uses
//! [`httparse`], so anything stored must be a response a standard parser accepts.

use std::io::Write;

use bytes::Bytes;
use hyper::ext::ReasonPhrase;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use reqwest::{Method, Response, ResponseBuilderExt, StatusCode, Url, Version};
use thiserror::Error;

/// Errors produced when a stored record cannot be parsed back into a response.
#[derive(Debug, Error)]
pub enum DecodeError {
  #[error("record is not a valid HTTP response: {0}")]
  Parse(#[from] httparse::Error),

  #[error("record ends before the response head is complete")]
  Incomplete,

  #[error("invalid status code in record: {0}")]
  Status(#[from] http::status::InvalidStatusCode),

  #[error("invalid header name in record: {0}")]
  HeaderName(#[from] http::header::InvalidHeaderName),

  #[error("invalid header value in record: {0}")]
  HeaderValue(#[from] http::header::InvalidHeaderValue),

  #[error("invalid content-length in record")]
  ContentLength,

  #[error("record declares {expected} body bytes but holds {actual}")]
  Truncated { expected: usize, actual: usize },

  #[error("malformed chunked body in record")]
  Chunked,
}

/// A complete response held in memory.
///
/// Responses stream their body, so they are buffered into this form before
/// being written to the cache, and rebuilt from it when replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  status: StatusCode,
  /// Reason phrase, when the server sent a non-canonical one
  reason: Option<String>,
  version: Version,
  headers: HeaderMap,
  body: Bytes,
}

impl CachedResponse {
  /// Maximum number of headers accepted when decoding a record.
  const MAX_HEADERS: usize = 256;

  pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      reason: None,
      version: Version::HTTP_11,
      headers,
      body: body.into(),
    }
  }

  /// Drain a response body into memory.
  pub async fn from_response(response: Response) -> Result<Self, reqwest::Error> {
    let status = response.status();
    let reason = response
      .extensions()
      .get::<ReasonPhrase>()
      .and_then(|reason| std::str::from_utf8(reason.as_bytes()).ok())
      .map(str::to_owned);
    let version = response.version();
    let headers = response.headers().clone();
    let body = response.bytes().await?;

    Ok(Self {
      status,
      reason,
      version,
      headers,
      body,
    })
  }

  /// Rebuild a readable response over the buffered body, as the answer
  /// to a request for `url`.
  pub fn into_response(self, url: Url) -> Response {
    let mut builder = http::Response::builder().url(url);
    let mut extensions = builder
      .extensions_mut()
      .map(std::mem::take)
      .unwrap_or_default();
    if let Some(reason) = self.reason.and_then(|r| ReasonPhrase::try_from(r).ok()) {
      extensions.insert(reason);
    }

    let mut response = http::Response::new(self.body);
    *response.status_mut() = self.status;
    *response.version_mut() = self.version;
    *response.headers_mut() = self.headers;
    *response.extensions_mut() = extensions;
    Response::from(response)
  }

  pub fn status(&self) -> StatusCode {
    self.status
  }

  /// Reason phrase written in the status line.
  pub fn reason(&self) -> &str {
    self
      .reason
      .as_deref()
      .or(self.status.canonical_reason())
      .unwrap_or("")
  }

  pub fn version(&self) -> Version {
    self.version
  }

  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  pub fn body(&self) -> &Bytes {
    &self.body
  }

  /// Serialize into one contiguous HTTP/1.x response.
  ///
  /// A response that declares chunked transfer encoding gets a chunked body,
  /// so the stored header set stays consistent with its framing. The status
  /// line keeps a custom reason phrase if the server sent one.
  pub fn encode(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(self.body.len() + 64 * (self.headers.len() + 1));

    let version = if self.version == Version::HTTP_10 {
      "HTTP/1.0"
    } else {
      "HTTP/1.1"
    };
    // Writes into a Vec cannot fail.
    let _ = write!(
      out,
      "{} {} {}\r\n",
      version,
      self.status.as_u16(),
      self.reason()
    );

    for (name, value) in &self.headers {
      out.extend_from_slice(name.as_str().as_bytes());
      out.extend_from_slice(b": ");
      out.extend_from_slice(value.as_bytes());
      out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");

    if is_chunked(&self.headers) {
      if !self.body.is_empty() {
        let _ = write!(out, "{:x}\r\n", self.body.len());
        out.extend_from_slice(&self.body);
        out.extend_from_slice(b"\r\n");
      }
      out.extend_from_slice(b"0\r\n\r\n");
    } else {
      out.extend_from_slice(&self.body);
    }

    out
  }

  /// Parse a record as the response to a request made with `method`.
  ///
  /// Body framing follows HTTP/1.1: no body for `HEAD`, 1xx, 204 and 304;
  /// chunked bodies are de-chunked; `Content-Length` bounds the body;
  /// otherwise the body runs to the end of the record.
  pub fn decode(bytes: &[u8], method: &Method) -> Result<Self, DecodeError> {
    let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
    let mut raw = httparse::Response::new(&mut headers);

    let head_len = match raw.parse(bytes)? {
      httparse::Status::Complete(offset) => offset,
      httparse::Status::Partial => return Err(DecodeError::Incomplete),
    };

    let status = StatusCode::from_u16(raw.code.ok_or(DecodeError::Incomplete)?)?;
    let reason = raw
      .reason
      .filter(|reason| !reason.is_empty() && Some(*reason) != status.canonical_reason())
      .map(str::to_owned);
    let version = match raw.version {
      Some(0) => Version::HTTP_10,
      _ => Version::HTTP_11,
    };

    let mut header_map = HeaderMap::with_capacity(raw.headers.len());
    for header in raw.headers.iter() {
      header_map.append(
        HeaderName::from_bytes(header.name.as_bytes())?,
        HeaderValue::from_bytes(header.value)?,
      );
    }

    let rest = &bytes[head_len..];
    let body = if !has_body(method, status) {
      Bytes::new()
    } else if is_chunked(&header_map) {
      dechunk(rest)?
    } else if let Some(expected) = content_length(&header_map)? {
      if rest.len() < expected {
        return Err(DecodeError::Truncated {
          expected,
          actual: rest.len(),
        });
      }
      Bytes::copy_from_slice(&rest[..expected])
    } else {
      Bytes::copy_from_slice(rest)
    };

    Ok(Self {
      status,
      reason,
      version,
      headers: header_map,
      body,
    })
  }
}

fn has_body(method: &Method, status: StatusCode) -> bool {
  *method != Method::HEAD
    && !status.is_informational()
    && status != StatusCode::NO_CONTENT
    && status != StatusCode::NOT_MODIFIED
}

/// Chunked if the final transfer coding is `chunked`.
fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .last()
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.rsplit(',').next())
    .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>, DecodeError> {
  let Some(value) = headers.get(CONTENT_LENGTH) else {
    return Ok(None);
  };
  value
    .to_str()
    .ok()
    .and_then(|value| value.trim().parse().ok())
    .map(Some)
    .ok_or(DecodeError::ContentLength)
}

fn dechunk(mut rest: &[u8]) -> Result<Bytes, DecodeError> {
  let mut body = Vec::with_capacity(rest.len());

  loop {
    let (offset, size) = match httparse::parse_chunk_size(rest) {
      Ok(httparse::Status::Complete(parsed)) => parsed,
      _ => return Err(DecodeError::Chunked),
    };
    rest = &rest[offset..];

    // Trailers after the last chunk are ignored
    if size == 0 {
      return Ok(Bytes::from(body));
    }

    let size = usize::try_from(size).map_err(|_| DecodeError::Chunked)?;
    let end = size.checked_add(2).ok_or(DecodeError::Chunked)?;
    if rest.len() < end || &rest[size..end] != b"\r\n" {
      return Err(DecodeError::Chunked);
    }
    body.extend_from_slice(&rest[..size]);
    rest = &rest[end..];
  }
}
