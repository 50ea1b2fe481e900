//! Request and response snapshots exchanged between pages, the agent and the network.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Header list in wire order. Names are kept as received.
pub type Headers = Vec<(String, String)>;

/// How a body is carried inside a JSON line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
  #[default]
  Utf8,
  Base64,
}

impl BodyEncoding {
  /// Valid UTF-8 travels as text, anything else as base64.
  pub fn encode(body: &[u8]) -> (String, Self) {
    match std::str::from_utf8(body) {
      Ok(text) => (text.to_string(), Self::Utf8),
      Err(_) => (STANDARD.encode(body), Self::Base64),
    }
  }

  pub fn decode(self, body: String) -> Result<Bytes, base64::DecodeError> {
    match self {
      Self::Utf8 => Ok(Bytes::from(body)),
      Self::Base64 => STANDARD.decode(body).map(Bytes::from),
    }
  }
}

/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Bytes,
}

impl Request {
  /// A bodiless GET, the only kind of request that is ever cached.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: Vec::new(),
      body: Bytes::new(),
    }
  }

  #[cfg(test)]
  pub fn post(url: Url, body: impl Into<Bytes>) -> Self {
    Self {
      method: Method::POST,
      url,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// Identity of this request inside a cache partition.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Cache identity of a request: method + URL, fragment excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_string(),
      url: url.into(),
    }
  }

  /// SHA256 hash for stable, fixed-length keys.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }
}

/// A response snapshot. The body is immutable; cloning shares the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
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

  #[cfg(test)]
  pub fn ok(body: impl Into<Bytes>) -> Self {
    Self::new(200, body)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Only 2xx responses are written to a partition.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  #[cfg(test)]
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_key_ignores_fragment() {
    let a = Request::get(url("https://app.test/docs#intro")).key();
    let b = Request::get(url("https://app.test/docs")).key();
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_key_depends_on_method_and_query() {
    let get = Request::get(url("https://app.test/api/items?page=1")).key();
    let post = Request::post(url("https://app.test/api/items?page=1"), "").key();
    let other_page = Request::get(url("https://app.test/api/items?page=2")).key();
    assert_ne!(get.cache_hash(), post.cache_hash());
    assert_ne!(get.cache_hash(), other_page.cache_hash());
    assert_eq!(get.cache_hash().len(), 64);
  }

  #[test]
  fn test_success_range() {
    assert!(Response::new(200, "").is_success());
    assert!(Response::new(204, "").is_success());
    assert!(!Response::new(304, "").is_success());
    assert!(!Response::new(404, "").is_success());
    assert!(!Response::new(503, "").is_success());
  }

  #[test]
  fn test_binary_bodies_are_base64() {
    let png: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    let (text, encoding) = BodyEncoding::encode(png);
    assert_eq!(encoding, BodyEncoding::Base64);
    assert_eq!(text, "iVBORw0KGgo=");
    assert_eq!(encoding.decode(text).unwrap().as_ref(), png);

    let (text, encoding) = BodyEncoding::encode("héllo".as_bytes());
    assert_eq!((text.as_str(), encoding), ("héllo", BodyEncoding::Utf8));
    assert!(BodyEncoding::Base64.decode("not base64!".into()).is_err());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let response = Response::ok("x").with_header("Content-Type", "text/plain");
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.header("etag"), None);
  }
}
