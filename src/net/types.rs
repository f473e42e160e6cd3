//! Request and response model shared by the worker, the loader and the storage layer.

use bytes::Bytes;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// How the page issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level document navigation
  Navigate,
  Cors,
  /// Cross-origin request whose response the page cannot read
  NoCors,
}

/// What the page expects the response to be used for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  #[default]
  Empty,
  Document,
  Image,
}

/// An outgoing request issued by the page.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
}

impl Request {
  /// Plain GET, as issued by `fetch(url)`.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Cors,
      destination: Destination::Empty,
      headers: Vec::new(),
    }
  }

  /// Top-level navigation to `url`.
  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Navigate,
      destination: Destination::Document,
      headers: vec![("accept".to_string(), "text/html".to_string())],
    }
  }

  #[cfg(test)]
  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  #[cfg(test)]
  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_lowercase(), value.to_string()));
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }

  /// Whether the page expects an image back.
  pub fn expects_image(&self) -> bool {
    if self.destination == Destination::Image {
      return true;
    }
    if self
      .header("accept")
      .is_some_and(|accept| accept.trim_start().starts_with("image/"))
    {
      return true;
    }
    let path = self.url.path().to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
  }
}

const IMAGE_EXTENSIONS: &[&str] = &[
  ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".avif", ".ico",
];

/// Identity of a stored request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_string(),
      url: url.to_string(),
    }
  }

  pub fn get(url: &Url) -> Self {
    Self::new(&Method::GET, url)
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Response classification, mirroring what a browser exposes to the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
  /// Same-origin, fully readable
  Basic,
  /// Cross-origin, readable
  Cors,
  /// Cross-origin, unreadable
  Opaque,
  /// Built locally rather than fetched
  Synthetic,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::Synthetic => "synthetic",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "opaque" => Some(Self::Opaque),
      "synthetic" => Some(Self::Synthetic),
      _ => None,
    }
  }
}

/// A response snapshot: status, headers and the full body.
///
/// Bodies are `Bytes`, so cloning a response to store it costs a refcount bump.
#[derive(Debug, Clone)]
pub struct Response {
  pub url: Url,
  pub status: u16,
  pub kind: ResponseKind,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

/// Body returned for catalog requests when neither network nor cache can answer.
pub const OFFLINE_BODY: &str = r#"{"offline":true}"#;

impl Response {
  pub fn new(url: Url, status: u16, kind: ResponseKind, body: impl Into<Bytes>) -> Self {
    Self {
      url,
      status,
      kind,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_lowercase(), value.to_string()));
    self
  }

  /// Synthetic `{"offline": true}` answer for a catalog request.
  pub fn offline_fallback(url: Url) -> Self {
    Self::new(url, 200, ResponseKind::Synthetic, OFFLINE_BODY)
      .with_header("content-type", "application/json")
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("content-type")
  }

  /// 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Complete, same-origin, status 200. Only these go into the runtime generation.
  pub fn is_storable(&self) -> bool {
    self.status == 200 && self.kind == ResponseKind::Basic
  }

  pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
    serde_json::from_slice(&self.body)
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// Why a fetch produced no response.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(String),

  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("unexpected status {status} for {url}")]
  Status { status: u16, url: String },

  #[error("unsupported request: {0}")]
  Unsupported(String),
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    FetchError::Network(e.to_string())
  }
}
