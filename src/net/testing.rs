//! Scripted network for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use super::client::Network;
use super::types::{FetchError, Request, Response, ResponseKind};

#[derive(Clone)]
enum Route {
  Respond(Response),
  Fail,
  Delay(Duration, Response),
}

/// Per-URL canned responses. Unknown URLs fail like an unreachable host.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Route>>,
  offline: AtomicBool,
  calls: AtomicUsize,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, status: u16, kind: ResponseKind, body: &str) {
    let resp = Response::new(parse(url), status, kind, body.to_string());
    self.set(url, Route::Respond(resp));
  }

  /// Same-origin 200 JSON response.
  pub fn json(&self, url: &str, body: &str) {
    let resp = Response::new(parse(url), 200, ResponseKind::Basic, body.to_string())
      .with_header("content-type", "application/json");
    self.set(url, Route::Respond(resp));
  }

  pub fn fail(&self, url: &str) {
    self.set(url, Route::Fail);
  }

  pub fn delay(&self, url: &str, delay: Duration, body: &str) {
    let resp = Response::new(parse(url), 200, ResponseKind::Basic, body.to_string())
      .with_header("content-type", "application/json");
    self.set(url, Route::Delay(delay, resp));
  }

  /// Make every request fail, regardless of routes.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn set(&self, url: &str, route: Route) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(parse(url).to_string(), route);
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.offline.load(Ordering::SeqCst) {
      return Err(FetchError::Network("offline".to_string()));
    }
    let route = self
      .routes
      .lock()
      .unwrap()
      .get(request.url.as_str())
      .cloned();
    match route {
      Some(Route::Respond(resp)) => Ok(resp),
      Some(Route::Delay(delay, resp)) => {
        tokio::time::sleep(delay).await;
        Ok(resp)
      }
      Some(Route::Fail) | None => Err(FetchError::Network(format!(
        "unreachable: {}",
        request.url
      ))),
    }
  }
}

fn parse(url: &str) -> Url {
  Url::parse(url).unwrap()
}
