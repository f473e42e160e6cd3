//! Request routing classes.

use reqwest::Method;
use std::collections::BTreeSet;
use url::{Origin, Url};

use crate::net::{Request, RequestMode};

/// Fetch policy bucket for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
  /// Same-origin page navigation: serve the app shell
  Navigation,
  /// The catalog endpoint: network first
  DynamicData,
  /// Any other GET: cache first
  StaticGet,
  /// Left to the network untouched
  Unhandled,
}

/// Inputs to classification, fixed per worker version.
#[derive(Debug, Clone)]
pub struct RouteRules {
  pub origin: Origin,
  pub catalog_path: String,
  pub bypass_hosts: BTreeSet<String>,
}

impl RouteRules {
  pub fn new(origin: &Url, catalog: &Url, bypass_hosts: BTreeSet<String>) -> Self {
    Self {
      origin: origin.origin(),
      catalog_path: catalog.path().to_string(),
      bypass_hosts,
    }
  }

  /// Pure function of method, mode and URL.
  pub fn classify(&self, request: &Request) -> RouteClass {
    if request.method != Method::GET {
      return RouteClass::Unhandled;
    }
    if !matches!(request.url.scheme(), "http" | "https") {
      return RouteClass::Unhandled;
    }
    if let Some(host) = request.url.host_str() {
      if self.bypass_hosts.contains(&host.to_lowercase()) {
        return RouteClass::Unhandled;
      }
    }
    let same_origin = request.url.origin() == self.origin;
    if request.mode == RequestMode::Navigate {
      // Navigations away from the site are outside the worker's scope
      if same_origin {
        return RouteClass::Navigation;
      }
      return RouteClass::Unhandled;
    }
    if same_origin && request.url.path() == self.catalog_path {
      return RouteClass::DynamicData;
    }
    RouteClass::StaticGet
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rules() -> RouteRules {
    let origin = Url::parse("https://gallery.example.com/").unwrap();
    let catalog = origin.join("/artifacts.json").unwrap();
    RouteRules::new(
      &origin,
      &catalog,
      ["www.googletagmanager.com".to_string()].into_iter().collect(),
    )
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_navigation() {
    let req = Request::navigate(Url::parse("https://gallery.example.com/some/deep/link").unwrap());
    assert_eq!(rules().classify(&req), RouteClass::Navigation);
  }

  #[test]
  fn test_navigation_to_other_site_is_unhandled() {
    let req = Request::navigate(Url::parse("https://videy.co/v?id=a1").unwrap());
    assert_eq!(rules().classify(&req), RouteClass::Unhandled);
  }

  #[test]
  fn test_catalog_is_dynamic_data_with_query() {
    assert_eq!(
      rules().classify(&get("https://gallery.example.com/artifacts.json?v=3")),
      RouteClass::DynamicData
    );
  }

  #[test]
  fn test_same_path_other_origin_is_static() {
    assert_eq!(
      rules().classify(&get("https://mirror.example.com/artifacts.json")),
      RouteClass::StaticGet
    );
  }

  #[test]
  fn test_static_get() {
    assert_eq!(
      rules().classify(&get("https://gallery.example.com/assets/css/style.css")),
      RouteClass::StaticGet
    );
    assert_eq!(
      rules().classify(&get("https://unpkg.com/aos@2.3.1/dist/aos.js")),
      RouteClass::StaticGet
    );
  }

  #[test]
  fn test_unhandled() {
    let post = get("https://gallery.example.com/artifacts.json").with_method(Method::POST);
    assert_eq!(rules().classify(&post), RouteClass::Unhandled);
    assert_eq!(
      rules().classify(&get("https://WWW.GOOGLETAGMANAGER.COM/gtag/js?id=G-1")),
      RouteClass::Unhandled
    );
    assert_eq!(
      rules().classify(&get("chrome-extension://abc/script.js")),
      RouteClass::Unhandled
    );
  }

  #[test]
  fn test_classification_is_stable() {
    let rules = rules();
    let req = get("https://gallery.example.com/index.html");
    let first = rules.classify(&req);
    for _ in 0..3 {
      assert_eq!(rules.classify(&req), first);
    }
  }
}
