//! `Network` seam and the reqwest-backed HTTP implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderName, HeaderValue};
use tracing::debug;
use url::{Origin, Url};

use super::types::{FetchError, Request, RequestMode, Response, ResponseKind};

/// Anything that can turn a request into a response.
///
/// The HTTP client implements this, and so does the page-side handle of the
/// offline worker, which lets the catalog loader stay unaware of interception.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// HTTP network backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Origin,
}

impl HttpNetwork {
  pub fn new(origin: &Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("artcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: origin.origin(),
    })
  }

  /// Classify the response the way a browser would expose it to the page.
  ///
  /// Decided on the final URL, so a same-origin request redirected to
  /// another host is no longer `Basic`.
  fn kind_for(&self, request: &Request, final_url: &Url) -> ResponseKind {
    if final_url.origin() == self.origin {
      ResponseKind::Basic
    } else if request.mode == RequestMode::NoCors {
      ResponseKind::Opaque
    } else {
      ResponseKind::Cors
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    if !matches!(request.url.scheme(), "http" | "https") {
      return Err(FetchError::Unsupported(format!(
        "scheme {} is not fetchable",
        request.url.scheme()
      )));
    }

    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| FetchError::Unsupported(format!("header {}: {}", name, e)))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| FetchError::Unsupported(format!("header value: {}", e)))?;
      builder = builder.header(name, value);
    }

    let resp = builder.send().await?;
    let status = resp.status().as_u16();
    let url = resp.url().clone();
    let headers = resp
      .headers()
      .iter()
      .filter_map(|(k, v)| {
        v.to_str()
          .ok()
          .map(|v| (k.as_str().to_string(), v.to_string()))
      })
      .collect();

    let kind = self.kind_for(request, &url);
    let body = if kind == ResponseKind::Opaque {
      bytes::Bytes::new()
    } else {
      resp.bytes().await?
    };

    debug!(
      url = %request.url,
      final_url = %url,
      status,
      kind = kind.as_str(),
      "network fetch completed"
    );

    Ok(Response {
      url,
      status: if kind == ResponseKind::Opaque { 0 } else { status },
      kind,
      headers,
      body,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  fn network() -> HttpNetwork {
    HttpNetwork::new(&Url::parse("https://gallery.example.com/").unwrap()).unwrap()
  }

  fn kind(req: &Request) -> ResponseKind {
    network().kind_for(req, &req.url)
  }

  #[test]
  fn test_kind_same_origin_is_basic() {
    let req = Request::get(Url::parse("https://gallery.example.com/artifacts.json").unwrap());
    assert_eq!(kind(&req), ResponseKind::Basic);
  }

  #[test]
  fn test_kind_cross_origin() {
    let url = Url::parse("https://unpkg.com/aos@2.3.1/dist/aos.css").unwrap();
    assert_eq!(kind(&Request::get(url.clone())), ResponseKind::Cors);
    assert_eq!(
      kind(&Request::get(url).with_mode(RequestMode::NoCors)),
      ResponseKind::Opaque
    );
  }

  #[test]
  fn test_kind_follows_final_url() {
    let req = Request::get(Url::parse("https://gallery.example.com/thumbs/1.jpg").unwrap());
    let cdn = Url::parse("https://cdn.example.net/thumbs/1.jpg").unwrap();
    assert_eq!(network().kind_for(&req, &cdn), ResponseKind::Cors);

    let cross = Request::get(Url::parse("https://unpkg.com/x.js").unwrap());
    let back = Url::parse("https://gallery.example.com/x.js").unwrap();
    assert_eq!(network().kind_for(&cross, &back), ResponseKind::Basic);
  }

  /// Serves `/cdn` as a redirect to another host, `/local` as a same-host
  /// redirect, and everything else as a small stylesheet.
  async fn redirect_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
      while let Ok((mut socket, _)) = listener.accept().await {
        tokio::spawn(async move {
          let mut buf = vec![0u8; 4096];
          let mut read = 0;
          loop {
            let n = socket.read(&mut buf[read..]).await.unwrap();
            if n == 0 {
              return;
            }
            read += n;
            if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
              break;
            }
          }
          let head = String::from_utf8_lossy(&buf[..read]).to_string();
          let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

          let reply = match path.as_str() {
            "/cdn" => format!(
              "HTTP/1.1 302 Found\r\nLocation: http://localhost:{}/asset.css\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
              port
            ),
            "/local" => "HTTP/1.1 302 Found\r\nLocation: /asset.css\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
            _ => "HTTP/1.1 200 OK\r\nContent-Type: text/css\r\nContent-Length: 6\r\nConnection: close\r\n\r\nbody{}".to_string(),
          };
          socket.write_all(reply.as_bytes()).await.unwrap();
        });
      }
    });

    port
  }

  #[tokio::test]
  async fn test_redirect_to_other_host_is_not_storable() {
    let port = redirect_server().await;
    let origin = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
    let network = HttpNetwork::new(&origin).unwrap();

    let resp = network
      .fetch(&Request::get(origin.join("/cdn").unwrap()))
      .await
      .unwrap();
    assert_eq!(resp.url.host_str(), Some("localhost"));
    assert_eq!(resp.kind, ResponseKind::Cors);
    assert!(!resp.is_storable());

    let resp = network
      .fetch(&Request::get(origin.join("/local").unwrap()))
      .await
      .unwrap();
    assert_eq!(resp.url.path(), "/asset.css");
    assert_eq!(resp.kind, ResponseKind::Basic);
    assert!(resp.is_storable());
  }

  #[tokio::test]
  async fn test_rejects_non_http_scheme() {
    let req = Request::get(Url::parse("data:text/plain,hello").unwrap());
    let err = network().fetch(&req).await.unwrap_err();
    assert!(matches!(err, FetchError::Unsupported(_)));
  }
}
