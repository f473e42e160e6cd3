//! Catalog loading with a deadline and a last-known-good fallback.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheResult, LocalStore};
use crate::net::{FetchError, Network, Request};

/// Why a fresh catalog could not be used.
#[derive(Debug, Error)]
pub enum LoadError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("catalog is not valid JSON: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("catalog is not an array")]
  NotAnArray,
}

/// Loads the catalog for the page.
///
/// Prefers the network, but any failure (error, non-2xx status, deadline,
/// malformed body) falls back to the snapshot saved by the last good load.
pub struct CatalogLoader<L: LocalStore> {
  client: Arc<dyn Network>,
  store: Arc<L>,
  snapshot_key: String,
}

impl<L: LocalStore> CatalogLoader<L> {
  pub fn new(client: Arc<dyn Network>, store: Arc<L>, snapshot_key: impl Into<String>) -> Self {
    Self {
      client,
      store,
      snapshot_key: snapshot_key.into(),
    }
  }

  /// Load the catalog.
  ///
  /// Returns `None` when the network failed and no snapshot was ever saved;
  /// the caller shows an explicit "no data available offline" state.
  /// A result with `CacheSource::Offline` means the data may be stale.
  pub async fn load(&self, url: &Url, timeout: Duration) -> Option<CacheResult<Vec<Value>>> {
    match self.fetch_fresh(url, timeout).await {
      Ok(records) => {
        self.save_snapshot(&records);
        info!(count = records.len(), "catalog loaded from network");
        Some(CacheResult::from_network(records))
      }
      Err(e) => {
        warn!(url = %url, error = %e, "catalog fetch failed, falling back to snapshot");
        self.read_snapshot()
      }
    }
  }

  /// Race the fetch against the deadline. The losing fetch is dropped, which cancels it.
  async fn fetch_fresh(&self, url: &Url, timeout: Duration) -> Result<Vec<Value>, LoadError> {
    let request = Request::get(url.clone()).with_header("accept", "application/json");

    let response = tokio::select! {
      result = self.client.fetch(&request) => result?,
      _ = tokio::time::sleep(timeout) => return Err(FetchError::Timeout(timeout).into()),
    };

    if !response.is_success() {
      return Err(
        FetchError::Status {
          status: response.status,
          url: url.to_string(),
        }
        .into(),
      );
    }

    match response.json::<Value>()? {
      Value::Array(records) => Ok(records),
      _ => Err(LoadError::NotAnArray),
    }
  }

  fn save_snapshot(&self, records: &[Value]) {
    let serialized = match serde_json::to_string(records) {
      Ok(s) => s,
      Err(e) => {
        warn!(error = %e, "failed to serialize catalog snapshot");
        return;
      }
    };
    if let Err(e) = self.store.set(&self.snapshot_key, &serialized) {
      warn!(key = %self.snapshot_key, error = %e, "failed to persist catalog snapshot");
    }
  }

  fn read_snapshot(&self) -> Option<CacheResult<Vec<Value>>> {
    let stored = match self.store.get(&self.snapshot_key) {
      Ok(Some(stored)) => stored,
      Ok(None) => {
        debug!(key = %self.snapshot_key, "no catalog snapshot saved");
        return None;
      }
      Err(e) => {
        warn!(key = %self.snapshot_key, error = %e, "failed to read catalog snapshot");
        return None;
      }
    };

    match serde_json::from_str::<Vec<Value>>(&stored.value) {
      Ok(records) => Some(CacheResult::offline(records, stored.updated_at)),
      Err(e) => {
        warn!(key = %self.snapshot_key, error = %e, "catalog snapshot is corrupt, discarding");
        if let Err(e) = self.store.remove(&self.snapshot_key) {
          warn!(key = %self.snapshot_key, error = %e, "failed to discard catalog snapshot");
        }
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::net::testing::FakeNetwork;
  use crate::net::ResponseKind;
  use serde_json::json;
  use std::time::Instant;

  const CATALOG: &str = "https://gallery.example.com/artifacts.json";

  fn setup() -> (Arc<FakeNetwork>, Arc<MemoryStorage>, CatalogLoader<MemoryStorage>) {
    let network = Arc::new(FakeNetwork::new());
    let store = Arc::new(MemoryStorage::new());
    let loader = CatalogLoader::new(network.clone(), store.clone(), "artifacts_cache");
    (network, store, loader)
  }

  fn url() -> Url {
    Url::parse(CATALOG).unwrap()
  }

  #[tokio::test]
  async fn test_fresh_load_persists_snapshot() {
    let (network, store, loader) = setup();
    network.json(CATALOG, r#"[{"i":"1"},{"i":"2"}]"#);

    let result = loader.load(&url(), Duration::from_secs(1)).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.len(), 2);

    let saved = store.get("artifacts_cache").unwrap().unwrap();
    assert_eq!(saved.value, r#"[{"i":"1"},{"i":"2"}]"#);
  }

  #[tokio::test]
  async fn test_network_failure_uses_snapshot() {
    let (network, store, loader) = setup();
    store.set("artifacts_cache", r#"[{"i":"old"}]"#).unwrap();
    network.fail(CATALOG);

    let result = loader.load(&url(), Duration::from_secs(1)).await.unwrap();
    assert!(result.is_offline());
    assert_eq!(result.data, vec![json!({"i": "old"})]);
    assert!(result.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_network_failure_without_snapshot_is_empty() {
    let (network, _store, loader) = setup();
    network.fail(CATALOG);
    assert!(loader.load(&url(), Duration::from_secs(1)).await.is_none());
  }

  #[tokio::test]
  async fn test_timeout_falls_back_without_waiting_for_fetch() {
    let (network, store, loader) = setup();
    store.set("artifacts_cache", r#"[{"i":"old"}]"#).unwrap();
    network.delay(CATALOG, Duration::from_millis(500), r#"[{"i":"new"}]"#);

    let started = Instant::now();
    let result = loader.load(&url(), Duration::from_millis(50)).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(400));
    assert!(result.is_offline());
    assert_eq!(result.data, vec![json!({"i": "old"})]);

    // The late response must not overwrite the snapshot
    tokio::time::sleep(Duration::from_millis(550)).await;
    assert_eq!(store.get("artifacts_cache").unwrap().unwrap().value, r#"[{"i":"old"}]"#);
  }

  #[tokio::test]
  async fn test_timeout_without_snapshot_is_empty() {
    let (network, _store, loader) = setup();
    network.delay(CATALOG, Duration::from_millis(200), "[]");
    assert!(loader.load(&url(), Duration::from_millis(20)).await.is_none());
  }

  #[tokio::test]
  async fn test_non_array_is_treated_as_failure() {
    let (network, store, loader) = setup();
    store.set("artifacts_cache", r#"[{"i":"old"}]"#).unwrap();
    network.json(CATALOG, r#"{"offline":true}"#);

    let result = loader.load(&url(), Duration::from_secs(1)).await.unwrap();
    assert!(result.is_offline());
    assert_eq!(result.data, vec![json!({"i": "old"})]);
    // Snapshot untouched
    assert_eq!(store.get("artifacts_cache").unwrap().unwrap().value, r#"[{"i":"old"}]"#);
  }

  #[tokio::test]
  async fn test_malformed_json_and_error_status_fall_back() {
    let (network, _store, loader) = setup();
    network.json(CATALOG, "[{not json");
    assert!(loader.load(&url(), Duration::from_secs(1)).await.is_none());

    network.respond(CATALOG, 500, ResponseKind::Basic, "[]");
    assert!(loader.load(&url(), Duration::from_secs(1)).await.is_none());
  }

  #[tokio::test]
  async fn test_storage_failure_still_returns_data() {
    let (network, store, loader) = setup();
    store.set_fail_writes(true);
    network.json(CATALOG, r#"[{"i":"1"}]"#);

    let result = loader.load(&url(), Duration::from_secs(1)).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.len(), 1);
  }

  #[tokio::test]
  async fn test_corrupt_snapshot_is_ignored() {
    let (network, store, loader) = setup();
    store.set("artifacts_cache", "not json").unwrap();
    network.fail(CATALOG);
    assert!(loader.load(&url(), Duration::from_secs(1)).await.is_none());
    assert!(store.get("artifacts_cache").unwrap().is_none());
  }
}
