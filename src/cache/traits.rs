//! Core types for the caching system.

use chrono::{DateTime, Utc};

use crate::net::{RequestKey, Response};

/// A stored response together with the generation that holds it.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub generation: String,
  pub key: RequestKey,
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// A value held in the local key/value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
  pub value: String,
  pub updated_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_offline(&self) -> bool {
    self.source == CacheSource::Offline
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Offline mode - network unavailable, serving the last saved copy
  Offline,
}
