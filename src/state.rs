//! Page state kept in local storage: click counts, recent history, favorites.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

use crate::cache::LocalStore;
use crate::catalog::Artifact;
use crate::config::StateConfig;

/// One recently opened artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
  #[serde(rename = "i")]
  pub id: String,
  #[serde(rename = "t", default)]
  pub title: String,
  #[serde(rename = "l", default)]
  pub link: String,
  #[serde(rename = "ts", with = "chrono::serde::ts_milliseconds")]
  pub opened_at: DateTime<Utc>,
}

pub struct AppState<L: LocalStore> {
  store: Arc<L>,
  config: StateConfig,
  clicks: BTreeMap<String, u64>,
  history: Vec<HistoryEntry>,
  favorites: BTreeSet<String>,
}

impl<L: LocalStore> AppState<L> {
  /// Load state from the store. Missing or corrupt values start empty.
  pub fn load(store: Arc<L>, config: StateConfig) -> Self {
    let clicks = read_json(store.as_ref(), &config.clicks_key);
    let mut history: Vec<HistoryEntry> = read_json(store.as_ref(), &config.history_key);
    history.truncate(config.history_limit);
    let favorites = read_json(store.as_ref(), &config.favorites_key);

    Self {
      store,
      config,
      clicks,
      history,
      favorites,
    }
  }

  /// Record that an artifact was opened.
  ///
  /// Moves it to the front of the history and bumps its click count.
  pub fn record_click(&mut self, artifact: &Artifact) -> Result<()> {
    self.history.retain(|h| h.id != artifact.id);
    self.history.insert(
      0,
      HistoryEntry {
        id: artifact.id.clone(),
        title: artifact.title.clone(),
        link: artifact.link.clone(),
        opened_at: Utc::now(),
      },
    );
    self.history.truncate(self.config.history_limit);
    *self.clicks.entry(artifact.id.clone()).or_insert(0) += 1;

    write_json(self.store.as_ref(), &self.config.history_key, &self.history)?;
    write_json(self.store.as_ref(), &self.config.clicks_key, &self.clicks)
  }

  /// Toggle a favorite. Returns whether the artifact is now a favorite.
  pub fn toggle_favorite(&mut self, id: &str) -> Result<bool> {
    let now_favorite = if self.favorites.remove(id) {
      false
    } else {
      self.favorites.insert(id.to_string());
      true
    };
    write_json(self.store.as_ref(), &self.config.favorites_key, &self.favorites)?;
    Ok(now_favorite)
  }

  pub fn clicks(&self, id: &str) -> u64 {
    self.clicks.get(id).copied().unwrap_or(0)
  }

  pub fn all_clicks(&self) -> &BTreeMap<String, u64> {
    &self.clicks
  }

  /// Most recent first.
  pub fn history(&self) -> &[HistoryEntry] {
    &self.history
  }

  pub fn is_favorite(&self, id: &str) -> bool {
    self.favorites.contains(id)
  }

  pub fn favorites(&self) -> &BTreeSet<String> {
    &self.favorites
  }
}

fn read_json<T: DeserializeOwned + Default>(store: &impl LocalStore, key: &str) -> T {
  let stored = match store.get(key) {
    Ok(Some(stored)) => stored,
    Ok(None) => return T::default(),
    Err(e) => {
      warn!(key, error = %e, "failed to read page state");
      return T::default();
    }
  };

  serde_json::from_str(&stored.value).unwrap_or_else(|e| {
    warn!(key, error = %e, "discarding corrupt page state");
    T::default()
  })
}

fn write_json<T: Serialize>(store: &impl LocalStore, key: &str, value: &T) -> Result<()> {
  store.set(key, &serde_json::to_string(value)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;

  fn artifact(id: &str) -> Artifact {
    Artifact {
      id: id.to_string(),
      title: format!("Artifact {}", id),
      thumbnail: String::new(),
      link: format!("https://example.com/{}", id),
    }
  }

  fn load(store: &Arc<MemoryStorage>) -> AppState<MemoryStorage> {
    AppState::load(store.clone(), StateConfig::default())
  }

  #[test]
  fn test_empty_store_loads_empty_state() {
    let state = load(&Arc::new(MemoryStorage::new()));
    assert!(state.history().is_empty());
    assert!(state.all_clicks().is_empty());
    assert!(state.favorites().is_empty());
  }

  #[test]
  fn test_click_updates_history_and_counts() {
    let store = Arc::new(MemoryStorage::new());
    let mut state = load(&store);

    state.record_click(&artifact("1")).unwrap();
    state.record_click(&artifact("2")).unwrap();
    state.record_click(&artifact("1")).unwrap();

    let ids: Vec<_> = state.history().iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2"]);
    assert_eq!(state.clicks("1"), 2);
    assert_eq!(state.clicks("2"), 1);
    assert_eq!(state.clicks("3"), 0);
  }

  #[test]
  fn test_history_is_capped() {
    let store = Arc::new(MemoryStorage::new());
    let mut state = load(&store);

    for id in 0..8 {
      state.record_click(&artifact(&id.to_string())).unwrap();
    }

    let ids: Vec<_> = state.history().iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["7", "6", "5", "4", "3"]);
    assert_eq!(state.all_clicks().len(), 8);
  }

  #[test]
  fn test_state_survives_reload() {
    let store = Arc::new(MemoryStorage::new());
    let mut state = load(&store);
    state.record_click(&artifact("a")).unwrap();
    assert!(state.toggle_favorite("a").unwrap());

    let reloaded = load(&store);
    assert_eq!(reloaded.history().len(), 1);
    assert_eq!(reloaded.history()[0].title, "Artifact a");
    assert_eq!(reloaded.clicks("a"), 1);
    assert!(reloaded.is_favorite("a"));
  }

  #[test]
  fn test_history_uses_short_keys() {
    let store = Arc::new(MemoryStorage::new());
    let mut state = load(&store);
    state.record_click(&artifact("x")).unwrap();

    let raw = store.get("artifact_history").unwrap().unwrap().value;
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value[0]["i"], "x");
    assert_eq!(value[0]["l"], "https://example.com/x");
    assert!(value[0]["ts"].is_i64());
  }

  #[test]
  fn test_toggle_favorite() {
    let store = Arc::new(MemoryStorage::new());
    let mut state = load(&store);
    assert!(state.toggle_favorite("a").unwrap());
    assert!(!state.toggle_favorite("a").unwrap());
    assert!(!state.is_favorite("a"));
  }

  #[test]
  fn test_corrupt_values_load_as_empty() {
    let store = Arc::new(MemoryStorage::new());
    store.set("artifact_history", "{not json").unwrap();
    store.set("artifact_clicks", "[1,2]").unwrap();
    store.set("artifact_favorites", "null").unwrap();

    let mut state = load(&store);
    assert!(state.history().is_empty());
    assert!(state.all_clicks().is_empty());
    assert!(state.favorites().is_empty());

    state.record_click(&artifact("1")).unwrap();
    assert_eq!(load(&store).clicks("1"), 1);
  }

  #[test]
  fn test_write_failure_is_reported() {
    let store = Arc::new(MemoryStorage::new());
    store.set_fail_writes(true);
    let mut state = load(&store);
    assert!(state.record_click(&artifact("1")).is_err());
  }
}
