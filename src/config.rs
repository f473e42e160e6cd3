use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::catalog::FieldMap;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Site the gallery is served from, e.g. https://videyweb.web.id/
  pub origin: Url,
  /// Tag used to name cache generations. Bump it on deploy.
  #[serde(default = "default_cache_version")]
  pub cache_version: String,
  #[serde(default)]
  pub catalog: CatalogConfig,
  #[serde(default)]
  pub worker: WorkerSettings,
  #[serde(default)]
  pub state: StateConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
  /// Path of the catalog JSON endpoint, relative to the origin
  pub path: String,
  pub timeout_ms: u64,
  /// Local storage key holding the last good catalog
  pub snapshot_key: String,
  pub field_map: FieldMap,
}

impl Default for CatalogConfig {
  fn default() -> Self {
    Self {
      path: "/artifacts.json".to_string(),
      timeout_ms: 7000,
      snapshot_key: "artifacts_cache".to_string(),
      field_map: FieldMap::default(),
    }
  }
}

impl CatalogConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
  /// Application shell served for every navigation
  pub shell: String,
  /// Resources stored at install time, in order
  pub precache: Vec<String>,
  /// Image served when an image can be fetched from neither cache nor network
  pub placeholder_image: Option<String>,
  /// Hosts whose requests bypass the worker (analytics, comments)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub bypass_hosts: BTreeSet<String>,
}

impl Default for WorkerSettings {
  fn default() -> Self {
    Self {
      shell: "/".to_string(),
      precache: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/artifacts.json".to_string(),
        "/manifest.json".to_string(),
      ],
      placeholder_image: None,
      bypass_hosts: BTreeSet::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
  pub history_key: String,
  pub clicks_key: String,
  pub favorites_key: String,
  pub history_limit: usize,
}

impl Default for StateConfig {
  fn default() -> Self {
    Self {
      history_key: "artifact_history".to_string(),
      clicks_key: "artifact_clicks".to_string(),
      favorites_key: "artifact_favorites".to_string(),
      history_limit: 5,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/artcache/cache.db)
  pub path: Option<PathBuf>,
}

fn default_cache_version() -> String {
  "artifact-v1".to_string()
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./artcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/artcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/artcache/config.yaml\n\
                 See artcache.example.yaml for the format."
        ))
      }
    };

    if let Some(version) = Self::cache_version_override() {
      config.cache_version = version;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("artcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("artcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Get a cache version override from the environment.
  ///
  /// Checks ARTCACHE_CACHE_VERSION, so deploys can bump the tag without editing the file.
  pub fn cache_version_override() -> Option<String> {
    std::env::var("ARTCACHE_CACHE_VERSION")
      .ok()
      .map(|v| v.trim().to_string())
      .filter(|v| !v.is_empty())
  }

  pub fn validate(&self) -> Result<()> {
    if !matches!(self.origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", self.origin));
    }
    if self.cache_version.trim().is_empty() {
      return Err(eyre!("cache_version must not be empty"));
    }
    if self.catalog.timeout_ms == 0 {
      return Err(eyre!("catalog.timeout_ms must be greater than zero"));
    }
    Ok(())
  }

  /// Resolve a site path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid resource '{}': {}", path, e))
  }

  pub fn catalog_url(&self) -> Result<Url> {
    self.resolve(&self.catalog.path)
  }
}
